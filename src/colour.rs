//! Colour conversion used by the save pipeline.
//!
//! The pipeline only decides *which* conversion it needs; the numbers come
//! from a [`ColourEngine`]. [`BuiltinColour`] covers the common spaces with
//! sRGB primaries and a naive CMYK model. Callers with a real CMS can plug
//! their own engine in through [`SaveOptions`](crate::SaveOptions).

use moxcms::{ColorProfile, DataColorSpace, Layout, TransformOptions};

use crate::coding;
use crate::error::ForeignError;
use crate::format::{BandFormat, Interpretation};
use crate::image::{meta, Image, ImageHeader};
use crate::ops;

/// Colour transforms the save pipeline relies on.
pub trait ColourEngine: Send + Sync {
    /// Convert to `target`, keeping any extra (alpha) bands.
    fn colourspace(&self, image: &Image, target: Interpretation) -> Result<Image, ForeignError>;

    /// Bring a CMYK image into the profile connection space (float XYZ).
    fn icc_import(&self, image: &Image) -> Result<Image, ForeignError>;

    /// Export to CMYK with `depth` bits per sample (8 or 16).
    fn icc_export(&self, image: &Image, depth: u32) -> Result<Image, ForeignError>;

    /// Could `profile` be attached to `image` without a codec rejecting it?
    fn is_compatible_profile(&self, image: &Image, profile: &[u8]) -> bool;
}

/// Built-in engine: sRGB/D65 matrices and a device CMYK model.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinColour;

// sRGB primaries, D65 white.
const RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.412453, 0.357580, 0.180423],
    [0.212671, 0.715160, 0.072169],
    [0.019334, 0.119193, 0.950227],
];

const XYZ_TO_RGB: [[f64; 3]; 3] = [
    [3.240479, -1.537150, -0.498535],
    [-0.969256, 1.875991, 0.041556],
    [0.055648, -0.204043, 1.057311],
];

const WHITE: [f64; 3] = [0.950456, 1.0, 1.088754];

fn srgb_to_linear(v: f64) -> f64 {
    f64::from(linear_srgb::default::srgb_to_linear(v as f32))
}

fn linear_to_srgb(v: f64) -> f64 {
    f64::from(linear_srgb::default::linear_to_srgb(v.max(0.0) as f32))
}

fn mul(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn lab_f(t: f64) -> f64 {
    if t > 0.008856 {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

fn lab_f_inv(t: f64) -> f64 {
    if t > 0.206893 {
        t * t * t
    } else {
        (t - 16.0 / 116.0) / 7.787
    }
}

/// XYZ with white Y = 1 to CIELAB.
fn xyz_to_lab(xyz: [f64; 3]) -> [f64; 3] {
    let fx = lab_f(xyz[0] / WHITE[0]);
    let fy = lab_f(xyz[1] / WHITE[1]);
    let fz = lab_f(xyz[2] / WHITE[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

fn lab_to_xyz(lab: [f64; 3]) -> [f64; 3] {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = lab[1] / 500.0 + fy;
    let fz = fy - lab[2] / 200.0;
    [
        lab_f_inv(fx) * WHITE[0],
        lab_f_inv(fy) * WHITE[1],
        lab_f_inv(fz) * WHITE[2],
    ]
}

/// Full-scale value of a colour sample in this space and format.
fn sample_scale(interpretation: Interpretation, format: BandFormat) -> f64 {
    match interpretation {
        Interpretation::Grey16 | Interpretation::Rgb16 => 65535.0,
        _ if format == BandFormat::UShort => 65535.0,
        _ => 255.0,
    }
}

/// Output format a colourspace target is produced in.
fn target_format(target: Interpretation) -> Option<BandFormat> {
    match target {
        Interpretation::BW | Interpretation::Srgb | Interpretation::Rgb | Interpretation::Cmyk => {
            Some(BandFormat::UChar)
        }
        Interpretation::Grey16 | Interpretation::Rgb16 => Some(BandFormat::UShort),
        Interpretation::ScRgb | Interpretation::Xyz | Interpretation::Lab => Some(BandFormat::Float),
        _ => None,
    }
}

/// Colour bands of one pixel to gamma-encoded sRGB in 0..1.
fn to_srgb(pixel: &[f64], from: Interpretation, scale: f64) -> Option<[f64; 3]> {
    let rgb = match from {
        Interpretation::BW | Interpretation::Grey16 => {
            let v = pixel[0] / scale;
            [v, v, v]
        }
        Interpretation::Srgb | Interpretation::Rgb | Interpretation::Rgb16 => {
            [pixel[0] / scale, pixel[1] / scale, pixel[2] / scale]
        }
        Interpretation::ScRgb => [
            linear_to_srgb(pixel[0]),
            linear_to_srgb(pixel[1]),
            linear_to_srgb(pixel[2]),
        ],
        Interpretation::Xyz => {
            let linear = mul(&XYZ_TO_RGB, [pixel[0] / 100.0, pixel[1] / 100.0, pixel[2] / 100.0]);
            linear.map(linear_to_srgb)
        }
        Interpretation::Lab => {
            let linear = mul(&XYZ_TO_RGB, lab_to_xyz([pixel[0], pixel[1], pixel[2]]));
            linear.map(linear_to_srgb)
        }
        Interpretation::Cmyk => {
            let k = 1.0 - pixel[3] / scale;
            [
                (1.0 - pixel[0] / scale) * k,
                (1.0 - pixel[1] / scale) * k,
                (1.0 - pixel[2] / scale) * k,
            ]
        }
        _ => return None,
    };
    Some(rgb.map(|v| v.clamp(0.0, 1.0)))
}

/// Gamma-encoded sRGB in 0..1 to the colour bands of `to`.
fn from_srgb(rgb: [f64; 3], to: Interpretation, out: &mut Vec<f64>) {
    let linear = rgb.map(srgb_to_linear);
    match to {
        Interpretation::BW | Interpretation::Grey16 => {
            let y = 0.2126 * linear[0] + 0.7152 * linear[1] + 0.0722 * linear[2];
            out.push(linear_to_srgb(y) * sample_scale(to, BandFormat::UChar));
        }
        Interpretation::Srgb | Interpretation::Rgb | Interpretation::Rgb16 => {
            let scale = sample_scale(to, BandFormat::UChar);
            out.extend(rgb.iter().map(|v| v * scale));
        }
        Interpretation::ScRgb => out.extend_from_slice(&linear),
        Interpretation::Xyz => out.extend(mul(&RGB_TO_XYZ, linear).iter().map(|v| v * 100.0)),
        Interpretation::Lab => out.extend_from_slice(&xyz_to_lab(mul(&RGB_TO_XYZ, linear))),
        _ => {
            let k = 1.0 - rgb[0].max(rgb[1]).max(rgb[2]);
            if k >= 1.0 {
                out.extend_from_slice(&[0.0, 0.0, 0.0, 1.0]);
            } else {
                out.extend(rgb.iter().map(|v| (1.0 - v - k) / (1.0 - k)));
                out.push(k);
            }
        }
    }
}

impl BuiltinColour {
    /// Run every pixel through sRGB into `to`, writing `format`.
    fn convert(
        &self,
        image: &Image,
        to: Interpretation,
        format: BandFormat,
        cmyk_scale: f64,
    ) -> Result<Image, ForeignError> {
        let image = coding::decode(image)?;
        let header = *image.header();
        let from = header.guess_interpretation();
        let colour_in = from.colour_bands() as usize;
        let bands = header.bands as usize;
        if colour_in == 0 || bands < colour_in {
            return Err(ForeignError::Colour {
                from,
                to,
                detail: "no colour bands to convert",
            });
        }

        let scale = sample_scale(from, header.format);
        let extra_scale = to.max_alpha() / from.max_alpha();
        let colour_out = to.colour_bands() as usize;
        let values = ops::samples(&image)?;
        let mut out = Vec::with_capacity(values.len() / bands * (colour_out + bands - colour_in));

        for pixel in values.chunks_exact(bands) {
            let rgb = to_srgb(&pixel[..colour_in], from, scale).ok_or(ForeignError::Colour {
                from,
                to,
                detail: "unsupported source space",
            })?;
            let start = out.len();
            from_srgb(rgb, to, &mut out);
            if to == Interpretation::Cmyk {
                for v in &mut out[start..] {
                    *v *= cmyk_scale;
                }
            }
            out.extend(pixel[colour_in..].iter().map(|v| v * extra_scale));
        }

        let mut header: ImageHeader = header;
        header.bands = (colour_out + bands - colour_in) as u32;
        header.format = format;
        header.interpretation = to;
        image.derive(header, ops::encode_samples(&header, &out))
    }
}

impl ColourEngine for BuiltinColour {
    fn colourspace(&self, image: &Image, target: Interpretation) -> Result<Image, ForeignError> {
        let from = image.header().guess_interpretation();
        if from == target && image.coding() == crate::format::Coding::None {
            return Ok(image.clone());
        }
        let format = target_format(target).ok_or(ForeignError::Colour {
            from,
            to: target,
            detail: "unsupported target space",
        })?;
        self.convert(image, target, format, 255.0)
    }

    fn icc_import(&self, image: &Image) -> Result<Image, ForeignError> {
        match embedded_profile(image, DataColorSpace::Cmyk) {
            Some(profile) => import_with_profile(image, &profile),
            None => self.convert(image, Interpretation::Xyz, BandFormat::Float, 1.0),
        }
    }

    fn icc_export(&self, image: &Image, depth: u32) -> Result<Image, ForeignError> {
        let (format, scale) = if depth == 16 {
            (BandFormat::UShort, 65535.0)
        } else {
            (BandFormat::UChar, 255.0)
        };
        self.convert(image, Interpretation::Cmyk, format, scale)
    }

    fn is_compatible_profile(&self, image: &Image, profile: &[u8]) -> bool {
        let Ok(profile) = ColorProfile::new_from_slice(profile) else {
            return false;
        };
        let header = image.header();
        let colour = header.bands - u32::from(header.has_alpha());
        match profile.color_space {
            DataColorSpace::Gray => colour == 1,
            DataColorSpace::Rgb | DataColorSpace::Lab | DataColorSpace::Xyz => colour == 3,
            DataColorSpace::Cmyk => colour == 4,
            _ => false,
        }
    }
}

/// The image's attached ICC profile, if it parses and describes `space`.
fn embedded_profile(image: &Image, space: DataColorSpace) -> Option<ColorProfile> {
    let bytes = image.get_blob(meta::ICC)?;
    match ColorProfile::new_from_slice(bytes) {
        Ok(profile) if profile.color_space == space => Some(profile),
        Ok(profile) => {
            log::debug!("ignoring {:?} profile on a CMYK import", profile.color_space);
            None
        }
        Err(e) => {
            log::debug!("unusable ICC profile: {e:?}");
            None
        }
    }
}

/// CMYK to float XYZ through `profile`, via sRGB.
fn import_with_profile(image: &Image, profile: &ColorProfile) -> Result<Image, ForeignError> {
    let failed = |detail| ForeignError::Colour {
        from: Interpretation::Cmyk,
        to: Interpretation::Xyz,
        detail,
    };
    let transform = profile
        .create_transform_f32(
            Layout::Rgba,
            &ColorProfile::new_srgb(),
            Layout::Rgb,
            TransformOptions::default(),
        )
        .map_err(|_| failed("no CMYK transform for this profile"))?;

    let image = coding::decode(image)?;
    let header = *image.header();
    let bands = header.bands as usize;
    if bands < 4 {
        return Err(failed("CMYK needs four bands"));
    }
    let scale = sample_scale(Interpretation::Cmyk, header.format);
    let values = ops::samples(&image)?;

    let ink: Vec<f32> = values
        .chunks_exact(bands)
        .flat_map(|pixel| pixel[..4].iter().map(|v| (v / scale) as f32))
        .collect();
    let mut rgb = vec![0f32; ink.len() / 4 * 3];
    transform
        .transform(&ink, &mut rgb)
        .map_err(|_| failed("ICC transform failed"))?;

    let extra_scale = Interpretation::Xyz.max_alpha() / Interpretation::Cmyk.max_alpha();
    let mut out = Vec::with_capacity(values.len() / bands * (bands - 1));
    for (pixel, rgb) in values.chunks_exact(bands).zip(rgb.chunks_exact(3)) {
        let rgb = [rgb[0], rgb[1], rgb[2]].map(|v| f64::from(v).clamp(0.0, 1.0));
        from_srgb(rgb, Interpretation::Xyz, &mut out);
        out.extend(pixel[4..].iter().map(|v| v * extra_scale));
    }

    let mut header = header;
    header.bands -= 1;
    header.format = BandFormat::Float;
    header.interpretation = Interpretation::Xyz;
    image.derive(header, ops::encode_samples(&header, &out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bands: u32, format: BandFormat, interpretation: Interpretation, values: &[f64]) -> Image {
        let header = ImageHeader::new(values.len() as u32 / bands, 1, bands, format)
            .with_interpretation(interpretation);
        Image::from_bytes(header, ops::encode_samples(&header, values)).unwrap()
    }

    use crate::testing::icc_header as profile;

    #[test]
    fn srgb_to_rgb16_scales_exactly() {
        let rgb = image(3, BandFormat::UChar, Interpretation::Srgb, &[0.0, 128.0, 255.0]);
        let wide = BuiltinColour.colourspace(&rgb, Interpretation::Rgb16).unwrap();
        assert_eq!(wide.format(), BandFormat::UShort);
        assert_eq!(ops::samples(&wide).unwrap(), vec![0.0, 128.0 * 257.0, 65535.0]);
    }

    #[test]
    fn grey_replicates_to_rgb_and_back() {
        let grey = image(2, BandFormat::UChar, Interpretation::BW, &[77.0, 200.0]);
        let rgb = BuiltinColour.colourspace(&grey, Interpretation::Srgb).unwrap();
        assert_eq!(rgb.bands(), 4);
        assert_eq!(ops::samples(&rgb).unwrap(), vec![77.0, 77.0, 77.0, 200.0]);

        let back = BuiltinColour.colourspace(&rgb, Interpretation::BW).unwrap();
        assert_eq!(ops::samples(&back).unwrap(), vec![77.0, 200.0]);
    }

    #[test]
    fn cmyk_import_then_rgb_is_white_for_no_ink() {
        let cmyk = image(4, BandFormat::UChar, Interpretation::Cmyk, &[0.0, 0.0, 0.0, 0.0]);
        let xyz = BuiltinColour.icc_import(&cmyk).unwrap();
        assert_eq!(xyz.interpretation(), Interpretation::Xyz);
        let rgb = BuiltinColour.colourspace(&xyz, Interpretation::Srgb).unwrap();
        for v in ops::samples(&rgb).unwrap() {
            assert!(v >= 254.0, "{v}");
        }
    }

    #[test]
    fn export_to_cmyk_sixteen_bit() {
        let rgb = image(3, BandFormat::UChar, Interpretation::Srgb, &[0.0, 0.0, 0.0]);
        let cmyk = BuiltinColour.icc_export(&rgb, 16).unwrap();
        assert_eq!(cmyk.format(), BandFormat::UShort);
        assert_eq!(cmyk.interpretation(), Interpretation::Cmyk);
        assert_eq!(ops::samples(&cmyk).unwrap(), vec![0.0, 0.0, 0.0, 65535.0]);
    }

    #[test]
    fn lab_round_trip_through_srgb() {
        let rgb = image(3, BandFormat::UChar, Interpretation::Srgb, &[200.0, 30.0, 90.0]);
        let lab = BuiltinColour.colourspace(&rgb, Interpretation::Lab).unwrap();
        let back = BuiltinColour.colourspace(&lab, Interpretation::Srgb).unwrap();
        let values = ops::samples(&back).unwrap();
        assert!((values[0] - 200.0).abs() <= 1.0);
        assert!((values[1] - 30.0).abs() <= 1.0);
        assert!((values[2] - 90.0).abs() <= 1.0);
    }

    #[test]
    fn profile_compatibility_follows_colour_bands() {
        let rgba = image(4, BandFormat::UChar, Interpretation::Srgb, &[0.0; 4]);
        assert!(BuiltinColour.is_compatible_profile(&rgba, &profile(b"RGB ")));
        assert!(!BuiltinColour.is_compatible_profile(&rgba, &profile(b"CMYK")));
        assert!(!BuiltinColour.is_compatible_profile(&rgba, &profile(b"GRAY")));
        assert!(!BuiltinColour.is_compatible_profile(&rgba, b"short"));

        let grey = image(1, BandFormat::UChar, Interpretation::BW, &[0.0]);
        assert!(BuiltinColour.is_compatible_profile(&grey, &profile(b"GRAY")));
    }

    #[test]
    fn unparsable_profile_is_never_compatible() {
        let rgb = image(3, BandFormat::UChar, Interpretation::Srgb, &[0.0; 3]);
        let mut bad = profile(b"RGB ");
        bad[36..40].copy_from_slice(b"nope");
        assert!(!BuiltinColour.is_compatible_profile(&rgb, &bad));

        let mut garbage = vec![0u8; 128];
        garbage[16..20].copy_from_slice(b"RGB ");
        assert!(!BuiltinColour.is_compatible_profile(&rgb, &garbage));
    }

    #[test]
    fn cmyk_with_unusable_profile_imports_naively() {
        let mut cmyk = image(4, BandFormat::UChar, Interpretation::Cmyk, &[0.0; 4]);
        cmyk.set_blob(meta::ICC, &profile(b"RGB "));
        let xyz = BuiltinColour.icc_import(&cmyk).unwrap();
        assert_eq!(xyz.header().interpretation, Interpretation::Xyz);
        assert_eq!(xyz.header().format, BandFormat::Float);
        assert_eq!(xyz.header().bands, 3);
        let values = ops::samples(&xyz).unwrap();
        assert!((values[1] - 100.0).abs() < 0.5, "Y of white paper was {}", values[1]);
    }

    #[test]
    fn transfer_functions_invert() {
        for v in [0.0, 0.02, 0.2, 0.5, 0.8, 1.0] {
            assert!((linear_to_srgb(srgb_to_linear(v)) - v).abs() < 1e-3);
        }
        assert!((srgb_to_linear(0.5) - 0.214).abs() < 1e-3);
    }
}
