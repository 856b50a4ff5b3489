//! Packed pixel codings: quantized Lab (LabQ) and Radiance RGBE (Rad).
//!
//! Both pack a pixel into four unsigned bytes. Unpacking produces a
//! three-band float image.

use crate::error::ForeignError;
use crate::format::{BandFormat, Coding, Interpretation};
use crate::image::{Image, ImageHeader};
use crate::ops;

/// Unpack a coded image to plain numeric bands.
pub(crate) fn decode(image: &Image) -> Result<Image, ForeignError> {
    match image.coding() {
        Coding::None => Ok(image.clone()),
        Coding::LabQ => labq_to_lab(image),
        Coding::Rad => rad_to_float(image),
    }
}

/// Pack an unpacked image into `coding`.
pub(crate) fn encode(image: &Image, coding: Coding) -> Result<Image, ForeignError> {
    match coding {
        Coding::None => decode(image),
        Coding::LabQ => lab_to_labq(image),
        Coding::Rad => float_to_rad(image),
    }
}

fn coded_bytes(image: &Image) -> Result<Vec<u8>, ForeignError> {
    if image.bands() != 4 || image.format() != BandFormat::UChar {
        return Err(ForeignError::InvalidInput(format!(
            "{:?} coded image must be 4-band uchar",
            image.coding()
        )));
    }
    image.to_bytes()
}

fn unpacked_colour(image: &Image, to: Coding) -> Result<Vec<f64>, ForeignError> {
    if image.coding() != Coding::None || image.bands() < 3 {
        return Err(ForeignError::Cast {
            from: image.format(),
            to: BandFormat::UChar,
            coding: to,
        });
    }
    let bands = image.bands() as usize;
    let values = ops::samples(image)?;
    Ok(values
        .chunks_exact(bands)
        .flat_map(|pixel| pixel[..3].iter().copied())
        .collect())
}

fn float_header(image: &Image, interpretation: Interpretation) -> ImageHeader {
    let mut header = *image.header();
    header.bands = 3;
    header.format = BandFormat::Float;
    header.coding = Coding::None;
    header.interpretation = interpretation;
    header
}

fn coded_header(image: &Image, coding: Coding, interpretation: Interpretation) -> ImageHeader {
    let mut header = *image.header();
    header.bands = 4;
    header.format = BandFormat::UChar;
    header.coding = coding;
    header.interpretation = interpretation;
    header
}

/// LabQ to float CIELAB.
///
/// L is 10 bits (8 in byte 0, 2 in the top of byte 3); a and b are signed
/// 11 bits (8 in bytes 1 and 2, 3 each in the rest of byte 3).
pub(crate) fn labq_to_lab(image: &Image) -> Result<Image, ForeignError> {
    let bytes = coded_bytes(image)?;
    let mut lab = Vec::with_capacity(bytes.len() / 4 * 3);
    for p in bytes.chunks_exact(4) {
        let ext = p[3];
        let l = (i32::from(p[0]) << 2) | i32::from(ext >> 6);
        let a = (i32::from(p[1] as i8) << 3) | i32::from((ext >> 3) & 7);
        let b = (i32::from(p[2] as i8) << 3) | i32::from(ext & 7);
        lab.push(f64::from(l) * 100.0 / 1023.0);
        lab.push(f64::from(a) / 8.0);
        lab.push(f64::from(b) / 8.0);
    }
    let header = float_header(image, Interpretation::Lab);
    image.derive(header, ops::encode_samples(&header, &lab))
}

/// Float CIELAB (first three bands) to LabQ.
pub(crate) fn lab_to_labq(image: &Image) -> Result<Image, ForeignError> {
    let lab = unpacked_colour(image, Coding::LabQ)?;
    let mut out = Vec::with_capacity(lab.len() / 3 * 4);
    for p in lab.chunks_exact(3) {
        let l = (p[0] * 10.23).round().clamp(0.0, 1023.0) as i32;
        let a = (p[1] * 8.0).round().clamp(-1024.0, 1023.0) as i32;
        let b = (p[2] * 8.0).round().clamp(-1024.0, 1023.0) as i32;
        out.push((l >> 2) as u8);
        out.push(((a >> 3) as i8) as u8);
        out.push(((b >> 3) as i8) as u8);
        out.push((((l & 3) << 6) | ((a & 7) << 3) | (b & 7)) as u8);
    }
    let header = coded_header(image, Coding::LabQ, Interpretation::LabQ);
    image.derive(header, out)
}

/// Split a positive value into mantissa in [0.5, 1) and exponent.
fn frexp(value: f64) -> (f64, i32) {
    let mut exp = value.log2().floor() as i32 + 1;
    let mut mant = value / 2f64.powi(exp);
    if mant >= 1.0 {
        mant /= 2.0;
        exp += 1;
    } else if mant < 0.5 {
        mant *= 2.0;
        exp -= 1;
    }
    (mant, exp)
}

/// Radiance RGBE to float RGB.
pub(crate) fn rad_to_float(image: &Image) -> Result<Image, ForeignError> {
    let bytes = coded_bytes(image)?;
    let mut rgb = Vec::with_capacity(bytes.len() / 4 * 3);
    for p in bytes.chunks_exact(4) {
        if p[3] == 0 {
            rgb.extend_from_slice(&[0.0; 3]);
        } else {
            let f = 2f64.powi(i32::from(p[3]) - (128 + 8));
            rgb.extend(p[..3].iter().map(|&c| (f64::from(c) + 0.5) * f));
        }
    }
    let header = float_header(image, image.interpretation());
    image.derive(header, ops::encode_samples(&header, &rgb))
}

/// Float RGB (first three bands) to Radiance RGBE.
pub(crate) fn float_to_rad(image: &Image) -> Result<Image, ForeignError> {
    let rgb = unpacked_colour(image, Coding::Rad)?;
    let mut out = Vec::with_capacity(rgb.len() / 3 * 4);
    for p in rgb.chunks_exact(3) {
        let max = p[0].max(p[1]).max(p[2]);
        if max < 1e-32 {
            out.extend_from_slice(&[0; 4]);
        } else {
            let (mant, exp) = frexp(max);
            let scale = mant * 256.0 / max;
            out.extend(p.iter().map(|&c| (c.max(0.0) * scale) as u8));
            out.push((exp + 128).clamp(0, 255) as u8);
        }
    }
    let interpretation = match image.interpretation() {
        Interpretation::Xyz => Interpretation::Xyz,
        _ => Interpretation::ScRgb,
    };
    let header = coded_header(image, Coding::Rad, interpretation);
    image.derive(header, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_image(values: &[f64], interpretation: Interpretation) -> Image {
        let header = ImageHeader::new(values.len() as u32 / 3, 1, 3, BandFormat::Float)
            .with_interpretation(interpretation);
        Image::from_bytes(header, ops::encode_samples(&header, values)).unwrap()
    }

    #[test]
    fn labq_keeps_ten_and_eleven_bits() {
        let lab = float_image(&[50.0, -20.25, 33.5, 100.0, 0.0, 0.0], Interpretation::Lab);
        let packed = lab_to_labq(&lab).unwrap();
        assert_eq!(packed.coding(), Coding::LabQ);
        assert_eq!(packed.bands(), 4);

        let unpacked = labq_to_lab(&packed).unwrap();
        let values = ops::samples(&unpacked).unwrap();
        assert!((values[0] - 50.0).abs() < 0.1);
        assert!((values[1] + 20.25).abs() < 0.2);
        assert!((values[2] - 33.5).abs() < 0.2);
        assert!((values[3] - 100.0).abs() < 0.1);
        assert_eq!(unpacked.interpretation(), Interpretation::Lab);
    }

    #[test]
    fn rad_keeps_relative_precision() {
        let rgb = float_image(&[1.0, 0.5, 0.25, 0.0, 0.0, 0.0], Interpretation::ScRgb);
        let packed = float_to_rad(&rgb).unwrap();
        assert_eq!(packed.coding(), Coding::Rad);
        assert_eq!(&packed.to_bytes().unwrap()[4..], &[0, 0, 0, 0]);

        let values = ops::samples(&rad_to_float(&packed).unwrap()).unwrap();
        assert!((values[0] - 1.0).abs() < 0.01);
        assert!((values[1] - 0.5).abs() < 0.01);
        assert!((values[2] - 0.25).abs() < 0.01);
        assert_eq!(&values[3..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn frexp_normalizes() {
        assert_eq!(frexp(1.0), (0.5, 1));
        assert_eq!(frexp(0.75), (0.75, 0));
        assert_eq!(frexp(8.0), (0.5, 4));
    }

    #[test]
    fn coded_input_must_be_four_bytes() {
        let header = ImageHeader::new(1, 1, 3, BandFormat::UChar).with_coding(Coding::LabQ);
        let image = Image::from_bytes(header, vec![0; 3]).unwrap();
        assert!(decode(&image).is_err());
    }
}
