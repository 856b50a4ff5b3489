//! Sample-level image operations used by the save pipeline.
//!
//! Everything here works on whole images: samples are decoded to `f64`,
//! processed, and encoded back. Complex formats are handled through their
//! real component.

use bytemuck::{bytes_of, pod_read_unaligned};

use crate::error::ForeignError;
use crate::format::{BandFormat, Coding};
use crate::image::{Image, ImageHeader};

/// Decode one sample. `bytes` must hold at least `format.size()` bytes.
pub(crate) fn read_sample(bytes: &[u8], format: BandFormat) -> f64 {
    match format {
        BandFormat::UChar => f64::from(bytes[0]),
        BandFormat::Char => f64::from(bytes[0] as i8),
        BandFormat::UShort => f64::from(pod_read_unaligned::<u16>(&bytes[..2])),
        BandFormat::Short => f64::from(pod_read_unaligned::<i16>(&bytes[..2])),
        BandFormat::UInt => f64::from(pod_read_unaligned::<u32>(&bytes[..4])),
        BandFormat::Int => f64::from(pod_read_unaligned::<i32>(&bytes[..4])),
        BandFormat::Float | BandFormat::Complex => {
            f64::from(pod_read_unaligned::<f32>(&bytes[..4]))
        }
        BandFormat::Double | BandFormat::DpComplex => pod_read_unaligned::<f64>(&bytes[..8]),
    }
}

/// Encode one sample, clamping and rounding for integer formats.
/// Complex formats get a zero imaginary part.
pub(crate) fn write_sample(out: &mut [u8], format: BandFormat, value: f64) {
    let int = |value: f64| -> f64 {
        let (lo, hi) = format.range().unwrap_or((f64::MIN, f64::MAX));
        if value.is_nan() {
            0.0
        } else {
            value.round().clamp(lo, hi)
        }
    };
    match format {
        BandFormat::UChar => out[0] = int(value) as u8,
        BandFormat::Char => out[0] = (int(value) as i8) as u8,
        BandFormat::UShort => out[..2].copy_from_slice(bytes_of(&(int(value) as u16))),
        BandFormat::Short => out[..2].copy_from_slice(bytes_of(&(int(value) as i16))),
        BandFormat::UInt => out[..4].copy_from_slice(bytes_of(&(int(value) as u32))),
        BandFormat::Int => out[..4].copy_from_slice(bytes_of(&(int(value) as i32))),
        BandFormat::Float => out[..4].copy_from_slice(bytes_of(&(value as f32))),
        BandFormat::Double => out[..8].copy_from_slice(bytes_of(&value)),
        BandFormat::Complex => {
            out[..4].copy_from_slice(bytes_of(&(value as f32)));
            out[4..8].copy_from_slice(bytes_of(&0f32));
        }
        BandFormat::DpComplex => {
            out[..8].copy_from_slice(bytes_of(&value));
            out[8..16].copy_from_slice(bytes_of(&0f64));
        }
    }
}

/// All samples of an unpacked image, band-interleaved, as `f64`.
pub(crate) fn samples(image: &Image) -> Result<Vec<f64>, ForeignError> {
    let format = image.format();
    let size = format.size();
    let bytes = image.to_bytes()?;
    Ok(bytes
        .chunks_exact(size)
        .map(|chunk| read_sample(chunk, format))
        .collect())
}

/// Encode interleaved `f64` samples for `header`.
pub(crate) fn encode_samples(header: &ImageHeader, samples: &[f64]) -> Vec<u8> {
    let size = header.format.size();
    let mut out = vec![0u8; samples.len() * size];
    for (chunk, value) in out.chunks_exact_mut(size).zip(samples) {
        write_sample(chunk, header.format, *value);
    }
    out
}

fn require_unpacked(image: &Image, to: BandFormat) -> Result<(), ForeignError> {
    if image.coding() == Coding::None {
        Ok(())
    } else {
        Err(ForeignError::Cast {
            from: image.format(),
            to,
            coding: image.coding(),
        })
    }
}

/// Bands `first..first + count` of an image.
pub(crate) fn extract_bands(image: &Image, first: u32, count: u32) -> Result<Image, ForeignError> {
    let bands = image.bands();
    if count == 0 || first + count > bands {
        return Err(ForeignError::InvalidInput(format!(
            "cannot extract bands {first}..{} from {bands}-band image",
            first + count
        )));
    }
    require_unpacked(image, image.format())?;

    let size = image.format().size();
    let bytes = image.to_bytes()?;
    let mut out = Vec::with_capacity(bytes.len() / bands as usize * count as usize);
    for pixel in bytes.chunks_exact(bands as usize * size) {
        out.extend_from_slice(&pixel[first as usize * size..(first + count) as usize * size]);
    }

    let mut header = *image.header();
    header.bands = count;
    image.derive(header, out)
}

/// Convert to `format`.
///
/// With `shift`, integer-to-integer casts move bits rather than values:
/// narrowing shifts right by the difference in bit depth, so 16-bit 65535
/// becomes 8-bit 255. Without it values are clamped to the output range.
pub(crate) fn cast(image: &Image, format: BandFormat, shift: bool) -> Result<Image, ForeignError> {
    require_unpacked(image, format)?;
    let from = image.format();
    if from == format {
        return Ok(image.clone());
    }

    let bits = match (shift, from.int_bits(), format.int_bits()) {
        (true, Some(src), Some(dst)) => i64::from(src) - i64::from(dst),
        _ => 0,
    };

    let mut values = samples(image)?;
    if bits != 0 {
        for value in &mut values {
            let v = *value as i64;
            *value = if bits > 0 {
                (v >> bits) as f64
            } else {
                (v << -bits) as f64
            };
        }
    }

    let mut header = *image.header();
    header.format = format;
    image.derive(header, encode_samples(&header, &values))
}

/// Composite the image over a solid background, dropping the last band.
///
/// `background` supplies one value per remaining band; a single value is
/// used for every band. `max_alpha` is the sample value of full opacity.
pub(crate) fn flatten(image: &Image, background: &[f64], max_alpha: f64) -> Result<Image, ForeignError> {
    require_unpacked(image, image.format())?;
    let bands = image.bands() as usize;
    if bands < 2 {
        return Err(ForeignError::InvalidInput(
            "flatten needs at least two bands".into(),
        ));
    }
    let colour = bands - 1;
    let background: Vec<f64> = match background.len() {
        1 => vec![background[0]; colour],
        n if n == colour => background.to_vec(),
        n => {
            return Err(ForeignError::InvalidInput(format!(
                "background has {n} values for {colour} bands"
            )));
        }
    };

    let values = samples(image)?;
    let mut out = Vec::with_capacity(values.len() / bands * colour);
    for pixel in values.chunks_exact(bands) {
        let alpha = pixel[colour].clamp(0.0, max_alpha);
        for (c, bg) in pixel[..colour].iter().zip(&background) {
            out.push((bg * (max_alpha - alpha) + c * alpha) / max_alpha);
        }
    }

    let mut header = *image.header();
    header.bands = colour as u32;
    image.derive(header, encode_samples(&header, &out))
}

/// Reverse the byte order of every sample word in place.
pub(crate) fn swap_words(bytes: &mut [u8], format: BandFormat) {
    let word = if format.is_complex() {
        format.size() / 2
    } else {
        format.size()
    };
    if word > 1 {
        for chunk in bytes.chunks_exact_mut(word) {
            chunk.reverse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bands: u32, format: BandFormat, values: &[f64]) -> Image {
        let width = values.len() as u32 / bands;
        let header = ImageHeader::new(width, 1, bands, format);
        Image::from_bytes(header, encode_samples(&header, values)).unwrap()
    }

    #[test]
    fn shift_cast_narrows_by_bit_depth() {
        let wide = image(1, BandFormat::UShort, &[65535.0, 256.0, 255.0]);
        let narrow = cast(&wide, BandFormat::UChar, true).unwrap();
        assert_eq!(narrow.to_bytes().unwrap(), vec![255, 1, 0]);
    }

    #[test]
    fn plain_cast_clamps() {
        let wide = image(1, BandFormat::UShort, &[65535.0, 256.0, 12.0]);
        let narrow = cast(&wide, BandFormat::UChar, false).unwrap();
        assert_eq!(narrow.to_bytes().unwrap(), vec![255, 255, 12]);

        let float = image(1, BandFormat::Float, &[-3.0, 12.6]);
        let narrow = cast(&float, BandFormat::UChar, true).unwrap();
        assert_eq!(narrow.to_bytes().unwrap(), vec![0, 13]);
    }

    #[test]
    fn flatten_blends_against_background() {
        let rgba = image(
            4,
            BandFormat::UChar,
            &[
                100.0, 100.0, 100.0, 0.0, //
                100.0, 100.0, 100.0, 255.0, //
                100.0, 100.0, 100.0, 128.0, //
                100.0, 100.0, 100.0, 51.0,
            ],
        );
        let rgb = flatten(&rgba, &[255.0], 255.0).unwrap();
        assert_eq!(rgb.bands(), 3);
        assert_eq!(
            rgb.to_bytes().unwrap(),
            vec![255, 255, 255, 100, 100, 100, 177, 177, 177, 224, 224, 224]
        );
    }

    #[test]
    fn flatten_rejects_mismatched_background() {
        let rgba = image(4, BandFormat::UChar, &[0.0; 4]);
        assert!(flatten(&rgba, &[1.0, 2.0], 255.0).is_err());
    }

    #[test]
    fn extract_keeps_requested_bands() {
        let rgba = image(4, BandFormat::UShort, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let gb = extract_bands(&rgba, 1, 2).unwrap();
        assert_eq!(samples(&gb).unwrap(), vec![2.0, 3.0, 6.0, 7.0]);
        assert!(extract_bands(&rgba, 3, 2).is_err());
    }

    #[test]
    fn swap_reverses_each_word() {
        let mut bytes = vec![0x12, 0x34, 0x56, 0x78];
        swap_words(&mut bytes, BandFormat::UShort);
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
        swap_words(&mut bytes, BandFormat::UChar);
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn complex_reads_real_part() {
        let mut bytes = vec![0u8; 8];
        write_sample(&mut bytes, BandFormat::Complex, 2.5);
        assert_eq!(read_sample(&bytes, BandFormat::Complex), 2.5);
        assert_eq!(&bytes[4..], bytes_of(&0f32));
    }
}
