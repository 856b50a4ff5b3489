//! Which metadata survives a save.
//!
//! Metadata entries are the ones a codec would write into the file: names
//! ending in `-data`, side-channel comment fields and the image
//! description. Everything else on an image (orientation, loader name,
//! page height and so on) is structural and never filtered here.

use std::io::Cursor;

use exif::experimental::Writer;
use exif::{Exif, Field, In, Rational, Reader, Tag, Value};

use crate::colour::ColourEngine;
use crate::error::ForeignError;
use crate::flags::Keep;
use crate::image::{meta, Image, MetaValue};

const EXIF_PREFIX: &[u8] = b"Exif\0\0";

/// Plain-text IFD0 fields copied into EXIF from `exif-ifd0-<Name>` strings.
const IFD0_STRINGS: [(&str, Tag); 5] = [
    ("exif-ifd0-Artist", Tag::Artist),
    ("exif-ifd0-Copyright", Tag::Copyright),
    ("exif-ifd0-Software", Tag::Software),
    ("exif-ifd0-Make", Tag::Make),
    ("exif-ifd0-Model", Tag::Model),
];

/// Is `name` a metadata entry subject to keep filtering?
pub fn is_metadata_field(name: &str) -> bool {
    name.starts_with("png-comment-")
        || name.starts_with("magickprofile-")
        || name == meta::IMAGE_DESCRIPTION
        || name.ends_with("-data")
}

/// Does `keep` retain the metadata entry `name`?
fn is_kept(name: &str, keep: Keep) -> bool {
    match name {
        meta::EXIF => keep.contains(Keep::EXIF),
        meta::XMP => keep.contains(Keep::XMP),
        meta::IPTC => keep.contains(Keep::IPTC),
        meta::ICC => keep.contains(Keep::ICC),
        _ => keep.contains(Keep::OTHER),
    }
}

/// Apply `keep` to a converted image.
///
/// EXIF is rebuilt from the image fields first when it is kept. An ICC
/// profile that does not fit the image's band layout is dropped.
pub fn update_metadata(
    image: &mut Image,
    keep: Keep,
    engine: &dyn ColourEngine,
) -> Result<(), ForeignError> {
    if keep.contains(Keep::EXIF) {
        rebuild_exif(image)?;
    }

    if keep != Keep::ALL {
        let doomed: Vec<String> = image
            .fields()
            .filter(|name| is_metadata_field(name) && !is_kept(name, keep))
            .map(str::to_owned)
            .collect();
        for name in doomed {
            log::trace!("removing {name}");
            image.remove(&name);
        }
    }

    if keep.contains(Keep::ICC) {
        if let Some(profile) = image.get_blob(meta::ICC) {
            if !engine.is_compatible_profile(image, profile) {
                log::debug!("dropping ICC profile incompatible with {:?}", image.interpretation());
                image.remove(meta::ICC);
            }
        }
    }
    Ok(())
}

fn rational(value: f64) -> Rational {
    let scaled = (value * 1000.0).round();
    if scaled >= 0.0 && scaled <= f64::from(u32::MAX) {
        Rational {
            num: scaled as u32,
            denom: 1000,
        }
    } else {
        Rational {
            num: value.clamp(0.0, f64::from(u32::MAX)) as u32,
            denom: 1,
        }
    }
}

/// `"Jane (Jane, ASCII, 5 components, 5 bytes)"` and `"Jane"` both give `"Jane"`.
fn ascii_value(text: &str) -> Value {
    let text = text.split_once(" (").map_or(text, |(head, _)| head);
    Value::Ascii(vec![text.as_bytes().to_vec()])
}

/// Replace `tag` in the primary IFD.
fn set_field(fields: &mut Vec<Field>, tag: Tag, value: Value) {
    fields.retain(|f| f.tag != tag || f.ifd_num != In::PRIMARY);
    fields.push(Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    });
}

/// Tags the EXIF writer lays out itself; copying them over would point at
/// offsets in the old block.
fn is_layout_tag(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::ExifIFDPointer
            | Tag::GPSInfoIFDPointer
            | Tag::InteropIFDPointer
            | Tag::JPEGInterchangeFormat
            | Tag::JPEGInterchangeFormatLength
            | Tag::StripOffsets
            | Tag::StripByteCounts
            | Tag::TileOffsets
            | Tag::TileByteCounts
    )
}

/// The JPEG thumbnail embedded in IFD1, if any.
fn thumbnail(exif: &Exif) -> Option<&[u8]> {
    let offset = exif
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let len = exif
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    exif.buf().get(offset..offset.checked_add(len)?)
}

/// Write the image's orientation, resolution and text fields into its
/// EXIF block, so edits made through metadata reach the file.
///
/// Fields of the primary image and of the thumbnail are carried over, and
/// so is the thumbnail itself. Images with neither an EXIF block nor an
/// orientation are left alone.
pub fn rebuild_exif(image: &mut Image) -> Result<(), ForeignError> {
    let existing = match image.get(meta::EXIF) {
        Some(MetaValue::Blob(blob)) => {
            let raw = blob.strip_prefix(EXIF_PREFIX).unwrap_or(blob);
            let exif = Reader::new()
                .read_raw(raw.to_vec())
                .map_err(|e| ForeignError::Exif(e.to_string()))?;
            Some(exif)
        }
        Some(other) => {
            return Err(ForeignError::Metadata(format!(
                "{} is not a blob: {other:?}",
                meta::EXIF
            )));
        }
        None if image.get_int(meta::ORIENTATION).is_some() => None,
        None => return Ok(()),
    };

    let mut fields: Vec<Field> = existing
        .iter()
        .flat_map(|exif| exif.fields())
        .filter(|f| f.ifd_num == In::PRIMARY || f.ifd_num == In::THUMBNAIL)
        .filter(|f| !is_layout_tag(f.tag))
        .map(|f| Field {
            tag: f.tag,
            ifd_num: f.ifd_num,
            value: f.value.clone(),
        })
        .collect();
    let little_endian = existing.as_ref().is_none_or(Exif::little_endian);

    if let Some(orientation) = image.get_int(meta::ORIENTATION) {
        let orientation = u16::try_from(orientation)
            .ok()
            .filter(|o| (1..=8).contains(o))
            .unwrap_or(1);
        set_field(&mut fields, Tag::Orientation, Value::Short(vec![orientation]));
    }

    // EXIF has no per-millimetre unit; write pixels per centimetre.
    let header = *image.header();
    set_field(&mut fields, Tag::XResolution, Value::Rational(vec![rational(header.xres * 10.0)]));
    set_field(&mut fields, Tag::YResolution, Value::Rational(vec![rational(header.yres * 10.0)]));
    set_field(&mut fields, Tag::ResolutionUnit, Value::Short(vec![3]));

    if let Some(description) = image.get_string(meta::IMAGE_DESCRIPTION) {
        set_field(&mut fields, Tag::ImageDescription, ascii_value(description));
    }
    for (name, tag) in IFD0_STRINGS {
        if let Some(text) = image.get_string(name) {
            set_field(&mut fields, tag, ascii_value(text));
        }
    }

    let mut writer = Writer::new();
    for field in &fields {
        writer.push_field(field);
    }
    if let Some(jpeg) = existing.as_ref().and_then(thumbnail) {
        writer.set_jpeg(jpeg, In::THUMBNAIL);
    }
    let mut out = Cursor::new(Vec::new());
    writer
        .write(&mut out, little_endian)
        .map_err(|e| ForeignError::Exif(e.to_string()))?;

    let mut blob = EXIF_PREFIX.to_vec();
    blob.extend_from_slice(&out.into_inner());
    image.set_blob(meta::EXIF, &blob);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::BuiltinColour;
    use crate::format::BandFormat;
    use crate::image::ImageHeader;

    fn rgb() -> Image {
        let header = ImageHeader::new(2, 2, 3, BandFormat::UChar);
        Image::from_bytes(header, vec![0; 12]).unwrap()
    }

    use crate::testing::icc_header as profile;

    fn read_back(image: &Image) -> exif::Exif {
        let blob = image.get_blob(meta::EXIF).unwrap();
        assert!(blob.starts_with(EXIF_PREFIX));
        Reader::new().read_raw(blob[EXIF_PREFIX.len()..].to_vec()).unwrap()
    }

    #[test]
    fn keep_icc_only() {
        let mut image = rgb();
        image.set_blob(meta::EXIF, b"not parsed");
        image.set_blob(meta::XMP, b"<x:xmpmeta/>");
        image.set_blob(meta::ICC, &profile(b"RGB "));
        image.set_string("png-comment-0-Title", "hello");
        image.set_int(meta::ORIENTATION, 6);

        update_metadata(&mut image, Keep::ICC, &BuiltinColour).unwrap();

        let metadata: Vec<&str> = image.fields().filter(|n| is_metadata_field(n)).collect();
        assert_eq!(metadata, vec![meta::ICC]);
        assert_eq!(image.get_int(meta::ORIENTATION), Some(6));
    }

    #[test]
    fn other_bit_keeps_the_rest() {
        let mut image = rgb();
        image.set_blob(meta::XMP, b"x");
        image.set_string("png-comment-0-Title", "hello");
        image.set_blob("gainmap-data", b"g");
        update_metadata(&mut image, Keep::OTHER, &BuiltinColour).unwrap();
        assert!(image.get(meta::XMP).is_none());
        assert!(image.get("png-comment-0-Title").is_some());
        assert!(image.get("gainmap-data").is_some());
    }

    #[test]
    fn incompatible_profile_is_dropped() {
        let mut image = rgb();
        image.set_blob(meta::ICC, &profile(b"CMYK"));
        update_metadata(&mut image, Keep::ALL, &BuiltinColour).unwrap();
        assert!(image.get_blob(meta::ICC).is_none());

        let mut image = rgb();
        image.set_blob(meta::ICC, &profile(b"RGB "));
        update_metadata(&mut image, Keep::ALL, &BuiltinColour).unwrap();
        assert!(image.get_blob(meta::ICC).is_some());
    }

    #[test]
    fn orientation_is_written_into_exif() {
        let mut image = rgb();
        image.set_int(meta::ORIENTATION, 6);
        image.set_string("exif-ifd0-Artist", "Jane (Jane, ASCII, 5 components, 5 bytes)");
        update_metadata(&mut image, Keep::ALL, &BuiltinColour).unwrap();

        let exif = read_back(&image);
        let orientation = exif.get_field(Tag::Orientation, In::PRIMARY).unwrap();
        assert_eq!(orientation.value.get_uint(0), Some(6));
        let unit = exif.get_field(Tag::ResolutionUnit, In::PRIMARY).unwrap();
        assert_eq!(unit.value.get_uint(0), Some(3));
        let artist = exif.get_field(Tag::Artist, In::PRIMARY).unwrap();
        assert!(matches!(&artist.value, Value::Ascii(v) if v[0] == b"Jane"));

        // A second pass edits the existing block rather than starting over.
        image.set_int(meta::ORIENTATION, 3);
        rebuild_exif(&mut image).unwrap();
        let exif = read_back(&image);
        let orientation = exif.get_field(Tag::Orientation, In::PRIMARY).unwrap();
        assert_eq!(orientation.value.get_uint(0), Some(3));
        assert!(exif.get_field(Tag::Artist, In::PRIMARY).is_some());
    }

    fn exif_with_thumbnail(jpeg: &[u8]) -> Vec<u8> {
        let make = Field {
            tag: Tag::Make,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"Acme".to_vec()]),
        };
        let taken = Field {
            tag: Tag::DateTimeOriginal,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"2024:01:02 03:04:05".to_vec()]),
        };
        let thumb_unit = Field {
            tag: Tag::ResolutionUnit,
            ifd_num: In::THUMBNAIL,
            value: Value::Short(vec![2]),
        };
        let mut writer = Writer::new();
        writer.push_field(&make);
        writer.push_field(&taken);
        writer.push_field(&thumb_unit);
        writer.set_jpeg(jpeg, In::THUMBNAIL);
        let mut out = Cursor::new(Vec::new());
        writer.write(&mut out, false).unwrap();

        let mut blob = EXIF_PREFIX.to_vec();
        blob.extend_from_slice(&out.into_inner());
        blob
    }

    #[test]
    fn thumbnail_survives_rebuild() {
        let jpeg = b"\xff\xd8 tiny thumbnail \xff\xd9";
        let mut image = rgb();
        image.set_blob(meta::EXIF, &exif_with_thumbnail(jpeg));
        image.set_int(meta::ORIENTATION, 8);

        update_metadata(&mut image, Keep::ALL, &BuiltinColour).unwrap();

        let exif = read_back(&image);
        assert!(exif.fields().any(|f| f.ifd_num == In::THUMBNAIL));
        let unit = exif.get_field(Tag::ResolutionUnit, In::THUMBNAIL).unwrap();
        assert_eq!(unit.value.get_uint(0), Some(2));
        assert_eq!(thumbnail(&exif), Some(&jpeg[..]));
        assert!(exif.get_field(Tag::DateTimeOriginal, In::PRIMARY).is_some());
        let orientation = exif.get_field(Tag::Orientation, In::PRIMARY).unwrap();
        assert_eq!(orientation.value.get_uint(0), Some(8));
        // Only the primary resolution unit is rewritten.
        let unit = exif.get_field(Tag::ResolutionUnit, In::PRIMARY).unwrap();
        assert_eq!(unit.value.get_uint(0), Some(3));
    }

    #[test]
    fn exif_entry_of_the_wrong_type_is_a_metadata_error() {
        let mut image = rgb();
        image.set_string(meta::EXIF, "not a blob");
        let err = rebuild_exif(&mut image).unwrap_err();
        assert!(matches!(err, ForeignError::Metadata(_)));
    }

    #[test]
    fn no_exif_and_no_orientation_writes_nothing() {
        let mut image = rgb();
        update_metadata(&mut image, Keep::ALL, &BuiltinColour).unwrap();
        assert!(image.get(meta::EXIF).is_none());
    }

    #[test]
    fn corrupt_exif_is_an_error_when_kept() {
        let mut image = rgb();
        image.set_blob(meta::EXIF, b"Exif\0\0garbage");
        let err = update_metadata(&mut image, Keep::ALL, &BuiltinColour).unwrap_err();
        assert!(matches!(err, ForeignError::Exif(_)));
    }
}
