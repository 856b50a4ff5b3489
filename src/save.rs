//! Save-side conversion: turn any image into one a saver accepts.
//!
//! [`convert_saveable`] settles coding, band structure, alpha, band count
//! and numeric format, in that order. [`apply_saveable`] is its band
//! structure step. [`SaveOperation`] runs the conversion, applies the
//! metadata policy and hands the result to the saver's writer.
//!
//! Every step takes its input by value and returns a new image, so the
//! previous stage is released as soon as the next one exists.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapter::SaveAdapter;
use crate::coding;
use crate::colour::{BuiltinColour, ColourEngine};
use crate::error::ForeignError;
use crate::flags::{CodingSet, Keep, Saveable};
use crate::format::{BandFormat, Coding, FormatTable, Interpretation};
use crate::image::{meta, Image};
use crate::metadata::update_metadata;
use crate::ops;
use crate::registry::{split_options, Registry};

/// Options for one save.
#[derive(Clone)]
pub struct SaveOptions {
    /// Metadata to keep; all of it when unset.
    pub keep: Option<Keep>,
    /// Deprecated: `true` means keep nothing, unless `keep` is set.
    pub strip: Option<bool>,
    /// Flatten colour, one value per band or one value for all.
    pub background: Vec<f64>,
    /// Height of each page in a vertically stacked multi-page image.
    pub page_height: Option<u32>,
    /// ICC profile to attach, which also forces ICC to be kept.
    pub profile: Option<Arc<[u8]>>,
    /// Colour conversions used during the save. Default: [`BuiltinColour`].
    pub engine: Arc<dyn ColourEngine>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            keep: None,
            strip: None,
            background: vec![0.0],
            page_height: None,
            profile: None,
            engine: Arc::new(BuiltinColour),
        }
    }
}

impl fmt::Debug for SaveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveOptions")
            .field("keep", &self.keep)
            .field("strip", &self.strip)
            .field("background", &self.background)
            .field("page_height", &self.page_height)
            .field("profile", &self.profile.as_ref().map(|p| p.len()))
            .finish_non_exhaustive()
    }
}

impl SaveOptions {
    /// Keep all metadata, flatten against black.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the metadata in `keep`.
    pub fn with_keep(mut self, keep: Keep) -> Self {
        self.keep = Some(keep);
        self
    }

    /// Deprecated: use [`with_keep`](Self::with_keep).
    pub fn with_strip(mut self, strip: bool) -> Self {
        self.strip = Some(strip);
        self
    }

    /// Colour alpha is flattened against, one value or one per band.
    pub fn with_background(mut self, background: &[f64]) -> Self {
        self.background = background.to_vec();
        self
    }

    /// Record the page height of a stacked multi-page image.
    pub fn with_page_height(mut self, page_height: u32) -> Self {
        self.page_height = Some(page_height);
        self
    }

    /// Attach an ICC profile, keeping it even when ICC is not in `keep`.
    pub fn with_profile(mut self, profile: &[u8]) -> Self {
        self.profile = Some(Arc::from(profile));
        self
    }

    /// Use another colour engine, for example one backed by a full CMS.
    pub fn with_engine(mut self, engine: Arc<dyn ColourEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Keep flags after folding in `strip` and `profile`.
    pub fn effective_keep(&self) -> Keep {
        let mut keep = match (self.keep, self.strip) {
            (Some(keep), _) => keep,
            (None, Some(true)) => Keep::NONE,
            (None, _) => Keep::ALL,
        };
        if self.profile.is_some() {
            keep |= Keep::ICC;
        }
        keep
    }
}

fn coding_accepted(set: CodingSet, coding: Coding) -> bool {
    match coding {
        Coding::None => set.contains(CodingSet::NONE),
        Coding::LabQ => set.contains(CodingSet::LABQ),
        Coding::Rad => set.contains(CodingSet::RAD),
    }
}

/// Bring the band structure to one `saveable` allows.
///
/// Packed codings are unpacked first. 16-bit sources stay 16-bit here; the
/// format table cuts them down later.
pub fn apply_saveable(
    image: Image,
    saveable: Saveable,
    engine: &dyn ColourEngine,
) -> Result<Image, ForeignError> {
    if saveable.is_any() {
        return Ok(image);
    }
    let sixteen = image.format() == BandFormat::UShort;

    let mut image = if image.coding() == Coding::None {
        image
    } else {
        coding::decode(&image)?
    };

    if saveable.contains(Saveable::MONO) && image.bands() < 3 {
        return Ok(image);
    }

    if image.header().guess_interpretation() == Interpretation::Cmyk && image.bands() >= 4 {
        if saveable.contains(Saveable::CMYK) {
            return Ok(image);
        }
        image = engine.icc_import(&image)?;
    }

    if saveable.contains(Saveable::RGB) {
        let target = if sixteen {
            Interpretation::Rgb16
        } else {
            Interpretation::Srgb
        };
        return engine.colourspace(&image, target);
    }

    if saveable.contains(Saveable::CMYK) {
        return engine.icc_export(&image, if sixteen { 16 } else { 8 });
    }

    if saveable.contains(Saveable::MONO) {
        let target = if sixteen {
            Interpretation::Grey16
        } else {
            Interpretation::BW
        };
        return engine.colourspace(&image, target);
    }

    Err(ForeignError::NoSaveableType(format!("{saveable:?}")))
}

/// Largest band count the sanity-checked interpretation allows, before
/// alpha. Zero means no cap.
fn colour_band_cap(interpretation: Interpretation) -> u32 {
    match interpretation {
        Interpretation::BW | Interpretation::Grey16 => 1,
        Interpretation::Rgb
        | Interpretation::Cmc
        | Interpretation::Lch
        | Interpretation::LabS
        | Interpretation::Srgb
        | Interpretation::Yxy
        | Interpretation::Xyz
        | Interpretation::Lab
        | Interpretation::Rgb16
        | Interpretation::ScRgb
        | Interpretation::Hsv => 3,
        Interpretation::Cmyk => 4,
        _ => 0,
    }
}

/// Convert `image` into something a saver with these capabilities takes.
///
/// Nothing happens when the image is already in a coding the saver accepts,
/// or when the saver takes any band structure and keeps this format.
pub fn convert_saveable(
    image: Image,
    saveable: Saveable,
    table: &FormatTable,
    coding: CodingSet,
    background: &[f64],
    engine: &dyn ColourEngine,
) -> Result<Image, ForeignError> {
    if image.coding() != Coding::None && coding_accepted(coding, image.coding()) {
        return Ok(image);
    }
    if image.coding() == Coding::None
        && saveable.is_any()
        && table[image.format().index()] == image.format()
    {
        return Ok(image);
    }

    let mut image = apply_saveable(image, saveable, engine)?;

    if image.coding() == Coding::None && image.has_alpha() && !saveable.accepts_alpha() {
        let max_alpha = image.header().guess_interpretation().max_alpha();
        image = ops::flatten(&image, background, max_alpha)?;
    }

    if image.coding() == Coding::None {
        let mut cap = colour_band_cap(image.header().guess_interpretation());
        if saveable.is_any() {
            cap = image.bands();
        } else if saveable.contains(Saveable::ALPHA) {
            cap += 1;
        }
        if cap > 0 && image.bands() > cap {
            image = ops::extract_bands(&image, 0, cap)?;
        }

        let format = table[image.format().index()];
        let shift = !image.format().is_8bit() && format.is_8bit();
        image = ops::cast(&image, format, shift)?;
    }

    if coding_accepted(coding, image.coding()) {
        Ok(image)
    } else if coding.contains(CodingSet::LABQ) {
        if image.header().guess_interpretation() != Interpretation::Lab {
            image = engine.colourspace(&image, Interpretation::Lab)?;
        }
        coding::encode(&image, Coding::LabQ)
    } else if coding.contains(CodingSet::RAD) {
        if !matches!(
            image.header().guess_interpretation(),
            Interpretation::ScRgb | Interpretation::Xyz
        ) {
            image = engine.colourspace(&image, Interpretation::ScRgb)?;
        }
        coding::encode(&image, Coding::Rad)
    } else {
        coding::decode(&image)
    }
}

/// One save: the converted image and the saver that will write it.
pub struct SaveOperation {
    adapter: Arc<dyn SaveAdapter>,
    keep: Keep,
    ready: Image,
}

impl fmt::Debug for SaveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveOperation")
            .field("saver", &self.adapter.nickname())
            .field("keep", &self.keep)
            .field("ready", &self.ready)
            .finish()
    }
}

impl SaveOperation {
    /// Convert `image` for `adapter` and settle its metadata.
    pub fn new(
        adapter: Arc<dyn SaveAdapter>,
        image: &Image,
        options: &SaveOptions,
    ) -> Result<Self, ForeignError> {
        if options.strip.is_some() {
            log::warn!("{}: \"strip\" is deprecated, use keep", adapter.nickname());
        }
        let keep = options.effective_keep();
        let engine = options.engine.as_ref();

        let mut ready = convert_saveable(
            image.clone(),
            adapter.saveable(),
            &adapter.format_table(),
            adapter.coding(),
            &options.background,
            engine,
        )?;

        if let Some(profile) = &options.profile {
            ready.set(meta::ICC, crate::image::MetaValue::Blob(Arc::clone(profile)));
        }
        update_metadata(&mut ready, keep, engine)?;
        if let Some(page_height) = options.page_height {
            ready.set_int(meta::PAGE_HEIGHT, i64::from(page_height));
        }

        Ok(Self {
            adapter,
            keep,
            ready,
        })
    }

    /// The converted image the saver will see.
    pub fn ready(&self) -> &Image {
        &self.ready
    }

    pub fn into_ready(self) -> Image {
        self.ready
    }

    pub fn keep(&self) -> Keep {
        self.keep
    }

    pub fn saver(&self) -> &str {
        self.adapter.nickname()
    }

    /// Encode `ready` with the saver.
    pub fn write_to(&self, out: &mut dyn Write) -> Result<(), ForeignError> {
        self.adapter
            .write(&self.ready, out)
            .map_err(|error| ForeignError::write(self.adapter.nickname(), error))
    }
}

/// Pick a saver by the filename's suffix, convert and write the file.
pub fn save_to_path(
    registry: &Registry,
    image: &Image,
    path: impl AsRef<Path>,
    options: &SaveOptions,
) -> Result<(), ForeignError> {
    let adapter = registry.find_save(path.as_ref())?;
    let full = path.as_ref().to_string_lossy();
    let name = PathBuf::from(split_options(&full).0);

    let op = SaveOperation::new(adapter, image, options)?;
    let mut out = BufWriter::new(File::create(&name)?);
    op.write_to(&mut out)?;
    out.flush()?;
    Ok(())
}

/// Pick a memory-capable saver for `suffix`, convert and encode.
pub fn save_to_buffer(
    registry: &Registry,
    image: &Image,
    suffix: &str,
    options: &SaveOptions,
) -> Result<Vec<u8>, ForeignError> {
    let adapter = registry.find_save_buffer(suffix)?;
    let op = SaveOperation::new(adapter, image, options)?;
    let mut out = Vec::new();
    op.write_to(&mut out)?;
    Ok(out)
}
