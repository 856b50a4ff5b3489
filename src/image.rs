//! Image headers, metadata, pixel regions and backing storage.
//!
//! An [`Image`] is a header plus a metadata table plus (optionally) pixels.
//! Pixels live in one of three places:
//!
//! - a memory buffer ([`imgref::ImgVec`] of raw sample bytes, one row per line),
//! - a temporary file on disc, read back a region at a time,
//! - a [`RegionSource`] that computes regions on demand.
//!
//! Cloning an image is cheap: pixels are shared, header and metadata are copied.
//! That is what the save pipeline relies on when it needs an editable copy
//! of an image to change metadata on.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use imgref::{ImgRef, ImgVec};

use crate::error::ForeignError;
use crate::format::{BandFormat, Coding, Interpretation};
use crate::load::LoadStatus;

/// Lines fetched per request when a generated image is written to storage.
const STRIP_HEIGHT: u32 = 16;

/// A rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Rectangle covering a whole `width` x `height` image.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && u64::from(other.left) + u64::from(other.width)
                <= u64::from(self.left) + u64::from(self.width)
            && u64::from(other.top) + u64::from(other.height)
                <= u64::from(self.top) + u64::from(self.height)
    }
}

/// Geometry, band layout and interpretation of an image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub bands: u32,
    pub format: BandFormat,
    pub coding: Coding,
    pub interpretation: Interpretation,
    /// Horizontal resolution in pixels per millimetre.
    pub xres: f64,
    /// Vertical resolution in pixels per millimetre.
    pub yres: f64,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            bands: 1,
            format: BandFormat::UChar,
            coding: Coding::None,
            interpretation: Interpretation::Multiband,
            xres: 1.0,
            yres: 1.0,
        }
    }
}

impl ImageHeader {
    /// Unpacked header with the interpretation guessed from the shape.
    pub fn new(width: u32, height: u32, bands: u32, format: BandFormat) -> Self {
        Self {
            width,
            height,
            bands,
            format,
            interpretation: Interpretation::default_for(bands, format, Coding::None),
            ..Self::default()
        }
    }

    pub fn with_interpretation(mut self, interpretation: Interpretation) -> Self {
        self.interpretation = interpretation;
        self
    }

    pub fn with_coding(mut self, coding: Coding) -> Self {
        self.coding = coding;
        self
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bands as usize * self.format.size()
    }

    pub fn line_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel()
    }

    /// Uncompressed size of the whole image in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.line_bytes() as u64 * u64::from(self.height)
    }

    pub fn bounds(&self) -> Rect {
        Rect::full(self.width, self.height)
    }

    /// Sanity-checked interpretation.
    pub fn guess_interpretation(&self) -> Interpretation {
        self.interpretation
            .guess(self.bands, self.format, self.coding)
    }

    /// Does the last band look like alpha?
    pub fn has_alpha(&self) -> bool {
        if self.coding != Coding::None {
            return false;
        }
        let interpretation = self.guess_interpretation();
        (self.bands == 2 && matches!(interpretation, Interpretation::BW | Interpretation::Grey16))
            || (self.bands == 4 && interpretation != Interpretation::Cmyk)
            || self.bands > 4
    }

    /// Geometry, bands, format and coding all agree.
    pub fn is_compatible(&self, other: &ImageHeader) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.bands == other.bands
            && self.format == other.format
            && self.coding == other.coding
    }
}

/// One metadata entry.
#[derive(Clone, Debug, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Double(f64),
    Str(String),
    Blob(Arc<[u8]>),
}

/// Well-known metadata names.
pub mod meta {
    pub const EXIF: &str = "exif-data";
    pub const XMP: &str = "xmp-data";
    pub const IPTC: &str = "iptc-data";
    pub const ICC: &str = "icc-profile-data";
    pub const IMAGE_DESCRIPTION: &str = "image-description";
    pub const ORIENTATION: &str = "orientation";
    pub const PAGE_HEIGHT: &str = "page-height";
    pub const LOADER: &str = "loader";
    pub const SEQUENTIAL: &str = "sequential";
}

/// Computes pixel regions on demand.
///
/// Implementations must be re-entrant: worker threads may call
/// [`prepare`](RegionSource::prepare) concurrently. Sources that can only
/// deliver lines top to bottom rely on their caller to serialize access.
pub trait RegionSource: Send + Sync {
    /// Produce the pixels of `rect`.
    fn prepare(&self, rect: Rect) -> Result<Region<'_>, ForeignError>;
}

enum RegionPixels<'a> {
    Borrowed(ImgRef<'a, u8>),
    Owned(ImgVec<u8>),
}

/// Pixels of a rectangle of an image, either aliased or computed.
pub struct Region<'a> {
    rect: Rect,
    bytes_per_pixel: usize,
    pixels: RegionPixels<'a>,
}

impl<'a> Region<'a> {
    /// Region over caller-computed bytes, `rect.height` rows of
    /// `rect.width * bytes_per_pixel` bytes each.
    pub fn owned(rect: Rect, bytes_per_pixel: usize, bytes: Vec<u8>) -> Result<Self, ForeignError> {
        let row = rect.width as usize * bytes_per_pixel;
        if bytes.len() != row * rect.height as usize {
            return Err(ForeignError::InvalidInput(format!(
                "region {}x{} needs {} bytes, got {}",
                rect.width,
                rect.height,
                row * rect.height as usize,
                bytes.len()
            )));
        }
        Ok(Self {
            rect,
            bytes_per_pixel,
            pixels: RegionPixels::Owned(ImgVec::new(bytes, row, rect.height as usize)),
        })
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// True when the region aliases storage rather than holding a copy.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.pixels, RegionPixels::Borrowed(_))
    }

    /// Bytes of line `y`, counted from the top of the region.
    pub fn row(&self, y: u32) -> &[u8] {
        let y = y as usize;
        match &self.pixels {
            RegionPixels::Borrowed(img) => {
                let start = y * img.stride();
                &img.buf()[start..start + img.width()]
            }
            RegionPixels::Owned(img) => {
                let start = y * img.stride();
                &img.buf()[start..start + img.width()]
            }
        }
    }

    /// Bytes of the pixel at region-relative `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let start = x as usize * self.bytes_per_pixel;
        &self.row(y)[start..start + self.bytes_per_pixel]
    }

    /// Append all rows, top to bottom, to `out`.
    pub fn copy_to(&self, out: &mut Vec<u8>) {
        for y in 0..self.rect.height {
            out.extend_from_slice(self.row(y));
        }
    }
}

impl fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("rect", &self.rect)
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

/// Where a lazily loaded image keeps its decoded pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Decode into a memory buffer.
    Memory,
    /// Decode into a temporary file.
    TempFile,
    /// No separate storage: regions come straight from the loader.
    Direct,
}

/// A file removed when the last reference goes away.
struct TempFile {
    path: PathBuf,
    file: Mutex<File>,
    line_bytes: usize,
}

impl TempFile {
    fn create(dir: &Path) -> Result<(PathBuf, File), ForeignError> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let serial = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "zenforeign-{}-{}.v",
            std::process::id(),
            serial
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok((path, file))
    }

    fn read_region(&self, rect: Rect, bytes_per_pixel: usize) -> Result<Vec<u8>, ForeignError> {
        let row = rect.width as usize * bytes_per_pixel;
        let mut out = vec![0u8; row * rect.height as usize];
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        for (i, chunk) in out.chunks_exact_mut(row.max(1)).enumerate() {
            let offset = (u64::from(rect.top) + i as u64) * self.line_bytes as u64
                + rect.left as u64 * bytes_per_pixel as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(chunk)?;
        }
        Ok(out)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("unable to remove temp file {}: {e}", self.path.display());
        }
    }
}

#[derive(Clone)]
enum Pixels {
    /// Backing chosen but nothing written yet.
    Pending { backing: Backing, swap: bool },
    Memory(Arc<ImgVec<u8>>),
    TempFile(Arc<TempFile>),
    Generated(Arc<dyn RegionSource>),
}

/// An image: header, metadata and (possibly lazy) pixels.
#[derive(Clone)]
pub struct Image {
    header: ImageHeader,
    meta: BTreeMap<String, MetaValue>,
    pixels: Pixels,
    /// The load operation this image is backing, if any. Never owning.
    origin: Option<Weak<LoadStatus>>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pixels = match &self.pixels {
            Pixels::Pending { .. } => "pending",
            Pixels::Memory(_) => "memory",
            Pixels::TempFile(_) => "temp-file",
            Pixels::Generated(_) => "generated",
        };
        f.debug_struct("Image")
            .field("header", &self.header)
            .field("meta", &self.meta.keys().collect::<Vec<_>>())
            .field("pixels", &pixels)
            .finish()
    }
}

impl Image {
    /// Header-only image: no pixels until some are written.
    pub fn new(header: ImageHeader) -> Self {
        Self::with_backing(header, Backing::Memory)
    }

    /// Image whose pixels, once written, go to the given backing.
    pub fn with_backing(header: ImageHeader, backing: Backing) -> Self {
        Self {
            header,
            meta: BTreeMap::new(),
            pixels: Pixels::Pending {
                backing,
                swap: false,
            },
            origin: None,
        }
    }

    /// Memory image from raw interleaved sample bytes in host order.
    pub fn from_bytes(header: ImageHeader, bytes: Vec<u8>) -> Result<Self, ForeignError> {
        let mut image = Self::new(header);
        image.set_pixels(bytes)?;
        Ok(image)
    }

    /// Image whose pixels are computed by `source`.
    pub fn from_source(header: ImageHeader, source: Arc<dyn RegionSource>) -> Self {
        Self {
            header,
            meta: BTreeMap::new(),
            pixels: Pixels::Generated(source),
            origin: None,
        }
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Header access for adapters filling in a freshly created image.
    pub fn header_mut(&mut self) -> &mut ImageHeader {
        &mut self.header
    }

    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn bands(&self) -> u32 {
        self.header.bands
    }

    pub fn format(&self) -> BandFormat {
        self.header.format
    }

    pub fn coding(&self) -> Coding {
        self.header.coding
    }

    pub fn interpretation(&self) -> Interpretation {
        self.header.interpretation
    }

    pub fn has_alpha(&self) -> bool {
        self.header.has_alpha()
    }

    pub fn has_pixels(&self) -> bool {
        !matches!(self.pixels, Pixels::Pending { .. })
    }

    /// Backing this image will write to, if it has no pixels yet.
    pub fn pending_backing(&self) -> Option<Backing> {
        match self.pixels {
            Pixels::Pending { backing, .. } => Some(backing),
            _ => None,
        }
    }

    pub(crate) fn set_byteswap(&mut self, enabled: bool) {
        if let Pixels::Pending { swap, .. } = &mut self.pixels {
            *swap = enabled;
        }
    }

    /// Serve pixels from `source` from now on, whatever was there before.
    pub(crate) fn attach_source(&mut self, source: Arc<dyn RegionSource>) {
        self.pixels = Pixels::Generated(source);
    }

    pub(crate) fn set_origin(&mut self, status: Weak<LoadStatus>) {
        self.origin = Some(status);
    }

    /// Tell the load operation this image backs that its result must not be
    /// reused. Loaders call this when the codec library reports a read error.
    pub fn invalidate_load(&self) {
        if let Some(status) = self.origin.as_ref().and_then(Weak::upgrade) {
            status.invalidate();
        }
    }

    // --- metadata ---

    pub fn set(&mut self, name: &str, value: MetaValue) {
        self.meta.insert(name.to_owned(), value);
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.set(name, MetaValue::Int(value));
    }

    pub fn set_string(&mut self, name: &str, value: &str) {
        self.set(name, MetaValue::Str(value.to_owned()));
    }

    pub fn set_blob(&mut self, name: &str, value: &[u8]) {
        self.set(name, MetaValue::Blob(Arc::from(value)));
    }

    pub fn get(&self, name: &str) -> Option<&MetaValue> {
        self.meta.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.meta.get(name)? {
            MetaValue::Int(v) => Some(*v),
            MetaValue::Double(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.meta.get(name)? {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_blob(&self, name: &str) -> Option<&[u8]> {
        match self.meta.get(name)? {
            MetaValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<MetaValue> {
        self.meta.remove(name)
    }

    /// Names of all metadata entries, sorted.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.meta.keys().map(String::as_str)
    }

    /// Copy every metadata entry of `other` onto `self`.
    pub fn copy_meta_from(&mut self, other: &Image) {
        for (name, value) in &other.meta {
            self.meta.insert(name.clone(), value.clone());
        }
    }

    /// New image sharing nothing but metadata and resolution with `self`.
    pub(crate) fn derive(&self, header: ImageHeader, bytes: Vec<u8>) -> Result<Self, ForeignError> {
        let mut header = header;
        header.xres = self.header.xres;
        header.yres = self.header.yres;
        let mut image = Image::from_bytes(header, bytes)?;
        image.meta = self.meta.clone();
        Ok(image)
    }

    // --- pixels ---

    /// Write the whole image from interleaved sample bytes.
    pub fn set_pixels(&mut self, mut bytes: Vec<u8>) -> Result<(), ForeignError> {
        let (backing, swap) = match self.pixels {
            Pixels::Pending { backing, swap } => (backing, swap),
            _ => {
                return Err(ForeignError::InvalidInput(
                    "image already has pixels".into(),
                ));
            }
        };
        let expected = self.header.size_bytes();
        if bytes.len() as u64 != expected {
            return Err(ForeignError::InvalidInput(format!(
                "expected {expected} bytes of pixels, got {}",
                bytes.len()
            )));
        }
        if swap {
            crate::ops::swap_words(&mut bytes, self.header.format);
        }

        self.pixels = match backing {
            Backing::TempFile => {
                let temp = self.new_temp_file()?;
                temp.file
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .write_all(&bytes)?;
                Pixels::TempFile(Arc::new(temp))
            }
            Backing::Memory | Backing::Direct => Pixels::Memory(Arc::new(ImgVec::new(
                bytes,
                self.header.line_bytes(),
                self.header.height as usize,
            ))),
        };
        Ok(())
    }

    /// Attach a region source.
    ///
    /// For direct backing the source serves regions itself. For memory and
    /// temp-file backing the source is run once, top to bottom, and its
    /// output written to storage.
    pub fn generate(&mut self, source: Arc<dyn RegionSource>) -> Result<(), ForeignError> {
        let (backing, swap) = match self.pixels {
            Pixels::Pending { backing, swap } => (backing, swap),
            _ => {
                return Err(ForeignError::InvalidInput(
                    "image already has pixels".into(),
                ));
            }
        };

        match backing {
            Backing::Direct => {
                self.pixels = Pixels::Generated(source);
                Ok(())
            }
            Backing::Memory => {
                let mut bytes = Vec::with_capacity(self.header.size_bytes() as usize);
                self.pull_strips(source.as_ref(), |strip| {
                    bytes.extend_from_slice(strip);
                    Ok(())
                })?;
                if swap {
                    crate::ops::swap_words(&mut bytes, self.header.format);
                }
                self.pixels = Pixels::Memory(Arc::new(ImgVec::new(
                    bytes,
                    self.header.line_bytes(),
                    self.header.height as usize,
                )));
                Ok(())
            }
            Backing::TempFile => {
                let temp = self.new_temp_file()?;
                {
                    let mut file = temp.file.lock().unwrap_or_else(|e| e.into_inner());
                    let format = self.header.format;
                    self.pull_strips(source.as_ref(), |strip| {
                        if swap {
                            let mut owned = strip.to_vec();
                            crate::ops::swap_words(&mut owned, format);
                            file.write_all(&owned)?;
                        } else {
                            file.write_all(strip)?;
                        }
                        Ok(())
                    })?;
                }
                self.pixels = Pixels::TempFile(Arc::new(temp));
                Ok(())
            }
        }
    }

    fn new_temp_file(&self) -> Result<TempFile, ForeignError> {
        let (path, file) = TempFile::create(&crate::config::temp_dir())?;
        log::debug!("temp file backing at {}", path.display());
        Ok(TempFile {
            path,
            file: Mutex::new(file),
            line_bytes: self.header.line_bytes(),
        })
    }

    /// Fetch `source` in strips, top to bottom, handing each strip's bytes on.
    fn pull_strips<F>(&self, source: &dyn RegionSource, mut sink: F) -> Result<(), ForeignError>
    where
        F: FnMut(&[u8]) -> Result<(), ForeignError>,
    {
        let mut strip = Vec::new();
        let mut top = 0;
        while top < self.header.height {
            let height = STRIP_HEIGHT.min(self.header.height - top);
            let region = source.prepare(Rect::new(0, top, self.header.width, height))?;
            strip.clear();
            region.copy_to(&mut strip);
            sink(&strip)?;
            top += height;
        }
        Ok(())
    }

    /// Pixels of `rect`. Memory images hand out an alias of their buffer.
    pub fn prepare(&self, rect: Rect) -> Result<Region<'_>, ForeignError> {
        if !self.header.bounds().contains(&rect) {
            return Err(ForeignError::InvalidInput(format!(
                "region {rect:?} outside {}x{} image",
                self.header.width, self.header.height
            )));
        }
        let bytes_per_pixel = self.header.bytes_per_pixel();

        match &self.pixels {
            Pixels::Pending { .. } => Err(ForeignError::NoPixels),
            Pixels::Memory(buffer) => {
                let full: &ImgVec<u8> = buffer;
                let view = full.as_ref().sub_image(
                    rect.left as usize * bytes_per_pixel,
                    rect.top as usize,
                    rect.width as usize * bytes_per_pixel,
                    rect.height as usize,
                );
                Ok(Region {
                    rect,
                    bytes_per_pixel,
                    pixels: RegionPixels::Borrowed(view),
                })
            }
            Pixels::TempFile(temp) => {
                let bytes = temp.read_region(rect, bytes_per_pixel)?;
                Region::owned(rect, bytes_per_pixel, bytes)
            }
            Pixels::Generated(source) => source.prepare(rect),
        }
    }

    /// All pixels as one contiguous buffer, computed top to bottom.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ForeignError> {
        if let Pixels::Memory(buffer) = &self.pixels {
            if buffer.stride() == buffer.width() {
                return Ok(buffer.buf().to_vec());
            }
        }
        let mut bytes = Vec::with_capacity(self.header.size_bytes() as usize);
        let mut top = 0;
        while top < self.header.height {
            let height = STRIP_HEIGHT.min(self.header.height - top);
            self.prepare(Rect::new(0, top, self.header.width, height))?
                .copy_to(&mut bytes);
            top += height;
        }
        Ok(bytes)
    }
}
