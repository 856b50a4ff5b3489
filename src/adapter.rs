//! The seam codec adapters plug into.
//!
//! A loader implements [`LoadAdapter`], a saver implements [`SaveAdapter`].
//! Both carry their static descriptor data (nickname, priority, suffixes,
//! capabilities) as trait methods, so one type is one registered adapter.

use std::fmt;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AdapterError;
use crate::flags::{CodingSet, LoadFlags, SaveKinds, Saveable, SourceKinds};
use crate::format::{Access, BandFormat, FailOn, FormatTable};
use crate::image::Image;

/// A seekable byte stream a loader can read from.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Where a load reads its bytes from.
pub enum LoadSource {
    Path(PathBuf),
    Buffer(Arc<[u8]>),
    Stream(Box<dyn ReadSeek>),
}

impl LoadSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            LoadSource::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        match self {
            LoadSource::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn stream(&mut self) -> Option<&mut dyn ReadSeek> {
        match self {
            LoadSource::Stream(stream) => Some(stream.as_mut()),
            _ => None,
        }
    }

    /// Which [`SourceKinds`] bit this source needs.
    pub fn kind(&self) -> SourceKinds {
        match self {
            LoadSource::Path(_) => SourceKinds::FILE,
            LoadSource::Buffer(_) => SourceKinds::BUFFER,
            LoadSource::Stream(_) => SourceKinds::STREAM,
        }
    }
}

impl fmt::Debug for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            LoadSource::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            LoadSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Per-operation state handed to a loader's header and load routines.
#[derive(Debug)]
pub struct LoadContext {
    pub source: LoadSource,
    pub access: Access,
    pub fail_on: FailOn,
}

/// A format loader.
///
/// `header` reads geometry, band layout and metadata without touching pixels.
/// `load` fills a backing image whose header must match the one `header`
/// produced. Loaders that decode everything in `header` return `false` from
/// [`has_load`](LoadAdapter::has_load).
pub trait LoadAdapter: Send + Sync {
    /// Unique short name, e.g. `"pngload"`.
    fn nickname(&self) -> &str;

    /// Search order: higher first.
    fn priority(&self) -> i32 {
        0
    }

    /// Filename suffixes, with leading dot, e.g. `".png"`.
    fn suffixes(&self) -> &[&str] {
        &[]
    }

    /// Source kinds this loader reads.
    fn sources(&self) -> SourceKinds {
        SourceKinds::FILE
    }

    /// Sniff a file. `None` means the loader has no path sniffer.
    fn is_a(&self, _path: &Path) -> Option<bool> {
        None
    }

    /// Sniff a memory buffer. `None` means no buffer sniffer.
    fn is_a_buffer(&self, _bytes: &[u8]) -> Option<bool> {
        None
    }

    /// Sniff a stream. The stream is rewound before each call.
    fn is_a_source(&self, _stream: &mut dyn ReadSeek) -> Option<bool> {
        None
    }

    /// Capabilities for this particular input.
    fn flags(&self, _context: &LoadContext) -> LoadFlags {
        LoadFlags::EMPTY
    }

    /// Capabilities for a file, without an operation.
    fn flags_for_path(&self, _path: &Path) -> LoadFlags {
        LoadFlags::EMPTY
    }

    /// Fill in the output header and metadata.
    fn header(&self, context: &mut LoadContext, out: &mut Image) -> Result<(), AdapterError>;

    /// Whether [`load`](LoadAdapter::load) does anything.
    fn has_load(&self) -> bool {
        true
    }

    /// Decode pixels into `backing`, via [`Image::set_pixels`] or
    /// [`Image::generate`].
    fn load(&self, _context: &mut LoadContext, _backing: &mut Image) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// A format saver.
pub trait SaveAdapter: Send + Sync {
    fn nickname(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    /// Suffixes this saver writes. A saver with none can only be found by name.
    fn suffixes(&self) -> &[&str] {
        &[]
    }

    fn kinds(&self) -> SaveKinds {
        SaveKinds::FILE
    }

    /// Band structures accepted; [`Saveable::ANY`] for no normalization.
    fn saveable(&self) -> Saveable {
        Saveable::ANY
    }

    fn coding(&self) -> CodingSet {
        CodingSet::NONE
    }

    /// Output format for each input format.
    fn format_table(&self) -> FormatTable {
        BandFormat::IDENTITY_TABLE
    }

    /// Encode a converted image.
    fn write(&self, image: &Image, out: &mut dyn Write) -> Result<(), AdapterError>;
}

/// Does `path` end in `suffix`, ignoring ASCII case?
pub(crate) fn suffix_matches(path: &str, suffix: &str) -> bool {
    path.len() >= suffix.len()
        && path
            .get(path.len() - suffix.len()..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}
