//! Scripted fake adapters for unit tests.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::adapter::{LoadAdapter, LoadContext, ReadSeek, SaveAdapter};
use crate::error::{AdapterError, ForeignError};
use crate::flags::{CodingSet, LoadFlags, SaveKinds, Saveable, SourceKinds};
use crate::format::{BandFormat, FormatTable};
use crate::image::{Image, ImageHeader, Rect, Region, RegionSource};

/// Route `log` output through the test harness; `RUST_LOG=debug` to see it.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Smallest well-formed ICC profile: a v4.2 display-class header for
/// `space` with an empty tag table.
pub(crate) fn icc_header(space: &[u8; 4]) -> Vec<u8> {
    let mut bytes = vec![0u8; 132];
    bytes[0..4].copy_from_slice(&132u32.to_be_bytes());
    bytes[8..12].copy_from_slice(&0x0420_0000u32.to_be_bytes());
    bytes[12..16].copy_from_slice(b"mntr");
    bytes[16..20].copy_from_slice(space);
    bytes[20..24].copy_from_slice(b"XYZ ");
    bytes[36..40].copy_from_slice(b"acsp");
    bytes
}

/// What a [`FakeLoader`] does when asked for pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Ok,
    FailHeader,
    FailLoad,
    /// Write a backing image one line taller than the header said.
    Mismatch,
    /// Load fine but flag the read as bad.
    Invalidate,
    /// Decode everything in the header routine.
    HeaderOnly,
}

pub(crate) struct FakeLoader {
    nickname: String,
    priority: i32,
    suffixes: Vec<&'static str>,
    magic: Option<Vec<u8>>,
    sources: SourceKinds,
    flags: LoadFlags,
    header: ImageHeader,
    pixels: Option<Vec<u8>>,
    mode: Mode,
    pub header_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
}

impl FakeLoader {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.into(),
            priority: 0,
            suffixes: Vec::new(),
            magic: None,
            sources: SourceKinds::FILE,
            flags: LoadFlags::EMPTY,
            header: ImageHeader::new(1, 1, 1, BandFormat::UChar),
            pixels: None,
            mode: Mode::Ok,
            header_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_suffixes(mut self, suffixes: &[&'static str]) -> Self {
        self.suffixes = suffixes.to_vec();
        self
    }

    pub fn with_magic(mut self, magic: &[u8]) -> Self {
        self.magic = Some(magic.to_vec());
        self
    }

    pub fn with_sources(mut self, sources: SourceKinds) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_flags(mut self, flags: LoadFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_header(mut self, header: ImageHeader) -> Self {
        self.header = header;
        self
    }

    pub fn with_pixels(mut self, pixels: Vec<u8>) -> Self {
        self.pixels = Some(pixels);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    fn bytes_for(&self, header: &ImageHeader) -> Vec<u8> {
        match &self.pixels {
            Some(pixels) => pixels.clone(),
            None => (0..header.size_bytes()).map(|i| (i % 251) as u8).collect(),
        }
    }
}

/// Serves rectangles out of a complete pixel buffer.
struct BufferSource {
    header: ImageHeader,
    bytes: Vec<u8>,
}

impl RegionSource for BufferSource {
    fn prepare(&self, rect: Rect) -> Result<Region<'_>, ForeignError> {
        let bpp = self.header.bytes_per_pixel();
        let line = self.header.line_bytes();
        let mut out = Vec::with_capacity(rect.width as usize * rect.height as usize * bpp);
        for y in rect.top..rect.top + rect.height {
            let start = y as usize * line + rect.left as usize * bpp;
            out.extend_from_slice(&self.bytes[start..start + rect.width as usize * bpp]);
        }
        Region::owned(rect, bpp, out)
    }
}

impl LoadAdapter for FakeLoader {
    fn nickname(&self) -> &str {
        &self.nickname
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn suffixes(&self) -> &[&str] {
        &self.suffixes
    }

    fn sources(&self) -> SourceKinds {
        self.sources
    }

    fn is_a(&self, path: &Path) -> Option<bool> {
        let magic = self.magic.as_ref()?;
        Some(std::fs::read(path).is_ok_and(|bytes| bytes.starts_with(magic)))
    }

    fn is_a_buffer(&self, bytes: &[u8]) -> Option<bool> {
        let magic = self.magic.as_ref()?;
        Some(bytes.starts_with(magic))
    }

    fn is_a_source(&self, stream: &mut dyn ReadSeek) -> Option<bool> {
        let magic = self.magic.as_ref()?;
        let mut head = vec![0u8; magic.len()];
        Some(stream.read_exact(&mut head).is_ok() && &head == magic)
    }

    fn flags(&self, _context: &LoadContext) -> LoadFlags {
        self.flags
    }

    fn flags_for_path(&self, _path: &Path) -> LoadFlags {
        self.flags
    }

    fn header(&self, _context: &mut LoadContext, out: &mut Image) -> Result<(), AdapterError> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        if self.mode == Mode::FailHeader {
            return Err("bad header".into());
        }
        *out.header_mut() = self.header;
        if self.mode == Mode::HeaderOnly {
            out.set_pixels(self.bytes_for(&self.header))?;
        }
        Ok(())
    }

    fn has_load(&self) -> bool {
        self.mode != Mode::HeaderOnly
    }

    fn load(&self, _context: &mut LoadContext, backing: &mut Image) -> Result<(), AdapterError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::FailLoad => return Err("truncated".into()),
            Mode::Mismatch => backing.header_mut().height += 1,
            Mode::Invalidate => backing.invalidate_load(),
            _ => {}
        }
        let header = *backing.header();
        let bytes = self.bytes_for(&header);
        if self.flags.contains(LoadFlags::PARTIAL) || self.flags.contains(LoadFlags::SEQUENTIAL) {
            backing.generate(Arc::new(BufferSource { header, bytes }))?;
        } else {
            backing.set_pixels(bytes)?;
        }
        Ok(())
    }
}

pub(crate) struct FakeSaver {
    nickname: String,
    priority: i32,
    suffixes: Vec<&'static str>,
    kinds: SaveKinds,
    saveable: Saveable,
    coding: CodingSet,
    table: FormatTable,
    pub written: Mutex<Option<Image>>,
}

impl FakeSaver {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.into(),
            priority: 0,
            suffixes: Vec::new(),
            kinds: SaveKinds::FILE,
            saveable: Saveable::ANY,
            coding: CodingSet::NONE,
            table: BandFormat::IDENTITY_TABLE,
            written: Mutex::new(None),
        }
    }

    pub fn with_suffixes(mut self, suffixes: &[&'static str]) -> Self {
        self.suffixes = suffixes.to_vec();
        self
    }

    pub fn with_kinds(mut self, kinds: SaveKinds) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_saveable(mut self, saveable: Saveable) -> Self {
        self.saveable = saveable;
        self
    }

    pub fn with_coding(mut self, coding: CodingSet) -> Self {
        self.coding = coding;
        self
    }

    pub fn with_table(mut self, table: FormatTable) -> Self {
        self.table = table;
        self
    }
}

impl SaveAdapter for FakeSaver {
    fn nickname(&self) -> &str {
        &self.nickname
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn suffixes(&self) -> &[&str] {
        &self.suffixes
    }

    fn kinds(&self) -> SaveKinds {
        self.kinds
    }

    fn saveable(&self) -> Saveable {
        self.saveable
    }

    fn coding(&self) -> CodingSet {
        self.coding
    }

    fn format_table(&self) -> FormatTable {
        self.table
    }

    fn write(&self, image: &Image, out: &mut dyn Write) -> Result<(), AdapterError> {
        out.write_all(&image.to_bytes()?)?;
        *self.written.lock().unwrap() = Some(image.clone());
        Ok(())
    }
}
