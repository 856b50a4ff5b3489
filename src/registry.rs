//! Adapter registry: priority-ordered loaders and savers, and the queries
//! that pick one for a file, buffer, stream or suffix.
//!
//! A registry is built once with [`Registry::with_loader`] /
//! [`Registry::with_saver`] and then only read. Blocking an adapter is the
//! one change allowed afterwards; it is a per-entry atomic, so lookups never
//! take a lock.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::adapter::{suffix_matches, LoadAdapter, ReadSeek, SaveAdapter};
use crate::error::ForeignError;
use crate::flags::{LoadFlags, SaveKinds, SourceKinds};

struct Entry<T: ?Sized> {
    adapter: Arc<T>,
    blocked: AtomicBool,
}

impl<T: ?Sized> Entry<T> {
    fn new(adapter: Arc<T>) -> Self {
        Self {
            adapter,
            blocked: AtomicBool::new(false),
        }
    }

    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }
}

/// Split a trailing `[option,...]` block off a filename.
///
/// `"x.png[compression=9]"` gives `("x.png", Some("compression=9"))`.
pub fn split_options(name: &str) -> (&str, Option<&str>) {
    if let Some(body) = name.strip_suffix(']') {
        if let Some(open) = body.rfind('[') {
            return (&body[..open], Some(&body[open + 1..]));
        }
    }
    (name, None)
}

/// Every registered loader and saver.
#[derive(Default)]
pub struct Registry {
    loaders: Vec<Entry<dyn LoadAdapter>>,
    savers: Vec<Entry<dyn SaveAdapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loader(mut self, loader: Arc<dyn LoadAdapter>) -> Self {
        self.register_loader(loader);
        self
    }

    pub fn with_saver(mut self, saver: Arc<dyn SaveAdapter>) -> Self {
        self.register_saver(saver);
        self
    }

    pub fn register_loader(&mut self, loader: Arc<dyn LoadAdapter>) {
        log::trace!("registering loader {}", loader.nickname());
        self.loaders.push(Entry::new(loader));
    }

    pub fn register_saver(&mut self, saver: Arc<dyn SaveAdapter>) {
        log::trace!("registering saver {}", saver.nickname());
        self.savers.push(Entry::new(saver));
    }

    /// Block or unblock every adapter whose nickname starts with `prefix`.
    /// Blocked adapters are skipped by every query.
    pub fn set_blocked(&self, prefix: &str, blocked: bool) {
        for entry in &self.loaders {
            if entry.adapter.nickname().starts_with(prefix) {
                entry.blocked.store(blocked, Ordering::Release);
            }
        }
        for entry in &self.savers {
            if entry.adapter.nickname().starts_with(prefix) {
                entry.blocked.store(blocked, Ordering::Release);
            }
        }
    }

    /// Unblocked loaders, highest priority first, ties in registration order.
    fn ordered_loaders(&self) -> Vec<&Arc<dyn LoadAdapter>> {
        let mut loaders: Vec<_> = self
            .loaders
            .iter()
            .filter(|entry| !entry.is_blocked())
            .map(|entry| &entry.adapter)
            .collect();
        loaders.sort_by(|a, b| b.priority().cmp(&a.priority()));
        loaders
    }

    fn ordered_savers(&self) -> Vec<&Arc<dyn SaveAdapter>> {
        let mut savers: Vec<_> = self
            .savers
            .iter()
            .filter(|entry| !entry.is_blocked())
            .map(|entry| &entry.adapter)
            .collect();
        savers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        savers
    }

    /// Loader nicknames in search order.
    pub fn loaders(&self) -> Vec<&str> {
        self.ordered_loaders()
            .into_iter()
            .map(|loader| loader.nickname())
            .collect()
    }

    /// Saver nicknames in search order.
    pub fn savers(&self) -> Vec<&str> {
        self.ordered_savers()
            .into_iter()
            .map(|saver| saver.nickname())
            .collect()
    }

    /// Loader by nickname.
    pub fn loader(&self, nickname: &str) -> Result<Arc<dyn LoadAdapter>, ForeignError> {
        self.loaders
            .iter()
            .find(|entry| !entry.is_blocked() && entry.adapter.nickname() == nickname)
            .map(|entry| Arc::clone(&entry.adapter))
            .ok_or_else(|| ForeignError::NoSuchAdapter(nickname.into()))
    }

    /// Saver by nickname.
    pub fn saver(&self, nickname: &str) -> Result<Arc<dyn SaveAdapter>, ForeignError> {
        self.savers
            .iter()
            .find(|entry| !entry.is_blocked() && entry.adapter.nickname() == nickname)
            .map(|entry| Arc::clone(&entry.adapter))
            .ok_or_else(|| ForeignError::NoSuchAdapter(nickname.into()))
    }

    /// Pick a loader for a file.
    ///
    /// Each loader's content sniffer wins over its suffix list; the suffix
    /// list is only consulted by loaders that have no sniffer.
    pub fn find_load(&self, path: impl AsRef<Path>) -> Result<Arc<dyn LoadAdapter>, ForeignError> {
        let full = path.as_ref().to_string_lossy();
        let (name, _) = split_options(&full);
        let path = Path::new(name);

        match std::fs::metadata(path) {
            Err(_) => return Err(ForeignError::FileNotFound(path.into())),
            Ok(meta) if meta.is_dir() => return Err(ForeignError::IsDirectory(path.into())),
            Ok(_) => {}
        }

        for loader in self.ordered_loaders() {
            if !loader.sources().contains(SourceKinds::FILE) {
                continue;
            }
            log::trace!("find_load: trying {}", loader.nickname());
            match loader.is_a(path) {
                Some(true) => return Ok(Arc::clone(loader)),
                Some(false) => {}
                None if !loader.suffixes().is_empty() => {
                    if loader.suffixes().iter().any(|s| suffix_matches(name, s)) {
                        return Ok(Arc::clone(loader));
                    }
                }
                None => log::warn!(
                    "loader {} has neither a file sniffer nor suffixes",
                    loader.nickname()
                ),
            }
        }

        Err(ForeignError::UnknownFormat(format!("\"{name}\"")))
    }

    /// Pick a loader for an in-memory file.
    pub fn find_load_buffer(&self, bytes: &[u8]) -> Result<Arc<dyn LoadAdapter>, ForeignError> {
        for loader in self.ordered_loaders() {
            if !loader.sources().contains(SourceKinds::BUFFER) {
                continue;
            }
            log::trace!("find_load_buffer: trying {}", loader.nickname());
            match loader.is_a_buffer(bytes) {
                Some(true) => return Ok(Arc::clone(loader)),
                Some(false) => {}
                None => log::warn!("loader {} has no buffer sniffer", loader.nickname()),
            }
        }
        Err(ForeignError::UnknownFormat("buffer".into()))
    }

    /// Pick a loader for a stream. The stream is rewound before every
    /// sniff and left at the start on success.
    pub fn find_load_source(
        &self,
        stream: &mut dyn ReadSeek,
    ) -> Result<Arc<dyn LoadAdapter>, ForeignError> {
        for loader in self.ordered_loaders() {
            if !loader.sources().contains(SourceKinds::STREAM) {
                continue;
            }
            log::trace!("find_load_source: trying {}", loader.nickname());
            stream.seek(SeekFrom::Start(0))?;
            match loader.is_a_source(stream) {
                Some(true) => {
                    stream.seek(SeekFrom::Start(0))?;
                    return Ok(Arc::clone(loader));
                }
                Some(false) => {}
                None => log::warn!("loader {} has no source sniffer", loader.nickname()),
            }
        }
        Err(ForeignError::UnknownFormat("source".into()))
    }

    fn find_saver(&self, name: &str, kind: Option<SaveKinds>) -> Option<Arc<dyn SaveAdapter>> {
        for saver in self.ordered_savers() {
            if kind.is_some_and(|kind| !saver.kinds().contains(kind)) {
                continue;
            }
            if saver.suffixes().is_empty() {
                log::warn!("saver {} declares no suffixes", saver.nickname());
                continue;
            }
            if saver.suffixes().iter().any(|s| suffix_matches(name, s)) {
                return Some(Arc::clone(saver));
            }
        }
        None
    }

    /// Pick a saver for a filename, by suffix.
    pub fn find_save(&self, path: impl AsRef<Path>) -> Result<Arc<dyn SaveAdapter>, ForeignError> {
        let full = path.as_ref().to_string_lossy();
        let (name, _) = split_options(&full);
        self.find_saver(name, Some(SaveKinds::FILE))
            .ok_or_else(|| ForeignError::UnknownFormat(format!("\"{name}\"")))
    }

    /// Pick a saver for a suffix such as `".png"`, whatever it writes to.
    pub fn find_save_for_suffix(&self, suffix: &str) -> Result<Arc<dyn SaveAdapter>, ForeignError> {
        let (name, _) = split_options(suffix);
        self.find_saver(name, None)
            .ok_or_else(|| ForeignError::UnknownSuffix(name.into(), "file"))
    }

    /// Pick a saver that can write to memory.
    pub fn find_save_buffer(&self, suffix: &str) -> Result<Arc<dyn SaveAdapter>, ForeignError> {
        let (name, _) = split_options(suffix);
        self.find_saver(name, Some(SaveKinds::BUFFER))
            .ok_or_else(|| ForeignError::UnknownSuffix(name.into(), "buffer"))
    }

    /// Pick a saver that can write to a stream target.
    pub fn find_save_target(&self, suffix: &str) -> Result<Arc<dyn SaveAdapter>, ForeignError> {
        let (name, _) = split_options(suffix);
        self.find_saver(name, Some(SaveKinds::TARGET))
            .ok_or_else(|| ForeignError::UnknownSuffix(name.into(), "target"))
    }

    /// Every suffix any saver writes, in search order, without repeats.
    pub fn save_suffixes(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for saver in self.ordered_savers() {
            for suffix in saver.suffixes() {
                if !out.iter().any(|s| s.eq_ignore_ascii_case(suffix)) {
                    out.push((*suffix).to_owned());
                }
            }
        }
        out
    }

    /// Does the named loader accept this file?
    pub fn is_a(&self, nickname: &str, path: impl AsRef<Path>) -> Result<bool, ForeignError> {
        let loader = self.loader(nickname)?;
        let full = path.as_ref().to_string_lossy();
        let (name, _) = split_options(&full);
        Ok(loader.is_a(Path::new(name)).unwrap_or_else(|| {
            loader.suffixes().iter().any(|s| suffix_matches(name, s))
        }))
    }

    pub fn is_a_buffer(&self, nickname: &str, bytes: &[u8]) -> Result<bool, ForeignError> {
        Ok(self.loader(nickname)?.is_a_buffer(bytes).unwrap_or(false))
    }

    pub fn is_a_source(&self, nickname: &str, stream: &mut dyn ReadSeek) -> Result<bool, ForeignError> {
        let loader = self.loader(nickname)?;
        stream.seek(SeekFrom::Start(0))?;
        Ok(loader.is_a_source(stream).unwrap_or(false))
    }

    /// Flags the named loader reports for a file, conflict resolved.
    pub fn flags_for_path(&self, nickname: &str, path: impl AsRef<Path>) -> Result<LoadFlags, ForeignError> {
        let loader = self.loader(nickname)?;
        let full = path.as_ref().to_string_lossy();
        let (name, _) = split_options(&full);
        let (flags, _) = loader.flags_for_path(Path::new(name)).normalized();
        Ok(flags)
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Install the process-wide registry. Fails, handing the registry back, if
/// one is already installed (or [`global`] was called first).
pub fn init(registry: Registry) -> Result<(), Registry> {
    GLOBAL.set(registry)
}

/// The process-wide registry; empty unless [`init`] ran first.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}
