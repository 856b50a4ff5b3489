//! Load operations: header phase, lazy realization, backing selection.
//!
//! [`LoadOperation::new`] runs the loader's header routine straight away and
//! hands back an output image whose pixels are not decoded yet. The first
//! region request decodes into a backing image, exactly once, and every
//! later request is served from that backing image.
//!
//! A failed decode is sticky: the error is kept and replayed to every later
//! request, the loader is never called again, and the operation reports
//! itself invalid so a [`LoadCache`] never hands it out again.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::adapter::{LoadAdapter, LoadContext, LoadSource, ReadSeek};
use crate::error::ForeignError;
use crate::flags::LoadFlags;
use crate::format::{Access, FailOn};
use crate::image::{meta, Backing, Image, ImageHeader, Rect, Region, RegionSource};
use crate::limits::Limits;
use crate::registry::{split_options, Registry};

/// Options for one load.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoadOptions {
    /// Access pattern the caller will use. Default: random.
    pub access: Access,
    /// Always decode into memory.
    pub memory: bool,
    /// Deprecated: `false` forces memory backing.
    pub disc: bool,
    /// Warning level that turns into a load error. Default: never.
    pub fail_on: Option<FailOn>,
    /// Deprecated: `true` means fail on warnings, unless `fail_on` is set.
    pub fail: Option<bool>,
    /// Deprecated and ignored; use `access`.
    pub sequential: bool,
    /// Never serve or store this load from a cache.
    pub revalidate: bool,
    /// Overrides [`config::disc_threshold`](crate::config::disc_threshold).
    pub disc_threshold: Option<u64>,
    /// Dimension and memory caps checked after the header is read.
    pub limits: Limits,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            access: Access::Random,
            memory: false,
            disc: true,
            fail_on: None,
            fail: None,
            sequential: false,
            revalidate: false,
            disc_threshold: None,
            limits: Limits::none(),
        }
    }
}

impl LoadOptions {
    /// Random access, no limits, process-wide disc threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the access pattern.
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Always decode into memory, whatever the image size.
    pub fn with_memory(mut self, memory: bool) -> Self {
        self.memory = memory;
        self
    }

    /// Deprecated: `false` forces memory backing.
    pub fn with_disc(mut self, disc: bool) -> Self {
        self.disc = disc;
        self
    }

    /// Fail the load on warnings at or above `fail_on`.
    pub fn with_fail_on(mut self, fail_on: FailOn) -> Self {
        self.fail_on = Some(fail_on);
        self
    }

    /// Deprecated: use [`with_fail_on`](Self::with_fail_on).
    pub fn with_fail(mut self, fail: bool) -> Self {
        self.fail = Some(fail);
        self
    }

    /// Deprecated and ignored: use [`with_access`](Self::with_access).
    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Bypass [`LoadCache`] for this load.
    pub fn with_revalidate(mut self, revalidate: bool) -> Self {
        self.revalidate = revalidate;
        self
    }

    /// Images larger than `bytes` decode to a temp file.
    pub fn with_disc_threshold(mut self, bytes: u64) -> Self {
        self.disc_threshold = Some(bytes);
        self
    }

    /// Reject images whose header exceeds `limits`.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Warning escalation after folding in the deprecated `fail` flag.
    pub fn effective_fail_on(&self) -> FailOn {
        match (self.fail_on, self.fail) {
            (Some(fail_on), _) => fail_on,
            (None, Some(true)) => FailOn::Warning,
            (None, _) => FailOn::None,
        }
    }

    fn forces_memory(&self) -> bool {
        self.memory || !self.disc
    }

    fn disc_threshold(&self) -> u64 {
        self.disc_threshold
            .unwrap_or_else(crate::config::disc_threshold)
    }
}

/// Validity of one load operation, shared with its backing image through a
/// weak reference so a loader can flag a bad read from inside `load`.
pub(crate) struct LoadStatus {
    loader: String,
    invalid: AtomicBool,
}

impl LoadStatus {
    pub(crate) fn invalidate(&self) {
        if !self.invalid.swap(true, Ordering::AcqRel) {
            log::debug!("{}: load operation invalidated", self.loader);
        }
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }
}

/// State behind a lazily loaded image. The output image holds it as its
/// region source, so it lives as long as the image does.
struct LoadState {
    adapter: Arc<dyn LoadAdapter>,
    options: LoadOptions,
    flags: LoadFlags,
    header: ImageHeader,
    context: Mutex<LoadContext>,
    real: OnceLock<Result<Image, ForeignError>>,
    backing: OnceLock<Backing>,
    failed: AtomicBool,
    swap: bool,
    status: Arc<LoadStatus>,
}

impl LoadState {
    fn nickname(&self) -> &str {
        self.adapter.nickname()
    }

    fn select_backing(&self) -> Backing {
        let backing = if self.options.forces_memory() {
            Backing::Memory
        } else if self.flags.contains(LoadFlags::PARTIAL) {
            Backing::Direct
        } else if self.flags.contains(LoadFlags::SEQUENTIAL) && self.options.access != Access::Random
        {
            Backing::Direct
        } else if self.header.size_bytes() > self.options.disc_threshold() {
            Backing::TempFile
        } else {
            Backing::Memory
        };
        log::debug!(
            "{}: {}x{} {:?}, backing {backing:?}",
            self.nickname(),
            self.header.width,
            self.header.height,
            self.flags
        );
        backing
    }

    fn fail(&self, error: ForeignError) -> ForeignError {
        self.failed.store(true, Ordering::Release);
        self.status.invalidate();
        log::debug!("{}: realization failed: {error}", self.nickname());
        error
    }

    /// Decode into a fresh backing image. Runs at most once.
    fn build(&self) -> Result<Image, ForeignError> {
        let backing = *self.backing.get_or_init(|| self.select_backing());

        let mut real = Image::with_backing(self.header, backing);
        real.set_byteswap(self.swap);
        real.set_origin(Arc::downgrade(&self.status));

        let mut context = self.context.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(error) = self.adapter.load(&mut context, &mut real) {
            return Err(self.fail(ForeignError::load(self.nickname(), error)));
        }
        if !real.has_pixels() {
            return Err(self.fail(ForeignError::load(
                self.nickname(),
                "loader wrote no pixels".into(),
            )));
        }
        if !real.header().is_compatible(&self.header) {
            return Err(self.fail(ForeignError::Mismatch {
                loader: self.nickname().into(),
            }));
        }
        log::debug!("{}: backing image built", self.nickname());
        Ok(real)
    }

    fn real(&self) -> Result<&Image, ForeignError> {
        match self.real.get_or_init(|| self.build()) {
            Ok(real) => Ok(real),
            Err(error) => Err(error.clone()),
        }
    }
}

impl RegionSource for LoadState {
    fn prepare(&self, rect: Rect) -> Result<Region<'_>, ForeignError> {
        let real = self.real()?;
        let region = real.prepare(rect)?;
        if self.swap && self.backing.get() == Some(&Backing::Direct) {
            let mut bytes = Vec::new();
            region.copy_to(&mut bytes);
            crate::ops::swap_words(&mut bytes, self.header.format);
            return Region::owned(rect, self.header.bytes_per_pixel(), bytes);
        }
        Ok(region)
    }
}

/// One load: the output image plus the state that realizes it.
#[derive(Clone)]
pub struct LoadOperation {
    out: Image,
    state: Arc<LoadState>,
    nocache: bool,
}

impl fmt::Debug for LoadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOperation")
            .field("loader", &self.loader())
            .field("flags", &self.state.flags)
            .field("valid", &self.is_valid())
            .field("cacheable", &self.is_cacheable())
            .finish()
    }
}

impl LoadOperation {
    /// Run the header phase of `adapter` on `source`.
    ///
    /// No pixels are decoded here unless the loader does all its work in
    /// the header routine.
    pub fn new(
        adapter: Arc<dyn LoadAdapter>,
        source: LoadSource,
        options: LoadOptions,
    ) -> Result<Self, ForeignError> {
        let nickname = adapter.nickname().to_owned();
        if !adapter.sources().contains(source.kind()) {
            return Err(ForeignError::InvalidInput(format!(
                "{nickname} cannot load from {:?}",
                source.kind()
            )));
        }
        if options.sequential {
            log::warn!("{nickname}: ignoring deprecated \"sequential\" option, use access");
        }
        if options.fail.is_some() {
            log::warn!("{nickname}: \"fail\" is deprecated, use fail_on");
        }
        if !options.disc {
            log::warn!("{nickname}: \"disc\" is deprecated, use memory");
        }

        let mut context = LoadContext {
            source,
            access: options.access,
            fail_on: options.effective_fail_on(),
        };

        let (flags, conflict) = adapter.flags(&context).normalized();
        if conflict {
            log::warn!("{nickname}: loader reports both PARTIAL and SEQUENTIAL, using SEQUENTIAL");
        }

        let mut out = Image::new(ImageHeader::default());
        adapter
            .header(&mut context, &mut out)
            .map_err(|error| ForeignError::header(&nickname, error))?;
        let header = *out.header();
        options.limits.check(&header)?;

        out.set_string(meta::LOADER, &nickname);
        if options.access != Access::Random {
            out.set_int(meta::SEQUENTIAL, 1);
        }

        let nocache = options.revalidate
            || (flags.contains(LoadFlags::SEQUENTIAL) && options.access != Access::Random);
        let swap = flags.contains(LoadFlags::BIGENDIAN) && cfg!(target_endian = "little");
        let status = Arc::new(LoadStatus {
            loader: nickname,
            invalid: AtomicBool::new(false),
        });

        let state = Arc::new(LoadState {
            adapter,
            options,
            flags,
            header,
            context: Mutex::new(context),
            real: OnceLock::new(),
            backing: OnceLock::new(),
            failed: AtomicBool::new(false),
            swap,
            status,
        });

        out.set_origin(Arc::downgrade(&state.status));
        if state.adapter.has_load() {
            out.attach_source(Arc::clone(&state) as Arc<dyn RegionSource>);
        }

        Ok(Self { out, state, nocache })
    }

    /// Find a loader for `path` in `registry` and run its header phase.
    pub fn from_path(
        registry: &Registry,
        path: impl AsRef<Path>,
        options: LoadOptions,
    ) -> Result<Self, ForeignError> {
        let adapter = registry.find_load(path.as_ref())?;
        Self::new(adapter, LoadSource::Path(strip_options(path.as_ref())), options)
    }

    pub fn from_buffer(
        registry: &Registry,
        bytes: Arc<[u8]>,
        options: LoadOptions,
    ) -> Result<Self, ForeignError> {
        let adapter = registry.find_load_buffer(&bytes)?;
        Self::new(adapter, LoadSource::Buffer(bytes), options)
    }

    pub fn from_source(
        registry: &Registry,
        mut stream: Box<dyn ReadSeek>,
        options: LoadOptions,
    ) -> Result<Self, ForeignError> {
        let adapter = registry.find_load_source(stream.as_mut())?;
        Self::new(adapter, LoadSource::Stream(stream), options)
    }

    /// The output image. Pixel requests on it trigger the decode.
    pub fn image(&self) -> &Image {
        &self.out
    }

    pub fn into_image(self) -> Image {
        self.out
    }

    pub fn loader(&self) -> &str {
        self.state.nickname()
    }

    /// Loader flags after the PARTIAL/SEQUENTIAL conflict is resolved.
    pub fn flags(&self) -> LoadFlags {
        self.state.flags
    }

    /// Backing chosen for the decode, once the decode has started.
    pub fn backing(&self) -> Option<Backing> {
        self.state.backing.get().copied()
    }

    /// Whether the decode has completed successfully.
    pub fn is_realized(&self) -> bool {
        matches!(self.state.real.get(), Some(Ok(_)))
    }

    /// False once decoding failed or the loader invalidated the operation.
    pub fn is_valid(&self) -> bool {
        !self.state.failed.load(Ordering::Acquire) && !self.state.status.is_invalid()
    }

    /// Whether the result may be reused for an identical request.
    pub fn is_cacheable(&self) -> bool {
        !self.nocache && self.is_valid()
    }
}

fn strip_options(path: &Path) -> PathBuf {
    let full = path.to_string_lossy();
    PathBuf::from(split_options(&full).0)
}

type CacheKey = (String, PathBuf, LoadOptions);

/// Reuses path loads with identical loader, path and options.
///
/// Operations that are not cacheable are never stored, and stored ones that
/// became invalid are dropped on the next lookup.
#[derive(Default)]
pub struct LoadCache {
    entries: Mutex<HashMap<CacheKey, LoadOperation>>,
}

impl LoadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(
        &self,
        registry: &Registry,
        path: impl AsRef<Path>,
        options: LoadOptions,
    ) -> Result<LoadOperation, ForeignError> {
        let adapter = registry.find_load(path.as_ref())?;
        let path = strip_options(path.as_ref());
        let key = (adapter.nickname().to_owned(), path.clone(), options.clone());

        if !options.revalidate {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                Some(op) if op.is_cacheable() => {
                    log::trace!("load cache hit for {}", path.display());
                    return Ok(op.clone());
                }
                Some(_) => {
                    entries.remove(&key);
                }
                None => {}
            }
        }

        let op = LoadOperation::new(adapter, LoadSource::Path(path), options)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if op.is_cacheable() {
            entries.insert(key, op.clone());
        } else {
            entries.remove(&key);
        }
        Ok(op)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
