//! Process-wide tunables.
//!
//! The disc threshold decides when a load that needs its own pixel storage
//! goes to a temporary file instead of memory. It is read from
//! `ZENFOREIGN_DISC_THRESHOLD` the first time it is needed, unless
//! [`set_disc_threshold`] ran before. Individual loads can override it with
//! [`LoadOptions::with_disc_threshold`](crate::LoadOptions::with_disc_threshold).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Once, RwLock};

/// Default disc threshold: 100 MiB.
pub const DEFAULT_DISC_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Environment variable read for the disc threshold.
pub const DISC_THRESHOLD_ENV: &str = "ZENFOREIGN_DISC_THRESHOLD";

static DISC_THRESHOLD: AtomicU64 = AtomicU64::new(DEFAULT_DISC_THRESHOLD);
static DISC_THRESHOLD_INIT: Once = Once::new();
static TEMP_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Parse a size such as `"512"`, `"64k"`, `"100mb"` or `"2G"`.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let scale = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(scale)
}

fn init_from_env() {
    DISC_THRESHOLD_INIT.call_once(|| {
        let Ok(text) = std::env::var(DISC_THRESHOLD_ENV) else {
            return;
        };
        match parse_size(&text) {
            Some(bytes) => DISC_THRESHOLD.store(bytes, Ordering::Relaxed),
            None => log::warn!("ignoring unparseable {DISC_THRESHOLD_ENV}={text:?}"),
        }
    });
}

/// Images larger than this many uncompressed bytes get temp-file backing.
pub fn disc_threshold() -> u64 {
    init_from_env();
    DISC_THRESHOLD.load(Ordering::Relaxed)
}

/// Replace the process-wide disc threshold, overriding the environment.
pub fn set_disc_threshold(bytes: u64) {
    init_from_env();
    DISC_THRESHOLD.store(bytes, Ordering::Relaxed);
}

/// Directory temp-file backing is created in.
pub fn temp_dir() -> PathBuf {
    TEMP_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(std::env::temp_dir)
}

/// Put temp-file backing somewhere else; `None` restores the system default.
pub fn set_temp_dir(dir: Option<PathBuf>) {
    *TEMP_DIR.write().unwrap_or_else(|e| e.into_inner()) = dir;
}
