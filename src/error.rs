//! Unified error type for adapter resolution, load, save and metadata handling.

use std::path::PathBuf;
use std::sync::Arc;

use crate::format::{BandFormat, Coding, Interpretation};

/// Error type returned by codec adapters.
///
/// Adapters live outside this crate, so they report whatever error type they
/// like; the framework wraps it together with the adapter nickname.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// Shared form of an adapter error, so failures can be replayed.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Unified error type for all framework operations.
///
/// The type is `Clone` so a sticky realization failure can be handed to every
/// thread that asks the same load operation for pixels.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ForeignError {
    /// The path given for loading does not exist.
    #[error("file \"{}\" does not exist", .0.display())]
    FileNotFound(PathBuf),

    /// The path given for loading is a directory.
    #[error("\"{}\" is a directory", .0.display())]
    IsDirectory(PathBuf),

    /// No registered loader or saver recognised the input.
    #[error("{0} is not a known file format")]
    UnknownFormat(String),

    /// No saver declares the requested suffix.
    #[error("\"{0}\" is not a known {1} format")]
    UnknownSuffix(String, &'static str),

    /// No adapter with this nickname is registered.
    #[error("no adapter named \"{0}\"")]
    NoSuchAdapter(String),

    /// The adapter's header routine failed.
    #[error("{loader}: header read failed: {source}")]
    Header {
        loader: String,
        #[source]
        source: SharedError,
    },

    /// The adapter's pixel-load routine failed.
    #[error("{loader}: load failed: {source}")]
    Load {
        loader: String,
        #[source]
        source: SharedError,
    },

    /// Header phase and full decode disagree on geometry, bands, format or coding.
    #[error("{loader}: images do not match between header and load")]
    Mismatch { loader: String },

    /// Pixels were requested from an image that has none attached.
    #[error("image has no pixel data")]
    NoPixels,

    /// The saver accepts none of the band structures we can produce.
    #[error("{0}: saver does not support any output type")]
    NoSaveableType(String),

    /// A colourspace or ICC transform step failed.
    #[error("colour conversion from {from:?} to {to:?} failed: {detail}")]
    Colour {
        from: Interpretation,
        to: Interpretation,
        detail: &'static str,
    },

    /// A numeric cast step failed.
    #[error("cannot cast {from:?} to {to:?} with coding {coding:?}")]
    Cast {
        from: BandFormat,
        to: BandFormat,
        coding: Coding,
    },

    /// EXIF could not be rebuilt from the image fields.
    #[error("exif update failed: {0}")]
    Exif(String),

    /// A metadata entry could not be updated or removed.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Input validation failed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A resource limit was exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    /// A saver's byte-level writer failed.
    #[error("{saver}: write failed: {source}")]
    Write {
        saver: String,
        #[source]
        source: SharedError,
    },

    /// Filesystem or stream error.
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ForeignError {
    fn from(error: std::io::Error) -> Self {
        ForeignError::Io(Arc::new(error))
    }
}

impl ForeignError {
    /// Wrap an adapter header failure.
    pub fn header(loader: &str, error: AdapterError) -> Self {
        ForeignError::Header {
            loader: loader.into(),
            source: Arc::from(error),
        }
    }

    /// Wrap an adapter pixel-load failure.
    pub fn load(loader: &str, error: AdapterError) -> Self {
        ForeignError::Load {
            loader: loader.into(),
            source: Arc::from(error),
        }
    }

    /// Wrap a saver write failure.
    pub fn write(saver: &str, error: AdapterError) -> Self {
        ForeignError::Write {
            saver: saver.into(),
            source: Arc::from(error),
        }
    }

    /// Whether this error came from resolving an adapter.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            ForeignError::FileNotFound(_)
                | ForeignError::IsDirectory(_)
                | ForeignError::UnknownFormat(_)
                | ForeignError::UnknownSuffix(..)
                | ForeignError::NoSuchAdapter(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_errors_are_distinct() {
        let missing = ForeignError::FileNotFound("/nope/x.png".into());
        let dir = ForeignError::IsDirectory("/tmp".into());
        let unknown = ForeignError::UnknownFormat("\"x.zzz\"".into());

        assert!(missing.to_string().contains("does not exist"));
        assert!(dir.to_string().contains("is a directory"));
        assert!(unknown.to_string().contains("not a known file format"));
        assert!(missing.is_resolution() && dir.is_resolution() && unknown.is_resolution());
    }

    #[test]
    fn wrapped_adapter_error_keeps_source() {
        let err = ForeignError::load("fakeload", "truncated file".into());
        assert!(err.to_string().contains("fakeload"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("truncated file"));
        assert!(!err.is_resolution());
    }
}
