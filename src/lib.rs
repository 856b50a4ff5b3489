//! # zenforeign
//!
//! Format-adapter framework: the layer between an image pipeline and its
//! codecs.
//!
//! - A [`Registry`] holds every [`LoadAdapter`] and [`SaveAdapter`] in
//!   priority order and answers "who reads this file / buffer / stream" and
//!   "who writes this suffix".
//! - A [`LoadOperation`] runs a loader's header routine eagerly and decodes
//!   pixels lazily, once, on first access, into memory, a temp file, or
//!   straight from the loader.
//! - A [`SaveOperation`] converts any image into the coding, band structure
//!   and numeric format a saver accepts, applies the metadata keep policy
//!   and hands the result to the saver.
//!
//! Codecs themselves live elsewhere; they plug in by implementing the
//! adapter traits.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use zenforeign::{registry, save_to_path, LoadOperation, LoadOptions, SaveOptions};
//!
//! let registry = registry::global();
//! let op = LoadOperation::from_path(registry, "photo.tif", LoadOptions::new())?;
//! save_to_path(registry, op.image(), "photo.jpg[Q=90]", &SaveOptions::new())?;
//! # Ok::<(), zenforeign::ForeignError>(())
//! ```

#![forbid(unsafe_code)]

mod adapter;
mod coding;
mod colour;
pub mod config;
mod error;
mod flags;
mod format;
mod image;
mod limits;
mod load;
mod metadata;
mod ops;
pub mod registry;
mod save;

#[cfg(test)]
mod testing;

pub use adapter::{LoadAdapter, LoadContext, LoadSource, ReadSeek, SaveAdapter};
pub use colour::{BuiltinColour, ColourEngine};
pub use error::{AdapterError, ForeignError, SharedError};
pub use flags::{CodingSet, Keep, LoadFlags, SaveKinds, Saveable, SourceKinds};
pub use format::{Access, BandFormat, Coding, FailOn, FormatTable, Interpretation};
pub use image::{meta, Backing, Image, ImageHeader, MetaValue, Rect, Region, RegionSource};
pub use limits::Limits;
pub use load::{LoadCache, LoadOperation, LoadOptions};
pub use metadata::{is_metadata_field, rebuild_exif, update_metadata};
pub use registry::Registry;
pub use save::{
    apply_saveable, convert_saveable, save_to_buffer, save_to_path, SaveOperation, SaveOptions,
};
