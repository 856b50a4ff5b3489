//! Resource limits checked against a loader's header before any pixels
//! are decoded.

use crate::error::ForeignError;
use crate::image::ImageHeader;

/// Upper bounds a load must respect. Unset fields do not limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Limits {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Maximum width times height.
    pub max_pixels: Option<u64>,
    /// Maximum uncompressed size in bytes.
    pub max_memory_bytes: Option<u64>,
}

impl Limits {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_max_width(mut self, width: u32) -> Self {
        self.max_width = Some(width);
        self
    }

    pub fn with_max_height(mut self, height: u32) -> Self {
        self.max_height = Some(height);
        self
    }

    pub fn with_max_pixels(mut self, pixels: u64) -> Self {
        self.max_pixels = Some(pixels);
        self
    }

    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Reject a header that breaks any limit.
    pub fn check(&self, header: &ImageHeader) -> Result<(), ForeignError> {
        if self.max_width.is_some_and(|max| header.width > max) {
            return Err(ForeignError::LimitExceeded("width exceeds limit"));
        }
        if self.max_height.is_some_and(|max| header.height > max) {
            return Err(ForeignError::LimitExceeded("height exceeds limit"));
        }
        let pixels = u64::from(header.width).saturating_mul(u64::from(header.height));
        if self.max_pixels.is_some_and(|max| pixels > max) {
            return Err(ForeignError::LimitExceeded("pixel count exceeds limit"));
        }
        if self.max_memory_bytes.is_some_and(|max| header.size_bytes() > max) {
            return Err(ForeignError::LimitExceeded("image size exceeds memory limit"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BandFormat;

    #[test]
    fn unlimited_accepts_anything() {
        let header = ImageHeader::new(u32::MAX, u32::MAX, 4, BandFormat::Double);
        assert!(Limits::none().check(&header).is_ok());
    }

    #[test]
    fn each_bound_is_enforced() {
        let header = ImageHeader::new(1000, 1000, 3, BandFormat::UChar);
        assert!(Limits::none().with_max_width(999).check(&header).is_err());
        assert!(Limits::none().with_max_height(1000).check(&header).is_ok());
        assert!(Limits::none().with_max_pixels(500_000).check(&header).is_err());
        assert!(Limits::none().with_max_memory(3_000_000).check(&header).is_ok());

        let err = Limits::none().with_max_memory(2_999_999).check(&header).unwrap_err();
        assert!(matches!(err, ForeignError::LimitExceeded(_)));
    }
}
