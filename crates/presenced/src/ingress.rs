//! Snapshot payload checks run before any extraction work.

use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;

pub const MIN_SIDE: u32 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRejected {
    #[error("snapshot is empty")]
    Empty,
    #[error("snapshot is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("unsupported image format (expected JPEG, PNG or WebP)")]
    UnsupportedFormat,
    #[error("image is {width}x{height}, minimum is {min}x{min}")]
    TooSmall { width: u32, height: u32, min: u32 },
}

/// A payload that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidSnapshot {
    pub format: ImageFormat,
    /// `None` when the header could not be decoded; extraction decides then.
    pub dimensions: Option<(u32, u32)>,
}

impl ValidSnapshot {
    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "png",
            ImageFormat::WebP => "webp",
            _ => "jpg",
        }
    }
}

pub fn validate(bytes: &[u8], max_bytes: usize) -> Result<ValidSnapshot, SnapshotRejected> {
    if bytes.is_empty() {
        return Err(SnapshotRejected::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(SnapshotRejected::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let format = match image::guess_format(bytes) {
        Ok(f @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => f,
        _ => return Err(SnapshotRejected::UnsupportedFormat),
    };

    let dimensions = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .ok();
    if let Some((width, height)) = dimensions {
        if width < MIN_SIDE || height < MIN_SIDE {
            return Err(SnapshotRejected::TooSmall {
                width,
                height,
                min: MIN_SIDE,
            });
        }
    }

    Ok(ValidSnapshot { format, dimensions })
}
