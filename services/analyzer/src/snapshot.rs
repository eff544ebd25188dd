//! Still image of the triggering frame.

use crate::frame::{Frame, PixelFormat};
use image::{ImageFormat, RgbImage};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshots need BGR24 frames, got {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("Frame buffer does not match {width}x{height}")]
    InvalidBuffer { width: u32, height: u32 },

    #[error("Failed to write snapshot: {0}")]
    Image(#[from] image::ImageError),
}

/// Write the frame's pixels as a JPEG without any color-space conversion.
///
/// Only the channel order changes, since the image encoder expects RGB.
pub fn write_snapshot(frame: &Frame, path: &Path) -> Result<(), SnapshotError> {
    if frame.format() != PixelFormat::Bgr24 {
        return Err(SnapshotError::UnsupportedFormat(frame.format()));
    }

    let mut rgb = Vec::with_capacity(frame.size());
    for px in frame.data().chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    let image = RgbImage::from_raw(frame.width(), frame.height(), rgb).ok_or(
        SnapshotError::InvalidBuffer {
            width: frame.width(),
            height: frame.height(),
        },
    )?;
    image.save_with_format(path, ImageFormat::Jpeg)?;

    Ok(())
}
