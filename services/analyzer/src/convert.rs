//! BGR24 to YUV420P conversion for the alarm encoder.
//!
//! The transform is integer-only BT.601 (studio swing). Each output sample is a
//! pure function of one pixel's three channel values, so identical input
//! always yields byte-identical output.

use crate::frame::{chroma_dimensions, PixelFormat};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Source buffer is {actual} bytes, expected {expected} for {width}x{height} BGR24")]
    SourceSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Destination buffer is {actual} bytes, expected {expected} for {width}x{height} YUV420P")]
    DestinationSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

#[inline]
pub fn chroma_u(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128)
}

#[inline]
pub fn chroma_v(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128)
}

/// Convert a tightly packed BGR24 image into a planar YUV420P buffer.
///
/// U for each 2x2 block is sampled from the block's top-left pixel and V from
/// the pixel below it. When the height is odd the last block has a single row,
/// so both come from its top-left pixel.
/// `out` must be exactly `PixelFormat::Yuv420p.buffer_size(width, height)`.
pub fn bgr24_to_yuv420p(
    bgr: &[u8],
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<(), ConvertError> {
    let expected_src = PixelFormat::Bgr24.buffer_size(width, height);
    if bgr.len() != expected_src {
        return Err(ConvertError::SourceSize {
            width,
            height,
            expected: expected_src,
            actual: bgr.len(),
        });
    }

    let expected_dst = PixelFormat::Yuv420p.buffer_size(width, height);
    if out.len() != expected_dst {
        return Err(ConvertError::DestinationSize {
            width,
            height,
            expected: expected_dst,
            actual: out.len(),
        });
    }

    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = chroma_dimensions(width, height);
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for (row, bgr_row) in bgr.chunks_exact(w * 3).enumerate() {
        let y_row = &mut y_plane[row * w..(row + 1) * w];

        for (col, px) in bgr_row.chunks_exact(3).enumerate() {
            let (b, g, r) = (px[0], px[1], px[2]);
            y_row[col] = luma(r, g, b);

            if col % 2 != 0 {
                continue;
            }
            let idx = (row / 2) * cw + col / 2;
            if row % 2 == 0 {
                u_plane[idx] = chroma_u(r, g, b);
                if row + 1 == h {
                    v_plane[idx] = chroma_v(r, g, b);
                }
            } else {
                v_plane[idx] = chroma_v(r, g, b);
            }
        }
    }

    debug_assert_eq!(h.div_ceil(2), ch);
    Ok(())
}
