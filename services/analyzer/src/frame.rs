//! Decoded video frames.
//!
//! A [`Frame`] owns its pixel buffer outright. It is deliberately not `Clone`:
//! a frame moves from the source to the control loop, into the alarm window,
//! into an [`Alarm`](crate::alarm::Alarm) and finally into the encoder, and its
//! buffer is released exactly once when the last owner drops it.

use std::fmt;
use thiserror::Error;

/// Errors raised when a frame buffer does not match its declared layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame dimensions must be non-zero, got {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },

    #[error("Buffer size mismatch for {format}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Interleaved 8-bit B, G, R.
    Bgr24,
    /// Planar Y, then U, then V with 2x2 chroma subsampling.
    Yuv420p,
}

impl PixelFormat {
    /// Number of bytes a tightly packed buffer of this layout occupies.
    pub fn buffer_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Bgr24 => w * h * 3,
            PixelFormat::Yuv420p => {
                let (cw, ch) = chroma_dimensions(width, height);
                w * h + 2 * cw * ch
            }
        }
    }

    /// GStreamer raw video format name.
    pub fn gst_name(self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "BGR",
            PixelFormat::Yuv420p => "I420",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Bgr24 => f.write_str("BGR24"),
            PixelFormat::Yuv420p => f.write_str("YUV420P"),
        }
    }
}

/// Chroma plane dimensions for 4:2:0 subsampling, rounding odd sizes up.
pub fn chroma_dimensions(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

/// A decoded frame with detection metadata.
pub struct Frame {
    format: PixelFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,

    /// Source sequence number, assigned by the transport
    pub sequence: u64,

    /// Whether the detector flagged this frame as an event
    pub happen: bool,

    /// Confidence of the event that flagged this frame
    pub happen_score: f32,
}

impl Frame {
    /// Wrap an owned buffer, checking it matches the layout.
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroDimension { width, height });
        }

        let expected = format.buffer_size(width, height);
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                format,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            format,
            width,
            height,
            data,
            sequence: 0,
            happen: false,
            happen_score: 0.0,
        })
    }

    /// Allocate a zero-filled frame.
    pub fn zeroed(format: PixelFormat, width: u32, height: u32) -> Result<Self, FrameError> {
        Self::new(format, width, height, vec![0u8; format.buffer_size(width, height)])
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Flag this frame as the one an event was detected on.
    pub fn mark_happen(&mut self, score: f32) {
        self.happen = true;
        self.happen_score = score;
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.data.len())
            .field("sequence", &self.sequence)
            .field("happen", &self.happen)
            .field("happen_score", &self.happen_score)
            .finish()
    }
}
