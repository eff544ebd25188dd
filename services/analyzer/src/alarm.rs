//! Alarm evidence bundles.

use crate::frame::Frame;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlarmError {
    #[error("Alarm for control {0} has no frames")]
    Empty(String),

    #[error("Trigger index {index} out of range for {count} frames")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Frame {index} is {actual_width}x{actual_height}, alarm is {width}x{height}")]
    DimensionMismatch {
        index: usize,
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Alarm frame rate must be greater than 0")]
    ZeroFps,
}

/// Named fields for building an [`Alarm`].
pub struct AlarmParts {
    pub control_code: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Event time in milliseconds since the Unix epoch
    pub happen_timestamp: i64,
    pub happen_index: usize,
    pub frames: Vec<Frame>,
}

/// Frames spanning the pre- and post-event windows of one detected event.
///
/// The trigger index is guaranteed to address a frame and every frame has the
/// alarm's dimensions.
pub struct Alarm {
    control_code: String,
    width: u32,
    height: u32,
    fps: u32,
    happen_timestamp: i64,
    happen_index: usize,
    frames: Vec<Frame>,
}

impl Alarm {
    pub fn new(parts: AlarmParts) -> Result<Self, AlarmError> {
        if parts.fps == 0 {
            return Err(AlarmError::ZeroFps);
        }
        if parts.frames.is_empty() {
            return Err(AlarmError::Empty(parts.control_code));
        }
        if parts.happen_index >= parts.frames.len() {
            return Err(AlarmError::IndexOutOfRange {
                index: parts.happen_index,
                count: parts.frames.len(),
            });
        }
        if let Some((index, frame)) = parts
            .frames
            .iter()
            .enumerate()
            .find(|(_, f)| f.width() != parts.width || f.height() != parts.height)
        {
            return Err(AlarmError::DimensionMismatch {
                index,
                width: parts.width,
                height: parts.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }

        Ok(Self {
            control_code: parts.control_code,
            width: parts.width,
            height: parts.height,
            fps: parts.fps,
            happen_timestamp: parts.happen_timestamp,
            happen_index: parts.happen_index,
            frames: parts.frames,
        })
    }

    pub fn control_code(&self) -> &str {
        &self.control_code
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn happen_timestamp(&self) -> i64 {
        self.happen_timestamp
    }

    pub fn happen_index(&self) -> usize {
        self.happen_index
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Hand the frames over to the consumer.
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("control_code", &self.control_code)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("fps", &self.fps)
            .field("happen_timestamp", &self.happen_timestamp)
            .field("happen_index", &self.happen_index)
            .field("frames", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn frames(count: usize, width: u32, height: u32) -> Vec<Frame> {
        (0..count)
            .map(|_| Frame::zeroed(PixelFormat::Bgr24, width, height).unwrap())
            .collect()
    }

    fn parts(frames: Vec<Frame>, happen_index: usize) -> AlarmParts {
        AlarmParts {
            control_code: "cam-1".to_string(),
            width: 4,
            height: 4,
            fps: 10,
            happen_timestamp: 1_700_000_000_000,
            happen_index,
            frames,
        }
    }

    #[test]
    fn test_valid_alarm() {
        let alarm = Alarm::new(parts(frames(5, 4, 4), 4)).unwrap();
        assert_eq!(alarm.len(), 5);
        assert_eq!(alarm.happen_index(), 4);
        assert_eq!(alarm.control_code(), "cam-1");
    }

    #[test]
    fn test_index_out_of_range() {
        assert_eq!(
            Alarm::new(parts(frames(3, 4, 4), 3)).unwrap_err(),
            AlarmError::IndexOutOfRange { index: 3, count: 3 }
        );
    }

    #[test]
    fn test_empty_alarm() {
        assert!(matches!(
            Alarm::new(parts(Vec::new(), 0)),
            Err(AlarmError::Empty(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut mixed = frames(2, 4, 4);
        mixed.extend(frames(1, 8, 4));
        assert!(matches!(
            Alarm::new(parts(mixed, 0)),
            Err(AlarmError::DimensionMismatch { index: 2, .. })
        ));
    }
}
