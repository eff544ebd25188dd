//! Per-frame event detection.
//!
//! Detection is a capability: the control loop only sees [`Detector`]. Each
//! executor owns exactly one detector instance, created through an injected
//! [`DetectorFactory`], so backends that keep per-stream state (like the
//! motion detector's reference frame) never need synchronization. Inference
//! engines plug in by implementing the trait.

use crate::config::Control;
use crate::frame::{Frame, PixelFormat};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector {detector} does not support {format} frames")]
    UnsupportedFormat {
        detector: &'static str,
        format: PixelFormat,
    },

    #[error("Detector backend failed: {0}")]
    Backend(String),
}

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One detected object or event.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    pub score: f32,
}

/// Converts a frame into zero or more detections.
pub trait Detector: Send {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

/// Creates the detector for a control.
pub trait DetectorFactory: Send + Sync {
    fn create(&self, control: &Control) -> Result<Box<dyn Detector>, DetectorError>;
}

/// Detection backend selection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// Frame differencing over sampled luma
    Motion {
        /// Luma difference that counts a sample as changed
        #[serde(default = "default_pixel_threshold")]
        pixel_threshold: u8,

        /// Sampling stride in pixels, both axes
        #[serde(default = "default_sample_step")]
        sample_step: u32,
    },
    /// Never detects anything; relay-only controls
    Disabled,
}

fn default_pixel_threshold() -> u8 {
    25
}
fn default_sample_step() -> u32 {
    4
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig::Motion {
            pixel_threshold: default_pixel_threshold(),
            sample_step: default_sample_step(),
        }
    }
}

/// Builds detectors from each control's [`DetectorConfig`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredDetectors;

impl DetectorFactory for ConfiguredDetectors {
    fn create(&self, control: &Control) -> Result<Box<dyn Detector>, DetectorError> {
        Ok(build_detector(&control.detector))
    }
}

pub fn build_detector(config: &DetectorConfig) -> Box<dyn Detector> {
    match config {
        DetectorConfig::Motion {
            pixel_threshold,
            sample_step,
        } => Box::new(MotionDetector::new(*pixel_threshold, *sample_step)),
        DetectorConfig::Disabled => Box::new(DisabledDetector),
    }
}

/// Highest scoring detection, if any.
pub fn strongest(detections: &[Detection]) -> Option<&Detection> {
    detections
        .iter()
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

pub struct DisabledDetector;

impl Detector for DisabledDetector {
    fn name(&self) -> &str {
        "disabled"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        Ok(Vec::new())
    }
}

/// Flags frames whose sampled luma differs from the previous frame.
///
/// The score is the fraction of samples that changed by more than the pixel
/// threshold; the box encloses every changed sample.
pub struct MotionDetector {
    pixel_threshold: u8,
    step: u32,
    reference: Option<SampledLuma>,
}

struct SampledLuma {
    width: u32,
    height: u32,
    samples: Vec<u8>,
}

impl MotionDetector {
    pub fn new(pixel_threshold: u8, sample_step: u32) -> Self {
        Self {
            pixel_threshold,
            step: sample_step.max(1),
            reference: None,
        }
    }

    fn sample(&self, frame: &Frame) -> SampledLuma {
        let (w, h) = (frame.width(), frame.height());
        let data = frame.data();
        let mut samples = Vec::with_capacity(((w / self.step + 1) * (h / self.step + 1)) as usize);

        for y in (0..h).step_by(self.step as usize) {
            for x in (0..w).step_by(self.step as usize) {
                let value = match frame.format() {
                    PixelFormat::Bgr24 => {
                        let idx = ((y * w + x) * 3) as usize;
                        crate::convert::luma(data[idx + 2], data[idx + 1], data[idx])
                    }
                    PixelFormat::Yuv420p => data[(y * w + x) as usize],
                };
                samples.push(value);
            }
        }

        SampledLuma {
            width: w,
            height: h,
            samples,
        }
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let current = self.sample(frame);

        let previous = match self.reference.replace(current) {
            Some(previous)
                if previous.width == frame.width() && previous.height == frame.height() =>
            {
                previous
            }
            // First frame, or the stream changed size
            _ => return Ok(Vec::new()),
        };
        let Some(current) = self.reference.as_ref() else {
            return Ok(Vec::new());
        };

        let columns = frame.width().div_ceil(self.step);
        let mut changed = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);

        for (i, (a, b)) in previous.samples.iter().zip(&current.samples).enumerate() {
            if a.abs_diff(*b) > self.pixel_threshold {
                changed += 1;
                let x = (i as u32 % columns) * self.step;
                let y = (i as u32 / columns) * self.step;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        if changed == 0 {
            return Ok(Vec::new());
        }

        let score = changed as f32 / current.samples.len() as f32;
        let right = (max_x + self.step).min(frame.width());
        let bottom = (max_y + self.step).min(frame.height());

        Ok(vec![Detection {
            label: "motion".to_string(),
            bbox: BoundingBox {
                x: min_x as f32,
                y: min_y as f32,
                width: (right - min_x) as f32,
                height: (bottom - min_y) as f32,
            },
            score,
        }])
    }
}
