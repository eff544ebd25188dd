//! Stream transport capabilities.
//!
//! A [`Transport`] opens one pull stream per control and, when the control has
//! a push URL, one relay sink. Both are used from the control's own thread
//! only, so implementations need `Send` but never `Sync`.

#[cfg(feature = "gst")]
pub mod gst;

use crate::config::{Control, SourceConfig};
use crate::frame::{Frame, FrameError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors raised by pull streams.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open stream {url}: {message}")]
    Open { url: String, message: String },

    #[error("Stream read failed: {0}")]
    Read(String),

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("End of stream")]
    EndOfStream,

    #[error("Gave up after {0} open attempts")]
    AttemptsExhausted(u32),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),
}

/// Errors raised by relay sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to open sink {url}: {message}")]
    Open { url: String, message: String },

    #[error("Failed to push frame: {0}")]
    Push(String),
}

/// Geometry and rate of a decoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A live stream of decoded frames.
pub trait FrameSource: Send {
    fn info(&self) -> StreamInfo;

    /// Block until the next frame is decoded.
    fn read_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the stream. Idempotent.
    fn close(&mut self);
}

/// A live relay target.
pub trait FrameSink: Send {
    fn push_frame(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flush and release the sink. Idempotent.
    fn close(&mut self);
}

/// Opens sources and sinks for controls.
pub trait Transport: Send + Sync {
    fn open_source(&self, control: &Control) -> Result<Box<dyn FrameSource>, SourceError>;

    fn open_sink(
        &self,
        control: &Control,
        url: &str,
        info: StreamInfo,
    ) -> Result<Box<dyn FrameSink>, SinkError>;
}

/// Bounds for reopening a source.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_attempts: config.max_open_attempts.max(1),
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
        }
    }
}

/// Open a control's source with exponential backoff between attempts.
pub fn open_source_with_retry(
    transport: &dyn Transport,
    control: &Control,
    policy: &RetryPolicy,
) -> Result<Box<dyn FrameSource>, SourceError> {
    let mut backoff = ExponentialBackoff {
        initial_interval: policy.base_delay,
        max_interval: policy.max_delay,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempts = 0u32;

    loop {
        match transport.open_source(control) {
            Ok(source) => {
                let info = source.info();
                info!(
                    control = %control.code,
                    url = %control.stream_url,
                    attempts = attempts + 1,
                    width = info.width,
                    height = info.height,
                    fps = info.fps,
                    "Source opened"
                );
                return Ok(source);
            }
            Err(e) => {
                attempts += 1;
                metrics::counter!("argus.source.open_failures", "control" => control.code.clone())
                    .increment(1);

                if attempts >= policy.max_attempts {
                    error!(
                        control = %control.code,
                        attempts = attempts,
                        error = %e,
                        "Maximum open attempts exceeded"
                    );
                    return Err(SourceError::AttemptsExhausted(attempts));
                }

                if let Some(delay) = backoff.next_backoff() {
                    warn!(
                        control = %control.code,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Open failed, retrying"
                    );
                    std::thread::sleep(delay);
                } else {
                    backoff.reset();
                }
            }
        }
    }
}
