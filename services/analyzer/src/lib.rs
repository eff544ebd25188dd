//! Argus Analyzer
//!
//! Real-time video analytics for many concurrently monitored camera streams.
//! Each stream ("control") is decoded on its own thread and run through a
//! detector. A positive detection captures a bounded evidence clip spanning
//! the seconds before and after the event. The clip is encoded into an
//! H.264/MP4 file with a JPEG snapshot, and the alarm is reported to an
//! admin service over HTTP.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────── ControlExecutor (per control) ─┐
//!  Scheduler ────▶ │ FrameSource ─▶ Detector ─▶ FrameSink (relay, optional) │
//!  (code → exec)   │                   │                                    │
//!                  │                   ▼                                    │
//!                  │              AlarmWindow ─▶ AlarmVideoEncoder          │
//!                  └──────────────────────────────────┬─────────────────────┘
//!                                                     │
//!                        upload_dir/<code>-<time>.mp4 │ .jpg ─▶ Notifier
//! ```
//!
//! Transport, detection, muxing and notification are traits so backends can
//! be swapped. The GStreamer implementations live behind the `gst` feature.
//!
//! # Example
//!
//! ```rust,no_run
//! use argus_analyzer::prelude::*;
//! use std::sync::Arc;
//!
//! fn run(config: AnalyzerConfig, transport: Arc<dyn Transport>, muxers: Arc<dyn MuxerFactory>) {
//!     let encoder = AlarmVideoEncoder::new(EncoderParts {
//!         upload_dir: config.alarm.upload_dir.clone(),
//!         file_name_format: config.alarm.file_name_format.clone(),
//!         settings: config.encoder.clone(),
//!         muxers,
//!         notifier: Arc::new(LogNotifier),
//!     });
//!     let context = ExecutorContext::from_config(
//!         &config,
//!         transport,
//!         Arc::new(ConfiguredDetectors),
//!         Arc::new(encoder),
//!     );
//!
//!     let scheduler = Scheduler::new(context);
//!     for control in config.controls.clone() {
//!         if let Err(e) = scheduler.add(control) {
//!             eprintln!("{}", e);
//!         }
//!     }
//!     scheduler.shutdown();
//! }
//! ```

pub mod alarm;
pub mod config;
pub mod convert;
pub mod detector;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod frame;
pub mod logging;
pub mod notifier;
pub mod scheduler;
pub mod snapshot;
pub mod timebase;
pub mod transport;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use alarm::{Alarm, AlarmError, AlarmParts};
pub use config::{AnalyzerConfig, ConfigValidationError, Control, EncodeMode};
pub use detector::{
    ConfiguredDetectors, Detection, Detector, DetectorConfig, DetectorError, DetectorFactory,
};
pub use encoder::{
    AlarmArtifacts, AlarmVideoEncoder, ClipMuxer, EncoderError, EncoderParts, MuxerBackend,
    MuxerFactory, StreamParams,
};
pub use error::AnalyzerError;
pub use executor::{ControlExecutor, ExecutorContext, ExecutorParams, ExecutorState, ExecutorStats};
pub use frame::{Frame, FrameError, PixelFormat};
pub use notifier::{AlarmNotice, HttpNotifier, LogNotifier, Notifier, NotifyError};
pub use scheduler::{ControlStatus, Scheduler};
pub use transport::{FrameSink, FrameSource, SourceError, StreamInfo, Transport};
pub use window::{AlarmWindow, WindowParams};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{AnalyzerConfig, Control};
    pub use crate::detector::ConfiguredDetectors;
    pub use crate::encoder::{AlarmVideoEncoder, EncoderParts, MuxerFactory};
    pub use crate::error::AnalyzerError;
    pub use crate::executor::{ExecutorContext, ExecutorState};
    pub use crate::notifier::{HttpNotifier, LogNotifier, Notifier};
    pub use crate::scheduler::Scheduler;
    pub use crate::transport::Transport;
}
