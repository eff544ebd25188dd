//! Alarm clip encoding.
//!
//! An [`Alarm`] is turned into an H.264/MP4 clip and a JPEG snapshot of the
//! trigger frame, then reported through the [`Notifier`].
//!
//! The codec and container live behind [`MuxerBackend`]. [`ClipMuxer`] wraps
//! one backend as a scoped resource: it is released exactly once, either by
//! [`ClipMuxer::finalize`] or when the muxer is dropped on an error path.
//!
//! ```text
//! Alarm ─▶ snapshot (trigger frame) ─▶ BGR24→YUV420P ─▶ FrameClock ─▶ ClipMuxer
//!                                                                     │
//!                                     Notifier ◀── finalize (trailer) ◀┘
//! ```

#[cfg(feature = "gst")]
pub mod gst;

use crate::alarm::Alarm;
use crate::config::EncoderConfig;
use crate::convert::{bgr24_to_yuv420p, ConvertError};
use crate::frame::PixelFormat;
use crate::notifier::{AlarmNotice, Notifier};
use crate::snapshot::write_snapshot;
use crate::timebase::{FrameClock, FrameTiming, Rational};
use bytes::Bytes;
use chrono::TimeZone;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// H.264 SPS/PPS advertised as the stream's codec header.
pub const H264_PARAMETER_SETS: [u8; 36] = [
    0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x2a, 0x96, 0x35, 0x40, 0xf0, 0x04, 0x4f, 0xcb, 0x37,
    0x01, 0x01, 0x01, 0x40, 0x00, 0x01, 0xc2, 0x00, 0x00, 0x57, 0xe4, 0x01, 0x00, 0x00, 0x00,
    0x01, 0x68, 0xce, 0x3c, 0x80, 0x00,
];

#[derive(Debug, Error)]
pub enum EncoderError {
    /// The clip could not be set up; the alarm is abandoned.
    #[error("Failed to initialize muxer for {path}: {message}")]
    Init { path: PathBuf, message: String },

    /// One frame or packet failed; encoding continues.
    #[error("Encoding step failed: {0}")]
    Step(String),

    /// The backend can no longer produce output; the alarm is abandoned.
    #[error("Muxer is no longer usable: {0}")]
    Unusable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid alarm: {0}")]
    InvalidAlarm(String),

    #[error("Pixel conversion failed: {0}")]
    Convert(#[from] ConvertError),
}

/// Fixed encode profile for one clip.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bits per second
    pub bitrate_min: u32,
    pub bitrate: u32,
    pub bitrate_max: u32,
    pub gop_size: u32,
    pub max_b_frames: u32,
    pub codec_time_base: Rational,
    pub parameter_sets: &'static [u8],
    pub profile: String,
    pub preset: String,
    pub threads: u32,
}

impl StreamParams {
    /// Parameters for an alarm clip, with an optional per-control bitrate.
    pub fn for_alarm(alarm: &Alarm, settings: &EncoderConfig, bitrate: Option<u32>) -> Self {
        let base = bitrate.unwrap_or(settings.bitrate).max(1);

        Self {
            width: alarm.width(),
            height: alarm.height(),
            fps: alarm.fps(),
            bitrate_min: base / 2,
            bitrate: base,
            bitrate_max: base.saturating_add(base / 2),
            gop_size: alarm.fps(),
            max_b_frames: settings.max_b_frames,
            codec_time_base: Rational::per_frame(alarm.fps()),
            parameter_sets: &H264_PARAMETER_SETS,
            profile: settings.profile.clone(),
            preset: settings.preset.clone(),
            threads: 1,
        }
    }
}

/// One compressed access unit.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    /// Timestamps in the stream time base
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub keyframe: bool,
    pub stream_index: usize,
    /// Frame counter of the picture this packet encodes
    pub position: i64,
}

/// Codec plus container for a single clip.
pub trait MuxerBackend: Send {
    /// Valid once the header has been written.
    fn stream_time_base(&self) -> Rational;

    fn stream_index(&self) -> usize {
        0
    }

    fn write_header(&mut self) -> Result<(), EncoderError>;

    /// Submit one YUV420P picture.
    fn send_picture(&mut self, picture: &[u8], timing: FrameTiming) -> Result<(), EncoderError>;

    /// Next packet the codec has ready, if any. Never waits for output
    /// before [`flush`](Self::flush).
    ///
    /// A picture's packets need not be ready right after its
    /// [`send_picture`](Self::send_picture): asynchronous codecs hand them
    /// out on a later call, and whatever is still pending comes out after
    /// `flush`.
    fn receive_packet(&mut self) -> Result<Option<Packet>, EncoderError>;

    /// Signal end of input so delayed packets become available.
    fn flush(&mut self) -> Result<(), EncoderError>;

    fn write_packet(&mut self, packet: Packet) -> Result<(), EncoderError>;

    fn write_trailer(&mut self) -> Result<(), EncoderError>;

    /// Free every codec and container resource.
    fn release(&mut self);
}

/// Opens backends.
///
/// On error the factory must already have released whatever it created.
pub trait MuxerFactory: Send + Sync {
    fn open(&self, path: &Path, params: &StreamParams)
        -> Result<Box<dyn MuxerBackend>, EncoderError>;
}

/// Scoped muxer for one clip.
pub struct ClipMuxer {
    backend: Option<Box<dyn MuxerBackend>>,
    path: PathBuf,
    header_written: bool,
    packets: u64,
    in_flight: HashMap<i64, FrameTiming>,
}

impl ClipMuxer {
    pub fn open(
        factory: &dyn MuxerFactory,
        path: &Path,
        params: &StreamParams,
    ) -> Result<Self, EncoderError> {
        let backend = factory.open(path, params)?;
        debug!(
            path = %path.display(),
            width = params.width,
            height = params.height,
            fps = params.fps,
            "Muxer opened"
        );

        Ok(Self {
            backend: Some(backend),
            path: path.to_path_buf(),
            header_written: false,
            packets: 0,
            in_flight: HashMap::new(),
        })
    }

    fn backend(&mut self) -> Result<&mut Box<dyn MuxerBackend>, EncoderError> {
        self.backend
            .as_mut()
            .ok_or_else(|| EncoderError::Unusable("Muxer already released".to_string()))
    }

    pub fn write_header(&mut self) -> Result<(), EncoderError> {
        self.backend()?.write_header()?;
        self.header_written = true;
        Ok(())
    }

    pub fn stream_time_base(&self) -> Result<Rational, EncoderError> {
        self.backend
            .as_ref()
            .map(|b| b.stream_time_base())
            .ok_or_else(|| EncoderError::Unusable("Muxer already released".to_string()))
    }

    /// Submit one picture and write every packet the codec has ready.
    ///
    /// Those packets may belong to earlier pictures; each is tagged from the
    /// timing submitted with its pts. Returns the number of packets written.
    pub fn encode(&mut self, picture: &[u8], timing: FrameTiming) -> Result<usize, EncoderError> {
        if !self.header_written {
            return Err(EncoderError::Unusable("Header not written".to_string()));
        }

        self.backend()?.send_picture(picture, timing)?;
        self.in_flight.insert(timing.pts, timing);
        self.drain()
    }

    fn drain(&mut self) -> Result<usize, EncoderError> {
        let mut written = 0;

        loop {
            let backend = self.backend()?;
            let Some(mut packet) = backend.receive_packet()? else {
                break;
            };

            packet.stream_index = backend.stream_index();
            if let Some(timing) = self.in_flight.remove(&packet.pts) {
                packet.position = timing.position;
                packet.duration = timing.duration;
            }

            match self.backend()?.write_packet(packet) {
                Ok(()) => {
                    written += 1;
                    self.packets += 1;
                }
                Err(EncoderError::Step(message)) => {
                    warn!(path = %self.path.display(), error = %message, "Dropping packet");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    /// Flush the codec, write the trailer and release the backend.
    ///
    /// The backend is released even when a step fails. Returns the total
    /// number of packets written.
    pub fn finalize(mut self) -> Result<u64, EncoderError> {
        let result = self.finish_stream();
        self.release();
        result.map(|()| self.packets)
    }

    fn finish_stream(&mut self) -> Result<(), EncoderError> {
        if !self.header_written {
            return Err(EncoderError::Unusable("Header not written".to_string()));
        }

        self.backend()?.flush()?;
        self.drain()?;
        self.backend()?.write_trailer()?;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release();
            debug!(path = %self.path.display(), packets = self.packets, "Muxer released");
        }
    }
}

impl Drop for ClipMuxer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Named parts of an [`AlarmVideoEncoder`].
pub struct EncoderParts {
    pub upload_dir: PathBuf,
    pub file_name_format: String,
    pub settings: EncoderConfig,
    pub muxers: Arc<dyn MuxerFactory>,
    pub notifier: Arc<dyn Notifier>,
}

/// What an encoded alarm produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmArtifacts {
    pub video_path: PathBuf,
    /// Absent when the snapshot could not be written
    pub image_path: Option<PathBuf>,
    pub frames_encoded: usize,
    pub frames_failed: usize,
    pub packets: u64,
    pub notified: bool,
}

/// Encodes alarms into clips on disk.
pub struct AlarmVideoEncoder {
    upload_dir: PathBuf,
    file_name_format: String,
    settings: EncoderConfig,
    muxers: Arc<dyn MuxerFactory>,
    notifier: Arc<dyn Notifier>,
}

impl AlarmVideoEncoder {
    pub fn new(parts: EncoderParts) -> Self {
        Self {
            upload_dir: parts.upload_dir,
            file_name_format: parts.file_name_format,
            settings: parts.settings,
            muxers: parts.muxers,
            notifier: parts.notifier,
        }
    }

    /// Local time of the event, formatted for file names and the notice.
    fn timestamp_name(&self, happen_ms: i64) -> Result<String, EncoderError> {
        let happened = chrono::Local
            .timestamp_millis_opt(happen_ms)
            .single()
            .unwrap_or_else(chrono::Local::now);

        let mut name = String::new();
        write!(name, "{}", happened.format(&self.file_name_format)).map_err(|_| {
            EncoderError::InvalidAlarm(format!(
                "Invalid file name format: {}",
                self.file_name_format
            ))
        })?;
        Ok(name)
    }

    /// Encode an alarm, consuming its frames.
    ///
    /// `bitrate` overrides the configured baseline for this clip.
    pub fn encode(
        &self,
        alarm: Alarm,
        bitrate: Option<u32>,
    ) -> Result<AlarmArtifacts, EncoderError> {
        let started = Instant::now();
        let code = alarm.control_code().to_string();

        std::fs::create_dir_all(&self.upload_dir)?;

        let stamp = self.timestamp_name(alarm.happen_timestamp())?;
        let video_name = format!("{}-{}.mp4", code, stamp);
        let image_name = format!("{}-{}.jpg", code, stamp);
        let video_path = self.upload_dir.join(&video_name);
        let image_path = self.upload_dir.join(&image_name);

        let params = StreamParams::for_alarm(&alarm, &self.settings, bitrate);
        let mut muxer = ClipMuxer::open(self.muxers.as_ref(), &video_path, &params)
            .map_err(|e| match e {
                EncoderError::Init { .. } => e,
                other => EncoderError::Init {
                    path: video_path.clone(),
                    message: other.to_string(),
                },
            })?;
        muxer.write_header()?;

        let mut clock = FrameClock::new(params.codec_time_base, muxer.stream_time_base()?);
        let (width, height) = (alarm.width(), alarm.height());
        let happen_index = alarm.happen_index();
        let mut picture = vec![0u8; PixelFormat::Yuv420p.buffer_size(width, height)];

        let mut snapshot = None;
        let mut frames_encoded = 0usize;
        let mut frames_failed = 0usize;

        for (index, frame) in alarm.into_frames().into_iter().enumerate() {
            if index == happen_index {
                match write_snapshot(&frame, &image_path) {
                    Ok(()) => snapshot = Some(image_path.clone()),
                    Err(e) => warn!(control = %code, error = %e, "Failed to write snapshot"),
                }
            }

            match frame.format() {
                PixelFormat::Bgr24 => bgr24_to_yuv420p(frame.data(), width, height, &mut picture)?,
                PixelFormat::Yuv420p => picture.copy_from_slice(frame.data()),
            }
            drop(frame);

            let timing = clock.tick();
            match muxer.encode(&picture, timing) {
                Ok(_) => frames_encoded += 1,
                Err(EncoderError::Step(message)) => {
                    frames_failed += 1;
                    metrics::counter!("argus.encoder.step_failures", "control" => code.clone())
                        .increment(1);
                    warn!(
                        control = %code,
                        position = timing.position,
                        error = %message,
                        "Frame encode failed"
                    );
                }
                Err(e) => {
                    error!(
                        control = %code,
                        position = timing.position,
                        error = %e,
                        "Abandoning alarm clip"
                    );
                    return Err(e);
                }
            }
        }

        let packets = muxer.finalize()?;

        let notice = AlarmNotice {
            control_code: code.clone(),
            desc: stamp,
            video_path: video_name,
            image_path: image_name,
        };
        let notified = match self.notifier.notify(&notice) {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("argus.notify.failures", "control" => code.clone()).increment(1);
                warn!(control = %code, error = %e, "Alarm notification failed");
                false
            }
        };

        metrics::counter!("argus.alarms.encoded", "control" => code.clone()).increment(1);
        info!(
            control = %code,
            video = %video_path.display(),
            frames = frames_encoded,
            failed = frames_failed,
            packets = packets,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Alarm clip written"
        );

        Ok(AlarmArtifacts {
            video_path,
            image_path: snapshot,
            frames_encoded,
            frames_failed,
            packets,
            notified,
        })
    }
}
