//! Fakes for the transport, detector, muxer and notifier seams.

use crate::config::{Control, EncodeMode};
use crate::detector::{BoundingBox, Detection, Detector, DetectorError, DetectorFactory};
use crate::encoder::{
    AlarmVideoEncoder, EncoderError, EncoderParts, MuxerBackend, MuxerFactory, Packet,
    StreamParams,
};
use crate::executor::ExecutorContext;
use crate::frame::{Frame, PixelFormat};
use crate::notifier::{AlarmNotice, Notifier, NotifyError};
use crate::timebase::{FrameTiming, Rational};
use crate::transport::{
    FrameSink, FrameSource, RetryPolicy, SinkError, SourceError, StreamInfo, Transport,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Fresh, empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "argus-{}-{}-{}",
        name,
        std::process::id(),
        SCRATCH.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Behaviour of a scripted source.
#[derive(Debug, Clone)]
pub struct SourceScript {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Opens that fail before one succeeds
    pub failing_opens: u32,
    pub open_delay: Duration,
    /// Every read after this many frames fails
    pub fail_after: Option<u64>,
    pub frame_delay: Duration,
    pub fail_sink: bool,
}

impl Default for SourceScript {
    fn default() -> Self {
        Self {
            width: 8,
            height: 8,
            fps: 4,
            failing_opens: 0,
            open_delay: Duration::ZERO,
            fail_after: None,
            frame_delay: Duration::from_millis(1),
            fail_sink: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransportLedger {
    pub opens: AtomicU32,
    pub sources_closed: AtomicU32,
    pub sinks_opened: AtomicU32,
    pub sinks_closed: AtomicU32,
    pub sink_frames: AtomicU64,
}

/// Transport whose sources produce numbered solid frames.
pub struct ScriptedTransport {
    script: SourceScript,
    overrides: HashMap<String, SourceScript>,
    pub ledger: Arc<TransportLedger>,
}

impl ScriptedTransport {
    pub fn new(script: SourceScript) -> Self {
        Self {
            script,
            overrides: HashMap::new(),
            ledger: Arc::new(TransportLedger::default()),
        }
    }

    /// Use a different script for one control.
    pub fn with_control(mut self, code: &str, script: SourceScript) -> Self {
        self.overrides.insert(code.to_string(), script);
        self
    }

    fn script_for(&self, control: &Control) -> &SourceScript {
        self.overrides.get(&control.code).unwrap_or(&self.script)
    }
}

impl Transport for ScriptedTransport {
    fn open_source(&self, control: &Control) -> Result<Box<dyn FrameSource>, SourceError> {
        let script = self.script_for(control).clone();
        let attempt = self.ledger.opens.fetch_add(1, Ordering::SeqCst) + 1;
        std::thread::sleep(script.open_delay);
        if attempt <= script.failing_opens {
            return Err(SourceError::Open {
                url: control.stream_url.clone(),
                message: format!("scripted failure {}", attempt),
            });
        }

        Ok(Box::new(ScriptedSource {
            script,
            sequence: 0,
            closed: false,
            ledger: self.ledger.clone(),
        }))
    }

    fn open_sink(
        &self,
        control: &Control,
        url: &str,
        _info: StreamInfo,
    ) -> Result<Box<dyn FrameSink>, SinkError> {
        if self.script_for(control).fail_sink {
            return Err(SinkError::Open {
                url: url.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        self.ledger.sinks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSink {
            closed: false,
            ledger: self.ledger.clone(),
        }))
    }
}

struct ScriptedSource {
    script: SourceScript,
    sequence: u64,
    closed: bool,
    ledger: Arc<TransportLedger>,
}

impl FrameSource for ScriptedSource {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.script.width,
            height: self.script.height,
            fps: self.script.fps,
        }
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if self.closed {
            return Err(SourceError::EndOfStream);
        }
        std::thread::sleep(self.script.frame_delay);

        if matches!(self.script.fail_after, Some(limit) if self.sequence >= limit) {
            return Err(SourceError::Read("scripted read failure".to_string()));
        }

        self.sequence += 1;
        let (w, h) = (self.script.width, self.script.height);
        let mut frame = Frame::new(
            PixelFormat::Bgr24,
            w,
            h,
            vec![(self.sequence % 256) as u8; PixelFormat::Bgr24.buffer_size(w, h)],
        )?;
        frame.sequence = self.sequence;
        Ok(frame)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.ledger.sources_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ScriptedSink {
    closed: bool,
    ledger: Arc<TransportLedger>,
}

impl FrameSink for ScriptedSink {
    fn push_frame(&mut self, _frame: &Frame) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Push("closed".to_string()));
        }
        self.ledger.sink_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.ledger.sinks_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Fires on fixed frame sequence numbers.
pub struct TriggerOnSequence {
    sequences: Vec<u64>,
    score: f32,
}

impl Detector for TriggerOnSequence {
    fn name(&self) -> &str {
        "trigger-on-sequence"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        if !self.sequences.contains(&frame.sequence) {
            return Ok(Vec::new());
        }
        Ok(vec![Detection {
            label: "event".to_string(),
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: frame.width() as f32,
                height: frame.height() as f32,
            },
            score: self.score,
        }])
    }
}

/// Hands every control a [`TriggerOnSequence`] detector.
pub struct TriggerFactory {
    sequences: Vec<u64>,
    score: f32,
    pub created: AtomicU32,
}

impl TriggerFactory {
    pub fn new(sequences: Vec<u64>) -> Self {
        Self::with_score(sequences, 0.9)
    }

    pub fn with_score(sequences: Vec<u64>, score: f32) -> Self {
        Self {
            sequences,
            score,
            created: AtomicU32::new(0),
        }
    }
}

impl DetectorFactory for TriggerFactory {
    fn create(&self, _control: &Control) -> Result<Box<dyn Detector>, DetectorError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TriggerOnSequence {
            sequences: self.sequences.clone(),
            score: self.score,
        }))
    }
}

/// Behaviour of a recording muxer.
#[derive(Debug, Clone)]
pub struct MuxerScript {
    pub fail_open: bool,
    /// Opens that panic before one succeeds
    pub panicking_opens: u32,
    /// Zero-based picture index that fails as a recoverable step
    pub step_fail_at: Option<u64>,
    /// Zero-based picture index that breaks the muxer
    pub unusable_at: Option<u64>,
    pub packets_per_picture: usize,
    /// Pictures a packet lags behind its submission until flushed
    pub output_delay: usize,
    pub picture_delay: Duration,
}

impl Default for MuxerScript {
    fn default() -> Self {
        Self {
            fail_open: false,
            panicking_opens: 0,
            step_fail_at: None,
            unusable_at: None,
            packets_per_picture: 1,
            output_delay: 0,
            picture_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub struct MuxerLedger {
    pub open_attempts: AtomicU32,
    pub opened: AtomicU32,
    pub released: AtomicU32,
    pub headers: AtomicU32,
    pub trailers: AtomicU32,
    pub pictures: AtomicU64,
    pub packets: AtomicU64,
    timings: Mutex<Vec<FrameTiming>>,
    written: Mutex<Vec<Packet>>,
}

impl MuxerLedger {
    /// Timing of every accepted picture, in submission order.
    pub fn timings(&self) -> Vec<FrameTiming> {
        self.timings.lock().clone()
    }

    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().clone()
    }
}

/// Muxer factory that records every backend call.
pub struct RecordingMuxerFactory {
    script: MuxerScript,
    pub ledger: Arc<MuxerLedger>,
}

impl RecordingMuxerFactory {
    pub fn new(script: MuxerScript) -> Self {
        Self {
            script,
            ledger: Arc::new(MuxerLedger::default()),
        }
    }
}

impl MuxerFactory for RecordingMuxerFactory {
    fn open(
        &self,
        path: &Path,
        _params: &StreamParams,
    ) -> Result<Box<dyn MuxerBackend>, EncoderError> {
        let attempt = self.ledger.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.script.panicking_opens {
            panic!("scripted muxer panic {}", attempt);
        }
        if self.script.fail_open {
            return Err(EncoderError::Init {
                path: path.to_path_buf(),
                message: "scripted failure".to_string(),
            });
        }
        self.ledger.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(RecordingMuxer {
            script: self.script.clone(),
            ledger: self.ledger.clone(),
            submitted: 0,
            flushed: false,
            queue: VecDeque::new(),
        }))
    }
}

struct RecordingMuxer {
    script: MuxerScript,
    ledger: Arc<MuxerLedger>,
    submitted: u64,
    flushed: bool,
    queue: VecDeque<Packet>,
}

impl MuxerBackend for RecordingMuxer {
    fn stream_time_base(&self) -> Rational {
        Rational::new(1, 90_000)
    }

    fn write_header(&mut self) -> Result<(), EncoderError> {
        self.ledger.headers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_picture(&mut self, _picture: &[u8], timing: FrameTiming) -> Result<(), EncoderError> {
        let index = self.submitted;
        self.submitted += 1;
        std::thread::sleep(self.script.picture_delay);

        if self.script.unusable_at == Some(index) {
            return Err(EncoderError::Unusable("scripted failure".to_string()));
        }
        if self.script.step_fail_at == Some(index) {
            return Err(EncoderError::Step("scripted failure".to_string()));
        }

        self.ledger.pictures.fetch_add(1, Ordering::SeqCst);
        self.ledger.timings.lock().push(timing);
        for k in 0..self.script.packets_per_picture {
            self.queue.push_back(Packet {
                data: Bytes::from(vec![k as u8; 4]),
                pts: timing.pts,
                dts: timing.pts,
                duration: 0,
                keyframe: k == 0,
                stream_index: 99,
                position: -1,
            });
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>, EncoderError> {
        let held = self.script.output_delay * self.script.packets_per_picture;
        if self.flushed || self.queue.len() > held {
            return Ok(self.queue.pop_front());
        }
        Ok(None)
    }

    fn flush(&mut self) -> Result<(), EncoderError> {
        self.flushed = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet) -> Result<(), EncoderError> {
        self.ledger.packets.fetch_add(1, Ordering::SeqCst);
        self.ledger.written.lock().push(packet);
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), EncoderError> {
        self.ledger.trailers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Notifier that keeps every notice.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<AlarmNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<AlarmNotice> {
        self.notices.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &AlarmNotice) -> Result<(), NotifyError> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

/// Everything an executor test needs, with handles to the fakes.
pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub detectors: Arc<TriggerFactory>,
    pub muxers: Arc<RecordingMuxerFactory>,
    pub notifier: Arc<RecordingNotifier>,
    pub upload_dir: PathBuf,
}

impl Harness {
    pub fn new(transport: ScriptedTransport, triggers: Vec<u64>, muxer: MuxerScript) -> Self {
        Self {
            transport: Arc::new(transport),
            detectors: Arc::new(TriggerFactory::new(triggers)),
            muxers: Arc::new(RecordingMuxerFactory::new(muxer)),
            notifier: Arc::new(RecordingNotifier::default()),
            upload_dir: scratch_dir("harness"),
        }
    }

    /// Context with one open attempt, a two-read retry budget and one second
    /// windows on both sides of a trigger.
    pub fn context(&self, mode: EncodeMode) -> ExecutorContext {
        let encoder = AlarmVideoEncoder::new(EncoderParts {
            upload_dir: self.upload_dir.clone(),
            file_name_format: "%Y%m%d%H%M%S%6f".to_string(),
            settings: Default::default(),
            muxers: self.muxers.clone(),
            notifier: self.notifier.clone(),
        });

        ExecutorContext {
            transport: self.transport.clone(),
            detectors: self.detectors.clone(),
            encoder: Arc::new(encoder),
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            max_read_retries: 2,
            read_retry_delay: Duration::from_millis(1),
            pre_alarm_secs: 1,
            post_alarm_secs: 1,
            encode_mode: mode,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.upload_dir);
    }
}
