//! Per-control execution.
//!
//! A [`ControlExecutor`] owns one control's source, optional relay sink,
//! detector and alarm window, and runs them on a dedicated thread:
//!
//! ```text
//! read ─▶ detect ─▶ relay ─▶ window ─▶ encode (inline or worker thread)
//! ```
//!
//! Nothing here is shared with other controls. Shutdown is cooperative: the
//! loop checks a flag once per frame, so an encode already in progress always
//! runs to completion.

use crate::alarm::Alarm;
use crate::config::{AnalyzerConfig, Control, EncodeMode};
use crate::detector::{strongest, Detector, DetectorFactory};
use crate::encoder::AlarmVideoEncoder;
use crate::error::AnalyzerError;
use crate::transport::{open_source_with_retry, FrameSink, FrameSource, RetryPolicy, Transport};
use crate::window::{AlarmWindow, WindowParams};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a control executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ExecutorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutorState::Created,
            1 => ExecutorState::Starting,
            2 => ExecutorState::Running,
            3 => ExecutorState::Stopping,
            _ => ExecutorState::Stopped,
        }
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorState::Created => "created",
            ExecutorState::Starting => "starting",
            ExecutorState::Running => "running",
            ExecutorState::Stopping => "stopping",
            ExecutorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Collaborators and tuning shared by every executor of a scheduler.
#[derive(Clone)]
pub struct ExecutorContext {
    pub transport: Arc<dyn Transport>,
    pub detectors: Arc<dyn DetectorFactory>,
    pub encoder: Arc<AlarmVideoEncoder>,
    pub retry: RetryPolicy,
    pub max_read_retries: u32,
    pub read_retry_delay: Duration,
    pub pre_alarm_secs: u32,
    pub post_alarm_secs: u32,
    pub encode_mode: EncodeMode,
}

impl ExecutorContext {
    pub fn from_config(
        config: &AnalyzerConfig,
        transport: Arc<dyn Transport>,
        detectors: Arc<dyn DetectorFactory>,
        encoder: Arc<AlarmVideoEncoder>,
    ) -> Self {
        Self {
            transport,
            detectors,
            encoder,
            retry: RetryPolicy::from_config(&config.source),
            max_read_retries: config.source.max_read_retries,
            read_retry_delay: config.source.read_retry_delay(),
            pre_alarm_secs: config.alarm.pre_alarm_secs,
            post_alarm_secs: config.alarm.post_alarm_secs,
            encode_mode: config.alarm.encode_mode,
        }
    }
}

/// Named parts of a [`ControlExecutor`].
pub struct ExecutorParams {
    pub control: Control,
    pub context: ExecutorContext,
}

/// Counters for one control.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub frames_read: u64,
    pub read_failures: u64,
    pub detections: u64,
    pub triggers: u64,
    pub coalesced_triggers: u64,
    pub alarms_dispatched: u64,
    pub alarms_encoded: u64,
    pub encode_failures: u64,
    pub relay_failures: u64,
}

#[derive(Default)]
struct StatsCounters {
    frames_read: AtomicU64,
    read_failures: AtomicU64,
    detections: AtomicU64,
    triggers: AtomicU64,
    coalesced_triggers: AtomicU64,
    alarms_dispatched: AtomicU64,
    alarms_encoded: AtomicU64,
    encode_failures: AtomicU64,
    relay_failures: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            coalesced_triggers: self.coalesced_triggers.load(Ordering::Relaxed),
            alarms_dispatched: self.alarms_dispatched.load(Ordering::Relaxed),
            alarms_encoded: self.alarms_encoded.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
        }
    }
}

/// State visible to both the owner and the control threads.
struct Shared {
    code: String,
    state: AtomicU8,
    running: AtomicBool,
    stats: StatsCounters,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ExecutorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from` to `to` only if no one else changed the state first.
    fn transition(&self, from: ExecutorState, to: ExecutorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Encode one alarm. A failure or panic aborts only this clip.
    fn encode(&self, encoder: &AlarmVideoEncoder, alarm: Alarm, bitrate: Option<u32>) {
        match panic::catch_unwind(AssertUnwindSafe(|| encoder.encode(alarm, bitrate))) {
            Ok(Ok(artifacts)) => {
                self.stats.alarms_encoded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    control = %self.code,
                    video = %artifacts.video_path.display(),
                    "Alarm encoded"
                );
            }
            Ok(Err(e)) => {
                self.record_encode_failure();
                error!(control = %self.code, error = %e, "Alarm encoding failed");
            }
            Err(payload) => {
                self.record_encode_failure();
                error!(
                    control = %self.code,
                    panic = %panic_message(payload.as_ref()),
                    "Alarm encoding panicked"
                );
            }
        }
    }

    fn record_encode_failure(&self) {
        self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("argus.encoder.failures", "control" => self.code.clone()).increment(1);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Clears the worker's busy flag however the encode ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Where completed alarms go.
enum Dispatch {
    Inline {
        encoder: Arc<AlarmVideoEncoder>,
    },
    Worker {
        sender: Option<Sender<Alarm>>,
        busy: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    },
}

impl Dispatch {
    fn is_busy(&self) -> bool {
        match self {
            Dispatch::Inline { .. } => false,
            Dispatch::Worker { busy, .. } => busy.load(Ordering::SeqCst),
        }
    }

    fn send(&mut self, shared: &Shared, alarm: Alarm, bitrate: Option<u32>) {
        shared.stats.alarms_dispatched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("argus.alarms.dispatched", "control" => shared.code.clone()).increment(1);

        match self {
            Dispatch::Inline { encoder } => shared.encode(encoder, alarm, bitrate),
            Dispatch::Worker { sender, busy, .. } => {
                let Some(sender) = sender.as_ref() else {
                    warn!(control = %shared.code, "Encode worker gone, dropping alarm");
                    return;
                };
                busy.store(true, Ordering::SeqCst);
                if sender.send(alarm).is_err() {
                    busy.store(false, Ordering::SeqCst);
                    error!(control = %shared.code, "Encode worker exited, dropping alarm");
                }
            }
        }
    }

    /// Close the worker channel and wait for queued alarms to be encoded.
    fn shutdown(&mut self, code: &str) {
        if let Dispatch::Worker { sender, handle, .. } = self {
            sender.take();
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    error!(control = %code, "Encode worker panicked");
                }
            }
        }
    }
}

fn spawn_worker(
    shared: Arc<Shared>,
    encoder: Arc<AlarmVideoEncoder>,
    bitrate: Option<u32>,
) -> Result<Dispatch, std::io::Error> {
    let (sender, receiver) = bounded::<Alarm>(1);
    let busy = Arc::new(AtomicBool::new(false));
    let worker_busy = busy.clone();

    let handle = std::thread::Builder::new()
        .name(format!("enc-{}", shared.code))
        .spawn(move || {
            for alarm in receiver.iter() {
                let _idle = BusyGuard(&worker_busy);
                shared.encode(&encoder, alarm, bitrate);
            }
            debug!(control = %shared.code, "Encode worker finished");
        })?;

    Ok(Dispatch::Worker {
        sender: Some(sender),
        busy,
        handle: Some(handle),
    })
}

/// Everything the control thread owns.
struct ControlLoop {
    shared: Arc<Shared>,
    source: Box<dyn FrameSource>,
    sink: Option<Box<dyn FrameSink>>,
    detector: Box<dyn Detector>,
    window: AlarmWindow,
    dispatch: Dispatch,
    min_score: f32,
    bitrate: Option<u32>,
    max_read_retries: u32,
    read_retry_delay: Duration,
}

impl ControlLoop {
    fn run(mut self) {
        let code = self.shared.code.clone();
        let stats = &self.shared.stats;
        let mut consecutive_failures = 0u32;

        info!(control = %code, detector = %self.detector.name(), "Control loop started");

        while self.shared.running.load(Ordering::SeqCst) {
            let mut frame = match self.source.read_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    frame
                }
                Err(e) => {
                    consecutive_failures += 1;
                    stats.read_failures.fetch_add(1, Ordering::Relaxed);

                    if consecutive_failures > self.max_read_retries {
                        error!(
                            control = %code,
                            failures = consecutive_failures,
                            error = %e,
                            "Read retries exhausted, stopping control"
                        );
                        metrics::counter!("argus.source.failures", "control" => code.clone())
                            .increment(1);
                        *self.shared.failure.lock() = Some(e.to_string());
                        break;
                    }

                    debug!(
                        control = %code,
                        attempt = consecutive_failures,
                        error = %e,
                        "Read failed"
                    );
                    std::thread::sleep(self.read_retry_delay);
                    continue;
                }
            };

            stats.frames_read.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("argus.frames.read", "control" => code.clone()).increment(1);

            match self.detector.detect(&frame) {
                Ok(detections) => {
                    stats
                        .detections
                        .fetch_add(detections.len() as u64, Ordering::Relaxed);
                    if let Some(best) = strongest(&detections) {
                        if best.score >= self.min_score {
                            frame.mark_happen(best.score);
                            stats.triggers.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        control = %code,
                        sequence = frame.sequence,
                        error = %e,
                        "Detection failed"
                    );
                }
            }

            if let Some(sink) = self.sink.as_mut() {
                if let Err(e) = sink.push_frame(&frame) {
                    stats.relay_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(control = %code, error = %e, "Relay failed");
                }
            }

            let busy = self.dispatch.is_busy();
            let suppressed = frame.happen && (busy || self.window.is_accumulating());
            if suppressed {
                stats.coalesced_triggers.fetch_add(1, Ordering::Relaxed);
            }

            if let Some(alarm) = self.window.push(frame, !busy) {
                self.dispatch.send(&self.shared, alarm, self.bitrate);
            }
        }

        self.teardown();
    }

    fn teardown(mut self) {
        let code = self.shared.code.clone();
        self.shared
            .transition(ExecutorState::Running, ExecutorState::Stopping);
        self.shared.running.store(false, Ordering::SeqCst);

        self.source.close();
        if let Some(sink) = self.sink.as_mut() {
            sink.close();
        }

        if let Some(alarm) = self.window.flush() {
            info!(control = %code, frames = alarm.len(), "Encoding partial alarm on shutdown");
            self.dispatch.send(&self.shared, alarm, self.bitrate);
        }
        self.window.clear();
        self.dispatch.shutdown(&code);

        self.shared.set_state(ExecutorState::Stopped);
        info!(
            control = %code,
            frames = self.shared.stats.frames_read.load(Ordering::Relaxed),
            "Control stopped"
        );
    }
}

/// Runs one control on its own thread(s).
pub struct ControlExecutor {
    control: Control,
    context: ExecutorContext,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ControlExecutor {
    pub fn new(params: ExecutorParams) -> Self {
        let shared = Arc::new(Shared {
            code: params.control.code.clone(),
            state: AtomicU8::new(ExecutorState::Created as u8),
            running: AtomicBool::new(false),
            stats: StatsCounters::default(),
            failure: Mutex::new(None),
        });

        Self {
            control: params.control,
            context: params.context,
            shared,
            thread: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.control.code
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn state(&self) -> ExecutorState {
        self.shared.state()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.shared.stats.snapshot()
    }

    /// Why the control stopped on its own, if it did.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// Open the source and spawn the control thread.
    ///
    /// Blocks for the source's open retries. On error the executor is left
    /// `Stopped` and nothing keeps running.
    pub fn start(&mut self) -> Result<(), AnalyzerError> {
        let code = self.control.code.clone();
        if !self
            .shared
            .transition(ExecutorState::Created, ExecutorState::Starting)
        {
            return Err(AnalyzerError::AlreadyStarted(code));
        }

        let result = self.launch();
        if result.is_err() {
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.set_state(ExecutorState::Stopped);
        }
        result
    }

    fn launch(&mut self) -> Result<(), AnalyzerError> {
        let code = self.control.code.clone();
        let context = &self.context;

        let detector = context
            .detectors
            .create(&self.control)
            .map_err(|e| AnalyzerError::Detector {
                code: code.clone(),
                message: e.to_string(),
            })?;

        let source =
            open_source_with_retry(context.transport.as_ref(), &self.control, &context.retry)
                .map_err(|source| AnalyzerError::SourceUnavailable {
                    code: code.clone(),
                    source,
                })?;
        let info = source.info();

        let sink = self.control.push_url.as_deref().and_then(|url| {
            match context.transport.open_sink(&self.control, url, info) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!(control = %code, error = %e, "Relay sink unavailable, relay disabled");
                    None
                }
            }
        });

        let window = AlarmWindow::new(WindowParams {
            control_code: code.clone(),
            width: info.width,
            height: info.height,
            fps: info.fps.max(1),
            pre_alarm_secs: context.pre_alarm_secs,
            post_alarm_secs: context.post_alarm_secs,
        });

        let spawn_error = |source| AnalyzerError::Spawn {
            code: code.clone(),
            source,
        };

        let bitrate = self.control.output.bitrate;
        let dispatch = match context.encode_mode {
            EncodeMode::Inline => Dispatch::Inline {
                encoder: context.encoder.clone(),
            },
            EncodeMode::Worker => {
                spawn_worker(self.shared.clone(), context.encoder.clone(), bitrate)
                    .map_err(spawn_error)?
            }
        };

        let control_loop = ControlLoop {
            shared: self.shared.clone(),
            source,
            sink,
            detector,
            window,
            dispatch,
            min_score: self.control.min_score,
            bitrate,
            max_read_retries: context.max_read_retries,
            read_retry_delay: context.read_retry_delay,
        };

        // Running must be visible before the loop can observe or change it
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(ExecutorState::Running);

        let handle = std::thread::Builder::new()
            .name(format!("ctl-{}", code))
            .spawn(move || control_loop.run())
            .map_err(spawn_error)?;
        self.thread = Some(handle);

        info!(control = %code, url = %self.control.stream_url, "Control started");
        Ok(())
    }

    /// Ask the control thread to stop after its current frame. Idempotent.
    pub fn request_stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared
                .transition(ExecutorState::Running, ExecutorState::Stopping);
            debug!(control = %self.control.code, "Stop requested");
        }
        self.shared
            .transition(ExecutorState::Created, ExecutorState::Stopped);
    }

    /// Wait for the control thread and any encode worker to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(control = %self.control.code, "Control thread panicked");
                *self.shared.failure.lock() = Some("control thread panicked".to_string());
                self.shared.set_state(ExecutorState::Stopped);
            }
        }
    }

    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl Drop for ControlExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}
