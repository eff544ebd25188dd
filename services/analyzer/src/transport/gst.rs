//! GStreamer pull and push streams.
//!
//! Sources decode through `rtspsrc`/`uridecodebin` into a BGR appsink and are
//! read synchronously from the control thread. Relay sinks encode pushed
//! frames with `x264enc` and hand them to an RTMP, RTSP or file output.

use super::{FrameSink, FrameSource, SinkError, SourceError, StreamInfo, Transport};
use crate::config::{Control, SourceConfig};
use crate::frame::{Frame, PixelFormat};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

/// Frame rate assumed when the stream does not advertise one.
const DEFAULT_FPS: u32 = 25;

/// Opens GStreamer pipelines for controls.
pub struct GstTransport {
    config: SourceConfig,
}

impl GstTransport {
    pub fn new(config: SourceConfig) -> Result<Self, gst::glib::Error> {
        gst::init()?;
        Ok(Self { config })
    }
}

impl Transport for GstTransport {
    fn open_source(&self, control: &Control) -> Result<Box<dyn FrameSource>, SourceError> {
        Ok(Box::new(GstPullStream::open(control, &self.config)?))
    }

    fn open_sink(
        &self,
        control: &Control,
        url: &str,
        info: StreamInfo,
    ) -> Result<Box<dyn FrameSink>, SinkError> {
        Ok(Box::new(GstPushStream::open(&control.code, url, info)?))
    }
}

fn is_rtsp(url: &str) -> bool {
    url.starts_with("rtsp://") || url.starts_with("rtsps://")
}

/// Build the decode pipeline for a control.
pub fn pull_pipeline_description(control: &Control, config: &SourceConfig) -> String {
    let url = &control.stream_url;

    let decode = if is_rtsp(url) {
        let protocols = match config.transport.as_str() {
            "udp" => "udp",
            "udp-mcast" => "udp-mcast",
            _ => "tcp",
        };
        format!(
            "rtspsrc location=\"{}\" protocols={} latency={} ! decodebin",
            url, protocols, config.latency_ms
        )
    } else {
        format!("uridecodebin uri=\"{}\"", url)
    };

    let rate = match control.output.fps {
        Some(fps) => format!(" ! videorate ! video/x-raw,framerate={}/1", fps),
        None => String::new(),
    };

    let mut caps = format!("video/x-raw,format={}", PixelFormat::Bgr24.gst_name());
    if let Some(width) = control.output.width {
        caps.push_str(&format!(",width={}", width));
    }
    if let Some(height) = control.output.height {
        caps.push_str(&format!(",height={}", height));
    }

    format!(
        "{} ! videoconvert{} ! videoscale ! {} \
         ! appsink name=sink sync=false max-buffers=2 drop=true",
        decode, rate, caps
    )
}

/// Build the relay pipeline for a push URL.
pub fn push_pipeline_description(url: &str, info: StreamInfo) -> String {
    let encode = format!(
        "appsrc name=src is-live=true format=time \
         ! videoconvert ! x264enc tune=zerolatency speed-preset=ultrafast key-int-max={} \
         ! video/x-h264,profile=main ! h264parse",
        info.fps.max(1) * 2
    );

    let output = if url.starts_with("rtmp://") || url.starts_with("rtmps://") {
        format!("flvmux streamable=true ! rtmpsink location=\"{}\"", url)
    } else if is_rtsp(url) {
        format!("rtspclientsink location=\"{}\"", url)
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        format!("mp4mux ! filesink location=\"{}\"", path)
    };

    format!("{} ! {}", encode, output)
}

/// Copy a BGR sample into a tightly packed frame, honoring the row stride.
fn sample_to_frame(sample: &gst::Sample) -> Result<(Frame, Option<u32>), SourceError> {
    let caps = sample
        .caps()
        .ok_or_else(|| SourceError::Read("Sample without caps".to_string()))?;
    let video_info =
        gst_video::VideoInfo::from_caps(caps).map_err(|e| SourceError::Read(e.to_string()))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| SourceError::Read("Sample without buffer".to_string()))?;

    let video_frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &video_info)
        .map_err(|_| SourceError::Read("Failed to map video frame".to_string()))?;

    let width = video_info.width();
    let height = video_info.height();
    let stride = video_frame.plane_stride()[0] as usize;
    let plane = video_frame
        .plane_data(0)
        .map_err(|e| SourceError::Read(e.to_string()))?;

    let row = width as usize * 3;
    let mut data = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let line = plane
            .get(start..start + row)
            .ok_or_else(|| SourceError::Read("Video plane shorter than declared".to_string()))?;
        data.extend_from_slice(line);
    }

    let fps = video_info.fps();
    let fps = if fps.numer() > 0 && fps.denom() > 0 {
        Some(((fps.numer() as f64 / fps.denom() as f64).round() as u32).max(1))
    } else {
        None
    };

    Ok((Frame::new(PixelFormat::Bgr24, width, height, data)?, fps))
}

/// Pull stream decoding a control's source URL.
pub struct GstPullStream {
    code: String,
    pipeline: Option<gst::Pipeline>,
    appsink: gst_app::AppSink,
    info: StreamInfo,
    read_timeout: gst::ClockTime,
    sequence: u64,
    prerolled: Option<Frame>,
}

impl GstPullStream {
    /// Start the pipeline and wait for the first frame to learn the geometry.
    pub fn open(control: &Control, config: &SourceConfig) -> Result<Self, SourceError> {
        let open_error = |message: String| SourceError::Open {
            url: control.stream_url.clone(),
            message,
        };

        let description = pull_pipeline_description(control, config);
        debug!(control = %control.code, pipeline = %description, "Creating pull pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| open_error(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error("Could not cast to AppSink".to_string()))?;

        let mut stream = Self {
            code: control.code.clone(),
            pipeline: Some(pipeline.clone()),
            appsink,
            info: StreamInfo {
                width: 0,
                height: 0,
                fps: 0,
            },
            read_timeout: gst::ClockTime::from_mseconds(config.read_timeout_ms),
            sequence: 0,
            prerolled: None,
        };

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(e.to_string()))?;

        let sample = stream
            .appsink
            .try_pull_sample(gst::ClockTime::from_seconds(config.connection_timeout_secs));
        let Some(sample) = sample else {
            stream.check_bus().map_err(|e| open_error(e.to_string()))?;
            return Err(open_error("Timeout waiting for first frame".to_string()));
        };

        let (mut frame, fps) = sample_to_frame(&sample)?;
        stream.sequence = 1;
        frame.sequence = stream.sequence;
        stream.info = StreamInfo {
            width: frame.width(),
            height: frame.height(),
            fps: control.output.fps.or(fps).unwrap_or(DEFAULT_FPS),
        };
        stream.prerolled = Some(frame);

        Ok(stream)
    }

    /// Surface pipeline errors posted since the last check.
    fn check_bus(&self) -> Result<(), SourceError> {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return Ok(());
        };

        while let Some(msg) = bus.pop() {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(SourceError::Read(format!(
                        "{} ({:?})",
                        err.error(),
                        err.debug()
                    )));
                }
                gst::MessageView::Eos(_) => return Err(SourceError::EndOfStream),
                gst::MessageView::Warning(w) => {
                    warn!(control = %self.code, warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for GstPullStream {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if let Some(frame) = self.prerolled.take() {
            return Ok(frame);
        }
        if self.pipeline.is_none() {
            return Err(SourceError::EndOfStream);
        }

        match self.appsink.try_pull_sample(self.read_timeout) {
            Some(sample) => {
                let (mut frame, _) = sample_to_frame(&sample)?;
                self.sequence += 1;
                frame.sequence = self.sequence;
                Ok(frame)
            }
            None if self.appsink.is_eos() => Err(SourceError::EndOfStream),
            None => {
                self.check_bus()?;
                Err(SourceError::Timeout)
            }
        }
    }

    fn close(&mut self) {
        self.prerolled = None;
        if let Some(pipeline) = self.pipeline.take() {
            info!(control = %self.code, frames = self.sequence, "Closing pull stream");
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

impl Drop for GstPullStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Relay sink re-encoding frames to a push URL.
pub struct GstPushStream {
    code: String,
    pipeline: Option<gst::Pipeline>,
    appsrc: gst_app::AppSrc,
    info: StreamInfo,
    pushed: u64,
}

impl GstPushStream {
    pub fn open(code: &str, url: &str, info: StreamInfo) -> Result<Self, SinkError> {
        let open_error = |message: String| SinkError::Open {
            url: url.to_string(),
            message,
        };

        let description = push_pipeline_description(url, info);
        debug!(control = %code, pipeline = %description, "Creating push pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| open_error(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| open_error("appsrc not found".to_string()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| open_error("Could not cast to AppSrc".to_string()))?;

        let caps =
            gst_video::VideoInfo::builder(gst_video::VideoFormat::Bgr, info.width, info.height)
                .fps(gst::Fraction::new(info.fps.max(1) as i32, 1))
                .build()
                .and_then(|video_info| video_info.to_caps())
                .map_err(|e| open_error(e.to_string()))?;
        appsrc.set_caps(Some(&caps));

        let stream = Self {
            code: code.to_string(),
            pipeline: Some(pipeline.clone()),
            appsrc,
            info,
            pushed: 0,
        };

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(e.to_string()))?;

        info!(control = %code, url = %url, "Relay sink opened");
        Ok(stream)
    }
}

impl FrameSink for GstPushStream {
    fn push_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.pipeline.is_none() {
            return Err(SinkError::Push("Sink is closed".to_string()));
        }
        if frame.format() != PixelFormat::Bgr24
            || frame.width() != self.info.width
            || frame.height() != self.info.height
        {
            return Err(SinkError::Push(format!(
                "Frame {:?} does not match sink {}x{}",
                frame, self.info.width, self.info.height
            )));
        }

        let fps = self.info.fps.max(1) as u64;
        let mut buffer = gst::Buffer::from_slice(frame.data().to_vec());
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(
                self.pushed * 1_000_000_000 / fps,
            ));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(1_000_000_000 / fps));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| SinkError::Push(format!("{:?}", e)))?;
        self.pushed += 1;
        Ok(())
    }

    fn close(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };

        // Let file outputs write their index before tearing down
        if self.appsrc.end_of_stream().is_ok() {
            if let Some(bus) = pipeline.bus() {
                for msg in bus.iter_timed(gst::ClockTime::from_seconds(2)) {
                    match msg.view() {
                        gst::MessageView::Eos(..) | gst::MessageView::Error(..) => break,
                        _ => {}
                    }
                }
            }
        }

        let _ = pipeline.set_state(gst::State::Null);
        info!(control = %self.code, frames = self.pushed, "Relay sink closed");
    }
}

impl Drop for GstPushStream {
    fn drop(&mut self) {
        self.close();
    }
}
