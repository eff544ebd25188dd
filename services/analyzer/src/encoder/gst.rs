//! GStreamer H.264/MP4 backend.
//!
//! Two pipelines per clip: pictures are compressed by
//! `appsrc ! x264enc ! h264parse ! appsink` and the resulting access units are
//! written by `appsrc ! h264parse ! mp4mux ! filesink`. Keeping them apart
//! gives the muxer explicit control over each packet, the same submit/drain
//! cycle a codec library exposes.

use super::{EncoderError, MuxerBackend, MuxerFactory, Packet, StreamParams};
use crate::timebase::{FrameTiming, Rational};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How long a flushing drain waits for the encoder's delayed output.
const DRAIN_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(5);

/// How long the trailer waits for the muxer to finish the file.
const TRAILER_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(5);

/// Opens [`GstMuxer`] backends.
pub struct GstMuxerFactory;

impl GstMuxerFactory {
    pub fn new() -> Result<Self, gst::glib::Error> {
        gst::init()?;
        Ok(Self)
    }
}

/// x264 encode pipeline for a clip.
pub fn encode_pipeline_description(params: &StreamParams) -> String {
    let kbps = |bps: u32| (bps / 1000).max(1);

    format!(
        "appsrc name=src format=time \
         ! x264enc bitrate={} key-int-max={} bframes={} speed-preset={} threads={} \
           option-string=\"vbv-maxrate={}:vbv-bufsize={}\" \
         ! video/x-h264,profile={},stream-format=byte-stream,alignment=au \
         ! h264parse ! appsink name=sink sync=false",
        kbps(params.bitrate),
        params.gop_size.max(1),
        params.max_b_frames,
        params.preset,
        params.threads.max(1),
        kbps(params.bitrate_max),
        kbps(params.bitrate_max),
        params.profile,
    )
}

/// MP4 mux pipeline writing to `path`.
pub fn mux_pipeline_description(path: &Path) -> String {
    format!(
        "appsrc name=src format=time ! h264parse ! mp4mux ! filesink location=\"{}\"",
        path.display()
    )
}

/// Owns a pipeline and stops it when dropped.
struct PipelineGuard(gst::Pipeline);

impl PipelineGuard {
    fn launch(description: &str) -> Result<Self, String> {
        let pipeline = gst::parse::launch(description)
            .map_err(|e| e.to_string())?
            .downcast::<gst::Pipeline>()
            .map_err(|_| "Failed to cast to Pipeline".to_string())?;
        Ok(Self(pipeline))
    }

    fn appsrc(&self) -> Result<gst_app::AppSrc, String> {
        self.0
            .by_name("src")
            .ok_or_else(|| "appsrc not found".to_string())?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| "Could not cast to AppSrc".to_string())
    }

    fn appsink(&self) -> Result<gst_app::AppSink, String> {
        self.0
            .by_name("sink")
            .ok_or_else(|| "appsink not found".to_string())?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| "Could not cast to AppSink".to_string())
    }

    fn play(&self) -> Result<(), String> {
        self.0
            .set_state(gst::State::Playing)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// First error posted on the bus since the last check.
    fn poll_error(&self) -> Option<String> {
        let bus = self.0.bus()?;
        while let Some(msg) = bus.pop() {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Some(format!("{} ({:?})", err.error(), err.debug()));
                }
                gst::MessageView::Warning(w) => {
                    warn!(warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
        None
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        let _ = self.0.set_state(gst::State::Null);
    }
}

fn clock_time(ticks: i64) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(ticks.max(0) as u64)
}

impl MuxerFactory for GstMuxerFactory {
    fn open(
        &self,
        path: &Path,
        params: &StreamParams,
    ) -> Result<Box<dyn MuxerBackend>, EncoderError> {
        let init = |message: String| EncoderError::Init {
            path: path.to_path_buf(),
            message,
        };

        // Guards stop whatever was built if a later step fails
        let encode = PipelineGuard::launch(&encode_pipeline_description(params)).map_err(init)?;
        let mux = PipelineGuard::launch(&mux_pipeline_description(path)).map_err(init)?;

        let encode_src = encode.appsrc().map_err(init)?;
        let encode_sink = encode.appsink().map_err(init)?;
        let mux_src = mux.appsrc().map_err(init)?;

        let raw_caps = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::I420,
            params.width,
            params.height,
        )
        .fps(gst::Fraction::new(params.fps as i32, 1))
        .build()
        .and_then(|info| info.to_caps())
        .map_err(|e| init(e.to_string()))?;
        encode_src.set_caps(Some(&raw_caps));

        let header = gst::Buffer::from_slice(params.parameter_sets);
        let h264_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .field("profile", params.profile.as_str())
            .field("width", params.width as i32)
            .field("height", params.height as i32)
            .field("framerate", gst::Fraction::new(params.fps as i32, 1))
            .field("streamheader", gst::Array::from_values([header.to_send_value()]))
            .build();
        mux_src.set_caps(Some(&h264_caps));

        debug!(path = %path.display(), "GStreamer muxer pipelines created");

        Ok(Box::new(GstMuxer {
            path: path.to_path_buf(),
            encode: Some(encode),
            mux: Some(mux),
            encode_src,
            encode_sink,
            mux_src,
            flushing: false,
        }))
    }
}

/// One clip's encode and mux pipelines.
pub struct GstMuxer {
    path: PathBuf,
    encode: Option<PipelineGuard>,
    mux: Option<PipelineGuard>,
    encode_src: gst_app::AppSrc,
    encode_sink: gst_app::AppSink,
    mux_src: gst_app::AppSrc,
    flushing: bool,
}

impl GstMuxer {
    fn check_pipelines(&self) -> Result<(), EncoderError> {
        for guard in [&self.encode, &self.mux].into_iter().flatten() {
            if let Some(message) = guard.poll_error() {
                return Err(EncoderError::Unusable(message));
            }
        }
        Ok(())
    }

    fn sample_to_packet(sample: &gst::Sample) -> Result<Packet, EncoderError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| EncoderError::Step("Sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| EncoderError::Step("Failed to map encoded buffer".to_string()))?;

        let pts = buffer.pts().map(|t| t.nseconds() as i64).unwrap_or(0);
        Ok(Packet {
            data: Bytes::copy_from_slice(map.as_slice()),
            pts,
            dts: buffer.dts().map(|t| t.nseconds() as i64).unwrap_or(pts),
            duration: buffer.duration().map(|t| t.nseconds() as i64).unwrap_or(0),
            keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            stream_index: 0,
            position: -1,
        })
    }
}

impl MuxerBackend for GstMuxer {
    fn stream_time_base(&self) -> Rational {
        Rational::NANOSECONDS
    }

    fn write_header(&mut self) -> Result<(), EncoderError> {
        let init = |message: String| EncoderError::Init {
            path: self.path.clone(),
            message,
        };

        let (Some(encode), Some(mux)) = (&self.encode, &self.mux) else {
            return Err(EncoderError::Unusable("Pipelines released".to_string()));
        };
        mux.play().map_err(init)?;
        encode.play().map_err(init)?;
        Ok(())
    }

    fn send_picture(&mut self, picture: &[u8], timing: FrameTiming) -> Result<(), EncoderError> {
        self.check_pipelines()?;

        let mut buffer = gst::Buffer::from_slice(picture.to_vec());
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(clock_time(timing.pts));
            buffer_ref.set_duration(clock_time(timing.duration));
        }

        self.encode_src
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| EncoderError::Unusable(format!("Encoder rejected picture: {:?}", e)))
    }

    // x264enc runs on its own streaming thread, so a picture's access unit
    // usually shows up on a later poll. Only a flushing drain blocks.
    fn receive_packet(&mut self) -> Result<Option<Packet>, EncoderError> {
        let timeout = if self.flushing {
            DRAIN_TIMEOUT
        } else {
            gst::ClockTime::ZERO
        };

        match self.encode_sink.try_pull_sample(timeout) {
            Some(sample) => Self::sample_to_packet(&sample).map(Some),
            None => Ok(None),
        }
    }

    fn flush(&mut self) -> Result<(), EncoderError> {
        self.encode_src
            .end_of_stream()
            .map_err(|e| EncoderError::Unusable(format!("Failed to flush encoder: {:?}", e)))?;
        self.flushing = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet) -> Result<(), EncoderError> {
        let mut buffer = gst::Buffer::from_slice(packet.data);
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(clock_time(packet.pts));
            buffer_ref.set_dts(clock_time(packet.dts));
            buffer_ref.set_duration(clock_time(packet.duration));
            buffer_ref.set_offset(packet.position.max(0) as u64);
            if !packet.keyframe {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        match self.mux_src.push_buffer(buffer) {
            Ok(_) => Ok(()),
            Err(
                e @ (gst::FlowError::Flushing
                | gst::FlowError::Eos
                | gst::FlowError::Error
                | gst::FlowError::NotLinked),
            ) => Err(EncoderError::Unusable(format!("Muxer stopped: {:?}", e))),
            Err(e) => Err(EncoderError::Step(format!("Packet rejected: {:?}", e))),
        }
    }

    fn write_trailer(&mut self) -> Result<(), EncoderError> {
        let Some(mux) = &self.mux else {
            return Err(EncoderError::Unusable("Pipelines released".to_string()));
        };

        self.mux_src
            .end_of_stream()
            .map_err(|e| EncoderError::Unusable(format!("Failed to end mux stream: {:?}", e)))?;

        let bus = mux
            .0
            .bus()
            .ok_or_else(|| EncoderError::Unusable("Mux pipeline has no bus".to_string()))?;

        for msg in bus.iter_timed(TRAILER_TIMEOUT) {
            match msg.view() {
                gst::MessageView::Eos(..) => return Ok(()),
                gst::MessageView::Error(err) => {
                    return Err(EncoderError::Unusable(format!(
                        "Muxer failed writing trailer: {}",
                        err.error()
                    )));
                }
                _ => {}
            }
        }

        Err(EncoderError::Unusable(format!(
            "Timed out finalizing {}",
            self.path.display()
        )))
    }

    fn release(&mut self) {
        self.encode.take();
        self.mux.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::encoder::H264_PARAMETER_SETS;

    fn params() -> StreamParams {
        StreamParams {
            width: 640,
            height: 360,
            fps: 15,
            bitrate_min: 50_000,
            bitrate: 100_000,
            bitrate_max: 150_000,
            gop_size: 15,
            max_b_frames: EncoderConfig::default().max_b_frames,
            codec_time_base: Rational::per_frame(15),
            parameter_sets: &H264_PARAMETER_SETS,
            profile: "main".to_string(),
            preset: "superfast".to_string(),
            threads: 1,
        }
    }

    #[test]
    fn test_encode_pipeline_description() {
        let description = encode_pipeline_description(&params());
        assert!(description.contains("bitrate=100 "));
        assert!(description.contains("key-int-max=15"));
        assert!(description.contains("bframes=5"));
        assert!(description.contains("speed-preset=superfast"));
        assert!(description.contains("threads=1"));
        assert!(description.contains("vbv-maxrate=150"));
        assert!(description.contains("profile=main"));
    }

    #[test]
    fn test_mux_pipeline_description() {
        let description = mux_pipeline_description(Path::new("/tmp/upload/cam-1-1.mp4"));
        assert!(description.contains("mp4mux"));
        assert!(description.ends_with("location=\"/tmp/upload/cam-1-1.mp4\""));
    }

    #[test]
    fn test_clock_time_clamps_negative() {
        assert_eq!(clock_time(-5), gst::ClockTime::ZERO);
        assert_eq!(clock_time(40), gst::ClockTime::from_nseconds(40));
    }
}
