//! H.264 video encoder on a GStreamer appsink.

use std::collections::VecDeque;
use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use rewind_common::config::CaptureDefaults;
use rewind_common::error::{RewindError, RewindResult};

use crate::backend::{buffer_pts_us, VideoSource};
use crate::encoder::VideoEncoder;
use crate::frame::{EncodedUnit, EncoderOutput, StreamFormat, StreamKind};
use crate::pipeline::{init_gstreamer, take_bus_error};

/// Encoder parameters.
#[derive(Debug, Clone)]
pub struct VideoEncoderSettings {
    pub source: VideoSource,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub keyframe_interval_secs: u32,
}

impl VideoEncoderSettings {
    pub fn from_capture(source: VideoSource, capture: &CaptureDefaults) -> Self {
        Self {
            source,
            fps: capture.fps,
            bitrate_kbps: capture.bitrate_kbps,
            keyframe_interval_secs: capture.keyframe_interval_secs,
        }
    }

    /// Launch string ending in an appsink named `sink` that emits
    /// access units in AVC form, so codec data travels in the caps.
    pub fn launch(&self) -> RewindResult<String> {
        if self.fps == 0 {
            return Err(RewindError::config("Video frame rate must be positive"));
        }
        if self.bitrate_kbps == 0 {
            return Err(RewindError::config("Video bitrate must be positive"));
        }
        let fps = self.fps;
        let bitrate = self.bitrate_kbps;
        let keyint = fps.saturating_mul(self.keyframe_interval_secs.max(1));
        let source = self.source.launch_fragment();
        // Leaky queue in front so an encoder stall drops raw frames at the
        // source instead of backing up the display grab.
        Ok(format!(
            "{source} ! queue max-size-buffers=200 leaky=downstream ! videoconvert ! videorate ! video/x-raw,framerate={fps}/1 ! queue max-size-buffers=8 ! x264enc tune=zerolatency speed-preset=veryfast bitrate={bitrate} key-int-max={keyint} ! h264parse ! video/x-h264,stream-format=avc,alignment=au ! appsink name=sink sync=false max-buffers=64"
        ))
    }
}

pub struct GstVideoEncoder {
    settings: VideoEncoderSettings,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    caps: Option<String>,
    pending: VecDeque<EncoderOutput>,
}

impl GstVideoEncoder {
    pub fn new(settings: VideoEncoderSettings) -> Self {
        Self {
            settings,
            pipeline: None,
            appsink: None,
            caps: None,
            pending: VecDeque::new(),
        }
    }

    fn pull(&mut self, timeout: Duration) -> RewindResult<()> {
        let (Some(pipeline), Some(appsink)) = (&self.pipeline, &self.appsink) else {
            return Err(RewindError::encoder("Video encoder is not started"));
        };
        if let Some(error) = take_bus_error(pipeline) {
            return Err(RewindError::encoder(format!("Video pipeline error: {error}")));
        }

        let timeout = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            if appsink.is_eos() {
                self.pending.push_back(EncoderOutput::EndOfStream);
            }
            return Ok(());
        };

        if let Some(caps) = sample.caps().map(|c| c.to_string()) {
            if self.caps.as_deref() != Some(caps.as_str()) {
                self.caps = Some(caps.clone());
                self.pending
                    .push_back(EncoderOutput::FormatChanged(StreamFormat::new(StreamKind::Video, caps)));
            }
        }

        let Some(buffer) = sample.buffer() else {
            return Ok(());
        };
        let Some(pts_us) = buffer_pts_us(buffer) else {
            tracing::warn!("Dropping encoded video buffer without a timestamp");
            return Ok(());
        };
        let map = buffer
            .map_readable()
            .map_err(|e| RewindError::encoder(format!("Unreadable video buffer: {e}")))?;
        let flags = buffer.flags();
        self.pending.push_back(EncoderOutput::Frame(EncodedUnit {
            data: map.as_slice().to_vec(),
            pts_us,
            key_frame: !flags.contains(gst::BufferFlags::DELTA_UNIT),
            codec_config: flags.contains(gst::BufferFlags::HEADER),
        }));
        Ok(())
    }
}

impl VideoEncoder for GstVideoEncoder {
    fn start(&mut self) -> RewindResult<()> {
        init_gstreamer()?;
        let launch = self.settings.launch()?;

        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| RewindError::config(format!("Failed to build video pipeline: {e}")))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| RewindError::config("Video launch string did not produce a pipeline"))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| RewindError::config("Video pipeline has no appsink"))?;

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            RewindError::config(format!("Failed to start video pipeline: {e:?}"))
        })?;

        tracing::info!(
            source = ?self.settings.source,
            fps = self.settings.fps,
            bitrate_kbps = self.settings.bitrate_kbps,
            "Video encoder started"
        );
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.caps = None;
        self.pending.clear();
        Ok(())
    }

    fn next_output(&mut self, timeout: Duration) -> RewindResult<EncoderOutput> {
        if self.pending.is_empty() {
            self.pull(timeout)?;
        }
        Ok(self.pending.pop_front().unwrap_or(EncoderOutput::Pending))
    }

    fn stop(&mut self) -> RewindResult<()> {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.set_state(gst::State::Null).map_err(|e| {
                RewindError::encoder(format!("Failed to stop video pipeline: {e:?}"))
            })?;
            tracing::info!("Video encoder stopped");
        }
        Ok(())
    }
}

impl Drop for GstVideoEncoder {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(fps: u32) -> VideoEncoderSettings {
        VideoEncoderSettings {
            source: VideoSource::TestPattern,
            fps,
            bitrate_kbps: 4_000,
            keyframe_interval_secs: 2,
        }
    }

    #[test]
    fn test_launch_sets_key_frame_interval_in_frames() {
        let launch = settings(30).launch().unwrap();
        assert!(launch.starts_with("videotestsrc"));
        assert!(launch.contains("key-int-max=60"));
        assert!(launch.contains("bitrate=4000"));
        assert!(launch.ends_with("appsink name=sink sync=false max-buffers=64"));
    }

    #[test]
    fn test_zero_fps_is_rejected() {
        assert!(matches!(settings(0).launch(), Err(RewindError::Config { .. })));
    }
}
