//! Audio capture and encoding on GStreamer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use rewind_common::clock::us_to_ns;
use rewind_common::error::{RewindError, RewindResult};

use crate::backend::{buffer_pts_us, AudioInput};
use crate::encoder::{AudioEncoder, AudioSource};
use crate::frame::{EncodedUnit, EncoderOutput, StreamFormat, StreamKind};
use crate::pipeline::{init_gstreamer, take_bus_error};

const PULL_TIMEOUT: gst::ClockTime = gst::ClockTime::from_mseconds(100);

/// A device read that produces nothing for this long is a device error.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

fn build_pipeline(launch: &str, what: &str) -> RewindResult<gst::Pipeline> {
    init_gstreamer()?;
    gst::parse::launch(launch)
        .map_err(|e| RewindError::config(format!("Failed to build {what} pipeline: {e}")))?
        .dynamic_cast::<gst::Pipeline>()
        .map_err(|_| RewindError::config(format!("{what} launch string did not produce a pipeline")))
}

fn element<T: IsA<gst::Element>>(pipeline: &gst::Pipeline, name: &str) -> RewindResult<T> {
    pipeline
        .by_name(name)
        .and_then(|e| e.downcast::<T>().ok())
        .ok_or_else(|| RewindError::config(format!("Pipeline has no element '{name}'")))
}

/// Interleaved S16LE PCM pulled from an audio input.
pub struct GstAudioSource {
    input: AudioInput,
    sample_rate: u32,
    channels: u16,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    pending: VecDeque<i16>,
}

impl GstAudioSource {
    pub fn new(input: AudioInput, sample_rate: u32, channels: u16) -> Self {
        Self {
            input,
            sample_rate,
            channels,
            pipeline: None,
            appsink: None,
            pending: VecDeque::new(),
        }
    }

    fn launch(&self) -> String {
        format!(
            "{} ! audioconvert ! audioresample ! audio/x-raw,format=S16LE,layout=interleaved,rate={},channels={} ! appsink name=sink sync=false",
            self.input.launch_fragment(),
            self.sample_rate,
            self.channels
        )
    }
}

impl AudioSource for GstAudioSource {
    fn start(&mut self) -> RewindResult<()> {
        let pipeline = build_pipeline(&self.launch(), "audio capture")?;
        let appsink = element::<gst_app::AppSink>(&pipeline, "sink")?;
        pipeline.set_state(gst::State::Playing).map_err(|e| {
            RewindError::capture(format!("Failed to start audio capture: {e:?}"))
        })?;
        tracing::info!(input = ?self.input, rate = self.sample_rate, "Audio source started");
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.pending.clear();
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> RewindResult<usize> {
        let (Some(pipeline), Some(appsink)) = (&self.pipeline, &self.appsink) else {
            return Err(RewindError::capture("Audio source is not started"));
        };

        let mut last_data = Instant::now();
        while self.pending.len() < buf.len() {
            if let Some(error) = take_bus_error(pipeline) {
                return Err(RewindError::capture(format!("Audio device error: {error}")));
            }
            match appsink.try_pull_sample(PULL_TIMEOUT) {
                Some(sample) => {
                    let Some(buffer) = sample.buffer() else {
                        continue;
                    };
                    let map = buffer
                        .map_readable()
                        .map_err(|e| RewindError::capture(format!("Unreadable audio buffer: {e}")))?;
                    self.pending.extend(
                        map.as_slice()
                            .chunks_exact(2)
                            .map(|b| i16::from_le_bytes([b[0], b[1]])),
                    );
                    last_data = Instant::now();
                }
                None if appsink.is_eos() => break,
                None if last_data.elapsed() > STALL_TIMEOUT => {
                    return Err(RewindError::capture("Audio device stopped delivering samples"));
                }
                None => {}
            }
        }

        let n = buf.len().min(self.pending.len());
        for (slot, sample) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = sample;
        }
        Ok(n)
    }

    fn stop(&mut self) -> RewindResult<()> {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.set_state(gst::State::Null).map_err(|e| {
                RewindError::capture(format!("Failed to stop audio capture: {e:?}"))
            })?;
        }
        Ok(())
    }
}

impl Drop for GstAudioSource {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

/// Compressing audio encoder: PCM in through an appsrc, packets out of an
/// appsink.
pub struct GstAudioEncoder {
    element: &'static str,
    sample_rate: u32,
    channels: u16,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    appsink: Option<gst_app::AppSink>,
    caps: Option<String>,
}

impl GstAudioEncoder {
    pub fn opus(sample_rate: u32, channels: u16) -> Self {
        Self {
            element: "opusenc",
            sample_rate,
            channels,
            pipeline: None,
            appsrc: None,
            appsink: None,
            caps: None,
        }
    }

    fn launch(&self) -> String {
        format!(
            "appsrc name=src format=time caps=\"{}\" ! audioconvert ! audioresample ! {} ! appsink name=sink sync=false",
            StreamFormat::pcm_s16le(self.sample_rate, self.channels).caps,
            self.element
        )
    }

    fn drain(&mut self, outputs: &mut Vec<EncoderOutput>) -> RewindResult<()> {
        let Some(appsink) = &self.appsink else {
            return Ok(());
        };
        while let Some(sample) = appsink.try_pull_sample(gst::ClockTime::ZERO) {
            if let Some(caps) = sample.caps().map(|c| c.to_string()) {
                if self.caps.as_deref() != Some(caps.as_str()) {
                    self.caps = Some(caps.clone());
                    outputs.push(EncoderOutput::FormatChanged(StreamFormat::new(StreamKind::Audio, caps)));
                }
            }
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let Some(pts_us) = buffer_pts_us(buffer) else {
                tracing::warn!("Dropping encoded audio packet without a timestamp");
                continue;
            };
            let map = buffer
                .map_readable()
                .map_err(|e| RewindError::encoder(format!("Unreadable audio packet: {e}")))?;
            outputs.push(EncoderOutput::Frame(EncodedUnit {
                data: map.as_slice().to_vec(),
                pts_us,
                key_frame: true,
                codec_config: buffer.flags().contains(gst::BufferFlags::HEADER),
            }));
        }
        Ok(())
    }
}

impl AudioEncoder for GstAudioEncoder {
    fn start(&mut self) -> RewindResult<()> {
        let pipeline = build_pipeline(&self.launch(), "audio encoder")?;
        let appsrc = element::<gst_app::AppSrc>(&pipeline, "src")?;
        let appsink = element::<gst_app::AppSink>(&pipeline, "sink")?;
        pipeline.set_state(gst::State::Playing).map_err(|e| {
            RewindError::config(format!("Failed to start audio encoder: {e:?}"))
        })?;
        tracing::info!(encoder = self.element, "Audio encoder started");
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        self.appsink = Some(appsink);
        self.caps = None;
        Ok(())
    }

    fn encode(&mut self, samples: &[i16], pts_us: i64) -> RewindResult<Vec<EncoderOutput>> {
        let (Some(pipeline), Some(appsrc)) = (&self.pipeline, &self.appsrc) else {
            return Err(RewindError::encoder("Audio encoder is not started"));
        };
        if let Some(error) = take_bus_error(pipeline) {
            return Err(RewindError::encoder(format!("Audio encoder error: {error}")));
        }

        if !samples.is_empty() {
            let frames = samples.len() as u64 / self.channels.max(1) as u64;
            let duration_ns = frames * 1_000_000_000 / self.sample_rate.max(1) as u64;
            let bytes: Vec<u8> = samples.iter().copied().flat_map(i16::to_le_bytes).collect();
            let mut buffer = gst::Buffer::from_slice(bytes);
            if let Some(buf) = buffer.get_mut() {
                buf.set_pts(gst::ClockTime::from_nseconds(us_to_ns(pts_us)));
                buf.set_duration(gst::ClockTime::from_nseconds(duration_ns));
            }
            appsrc
                .push_buffer(buffer)
                .map_err(|e| RewindError::encoder(format!("Audio encoder rejected input: {e:?}")))?;
        }

        let mut outputs = Vec::new();
        self.drain(&mut outputs)?;
        Ok(outputs)
    }

    fn stop(&mut self) -> RewindResult<()> {
        if let Some(appsrc) = self.appsrc.take() {
            let _ = appsrc.end_of_stream();
        }
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.set_state(gst::State::Null).map_err(|e| {
                RewindError::encoder(format!("Failed to stop audio encoder: {e:?}"))
            })?;
        }
        Ok(())
    }
}

impl Drop for GstAudioEncoder {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_launch_requests_s16le() {
        let source = GstAudioSource::new(AudioInput::TestTone, 48_000, 2);
        let launch = source.launch();
        assert!(launch.starts_with("audiotestsrc"));
        assert!(launch.contains("format=S16LE"));
        assert!(launch.contains("rate=48000,channels=2"));
    }

    #[test]
    fn test_encoder_launch_feeds_opusenc_from_appsrc() {
        let launch = GstAudioEncoder::opus(44_100, 1).launch();
        assert!(launch.starts_with("appsrc name=src format=time"));
        assert!(launch.contains("! opusenc !"));
    }

    #[test]
    fn test_encode_before_start_fails() {
        let mut encoder = GstAudioEncoder::opus(44_100, 1);
        assert!(encoder.encode(&[0; 4], 0).is_err());
    }
}
