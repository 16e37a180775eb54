//! Self-contained GStreamer recording pipelines.
//!
//! Used for recordings that go straight to a file without passing through
//! the ring buffers, such as voice notes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;

use rewind_common::error::{RewindError, RewindResult};

use crate::backend::AudioInput;

/// How long `stop` waits for end of stream to reach the sink.
const EOS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A recording pipeline with an explicit start/stop/release lifecycle.
pub trait CapturePipeline: Send {
    /// Start recording.
    fn start(&mut self) -> RewindResult<()>;

    /// Stop recording and finish the output file.
    fn stop(&mut self) -> RewindResult<()>;

    /// Release the underlying device and library resources.
    fn release(&mut self) -> RewindResult<()>;

    /// Check if the pipeline is currently recording.
    fn is_running(&self) -> bool;
}

pub struct GstCapturePipeline {
    name: String,
    pipeline: gst::Pipeline,
    running: Arc<AtomicBool>,
}

impl GstCapturePipeline {
    pub fn from_launch(name: impl Into<String>, launch: &str) -> RewindResult<Self> {
        init_gstreamer()?;

        let element = gst::parse::launch(launch)
            .map_err(|e| RewindError::capture(format!("Failed to build pipeline: {e}")))?;

        let pipeline = element
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| RewindError::capture("Launch string did not produce a pipeline"))?;

        Ok(Self {
            name: name.into(),
            pipeline,
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl CapturePipeline for GstCapturePipeline {
    fn start(&mut self) -> RewindResult<()> {
        self.pipeline.set_state(gst::State::Playing).map_err(|e| {
            RewindError::capture(format!("Failed to start {} pipeline: {e:?}", self.name))
        })?;

        // State changes are async; make sure the source really opened.
        match self.pipeline.state(gst::ClockTime::from_seconds(10)) {
            (Ok(_), gst::State::Playing, _) => {}
            (Ok(_), state, _) => {
                tracing::warn!(
                    pipeline = %self.name,
                    ?state,
                    "Pipeline did not reach Playing state within timeout"
                );
            }
            (Err(e), _, _) => {
                return Err(RewindError::capture(format!(
                    "{} pipeline failed to reach Playing state: {e:?}",
                    self.name
                )));
            }
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> RewindResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // The file header is only complete once EOS reaches the muxer.
        if self.pipeline.send_event(gst::event::Eos::new()) {
            drain_until_eos(&self.pipeline, &self.name, EOS_DRAIN_TIMEOUT);
        } else {
            tracing::warn!(pipeline = %self.name, "Failed to send EOS event; output may be truncated");
        }
        Ok(())
    }

    fn release(&mut self) -> RewindResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.pipeline.set_state(gst::State::Null).map_err(|e| {
            RewindError::capture(format!("Failed to release {} pipeline: {e:?}", self.name))
        })?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for GstCapturePipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Voice note recorder: audio input straight into a WAV file.
pub fn build_voice_note_pipeline(
    input: &AudioInput,
    output_path: &Path,
    sample_rate: u32,
    channels: u16,
) -> RewindResult<Box<dyn CapturePipeline>> {
    let path = escape_path(output_path);
    let source = input.launch_fragment();
    let launch = format!(
        "{source} ! audioconvert ! audioresample ! audio/x-raw,format=S16LE,rate={sample_rate},channels={channels} ! wavenc ! filesink location=\"{path}\""
    );
    Ok(Box::new(GstCapturePipeline::from_launch("voice-note", &launch)?))
}

/// Pop bus messages until EOS, an error, or the deadline.
pub(crate) fn drain_until_eos(pipeline: &gst::Pipeline, name: &str, deadline: Duration) {
    let Some(bus) = pipeline.bus() else {
        return;
    };
    let start = std::time::Instant::now();
    loop {
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            tracing::warn!(pipeline = name, "EOS drain timed out after {deadline:?}");
            break;
        }
        let remaining = gst::ClockTime::from_nseconds((deadline - elapsed).as_nanos() as u64);
        match bus.timed_pop(remaining) {
            Some(msg) => match msg.view() {
                gst::MessageView::Eos(_) => {
                    tracing::debug!(pipeline = name, "EOS received; pipeline drained");
                    break;
                }
                gst::MessageView::Error(e) => {
                    tracing::warn!(
                        pipeline = name,
                        error = %e.error(),
                        "Pipeline error during EOS drain"
                    );
                    break;
                }
                _ => {}
            },
            None => {
                tracing::warn!(pipeline = name, "EOS drain timed out after {deadline:?}");
                break;
            }
        }
    }
}

/// Surface the first pending error message on a pipeline bus, if any.
pub(crate) fn take_bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(msg) = bus.pop() {
        if let gst::MessageView::Error(e) = msg.view() {
            let source = e
                .src()
                .map(|s| s.path_string().to_string())
                .unwrap_or_default();
            return Some(format!("{source}: {}", e.error()));
        }
    }
    None
}

pub(crate) fn init_gstreamer() -> RewindResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    match GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string())) {
        Ok(()) => Ok(()),
        Err(e) => Err(RewindError::capture(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

/// Names of the GStreamer elements that are not installed, out of `names`.
pub fn missing_elements<'a>(names: &[&'a str]) -> RewindResult<Vec<&'a str>> {
    init_gstreamer()?;
    Ok(names
        .iter()
        .copied()
        .filter(|name| gst::ElementFactory::find(name).is_none())
        .collect())
}

pub(crate) fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('"', "\\\"")
}
