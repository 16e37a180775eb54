//! Video capture pipeline: one thread polling the video encoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rewind_common::error::{RewindError, RewindResult};

use crate::encoder::VideoEncoder;
use crate::frame::{EncoderOutput, FrameSink, StreamKind};

/// How long one encoder poll may block before the run flag is checked.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Drives a [`VideoEncoder`] on a dedicated thread and hands its output to
/// a [`FrameSink`].
pub struct VideoCapturePipeline {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl VideoCapturePipeline {
    /// Start the encoder and the polling thread. Encoder configuration
    /// errors are returned here and no thread is spawned.
    pub fn start(
        mut encoder: Box<dyn VideoEncoder>,
        sink: Arc<dyn FrameSink>,
    ) -> RewindResult<Self> {
        encoder.start()?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let worker = std::thread::Builder::new()
            .name("rewind-video".to_string())
            .spawn(move || run(encoder, sink, flag))
            .map_err(|e| RewindError::capture(format!("Failed to spawn video thread: {e}")))?;

        tracing::info!("Video capture pipeline started");
        Ok(Self {
            running,
            worker: Some(worker),
        })
    }

    /// Whether the polling thread is still alive. Turns false on its own
    /// after an encoder error or end of stream.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop polling and wait for the thread to stop the encoder.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Video capture thread panicked");
            }
            tracing::info!("Video capture pipeline stopped");
        }
    }
}

impl Drop for VideoCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut encoder: Box<dyn VideoEncoder>, sink: Arc<dyn FrameSink>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match encoder.next_output(POLL_TIMEOUT) {
            Ok(EncoderOutput::EndOfStream) => {
                tracing::info!("Video encoder reached end of stream");
                break;
            }
            Ok(output) => deliver(sink.as_ref(), StreamKind::Video, output),
            Err(e) => {
                tracing::error!(error = %e, "Video encoder failed; tearing down pipeline");
                running.store(false, Ordering::SeqCst);
                stop_encoder(encoder.as_mut());
                sink.on_failure(StreamKind::Video, &e);
                return;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    stop_encoder(encoder.as_mut());
}

fn stop_encoder(encoder: &mut dyn VideoEncoder) {
    if let Err(e) = encoder.stop() {
        tracing::warn!(error = %e, "Failed to stop video encoder");
    }
}

/// Route one encoder output to the sink. End of stream is the caller's
/// business and ignored here.
pub(crate) fn deliver(sink: &dyn FrameSink, kind: StreamKind, output: EncoderOutput) {
    match output {
        EncoderOutput::FormatChanged(format) => {
            tracing::info!(stream = %kind, caps = %format.caps, "Encoder output format changed");
            sink.on_format(format);
        }
        EncoderOutput::Frame(unit) => {
            if let Some(frame) = unit.into_frame(kind) {
                sink.on_frame(frame);
            }
        }
        EncoderOutput::Pending | EncoderOutput::EndOfStream => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{EncodedFrame, EncodedUnit, StreamFormat};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        formats: Mutex<Vec<StreamFormat>>,
        frames: Mutex<Vec<EncodedFrame>>,
        failures: Mutex<Vec<StreamKind>>,
    }

    impl FrameSink for Recorder {
        fn on_format(&self, format: StreamFormat) {
            self.formats.lock().unwrap().push(format);
        }
        fn on_frame(&self, frame: EncodedFrame) {
            self.frames.lock().unwrap().push(frame);
        }
        fn on_failure(&self, kind: StreamKind, _error: &RewindError) {
            self.failures.lock().unwrap().push(kind);
        }
    }

    struct Scripted {
        outputs: VecDeque<RewindResult<EncoderOutput>>,
        stopped: Arc<AtomicBool>,
        fail_start: bool,
    }

    impl VideoEncoder for Scripted {
        fn start(&mut self) -> RewindResult<()> {
            if self.fail_start {
                return Err(RewindError::config("bad encoder settings"));
            }
            Ok(())
        }
        fn next_output(&mut self, _timeout: Duration) -> RewindResult<EncoderOutput> {
            self.outputs
                .pop_front()
                .unwrap_or(Ok(EncoderOutput::EndOfStream))
        }
        fn stop(&mut self) -> RewindResult<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn unit(pts_us: i64, key_frame: bool, codec_config: bool) -> EncoderOutput {
        EncoderOutput::Frame(EncodedUnit {
            data: vec![1, 2, 3],
            pts_us,
            key_frame,
            codec_config,
        })
    }

    fn wait_until_stopped(pipeline: &VideoCapturePipeline) {
        for _ in 0..200 {
            if !pipeline.is_running() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("pipeline did not stop");
    }

    #[test]
    fn test_forwards_format_and_media_frames() {
        let recorder = Arc::new(Recorder::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let encoder = Scripted {
            outputs: VecDeque::from(vec![
                Ok(EncoderOutput::FormatChanged(StreamFormat::new(
                    StreamKind::Video,
                    "video/x-h264",
                ))),
                Ok(unit(0, false, true)),
                Ok(EncoderOutput::Pending),
                Ok(unit(0, true, false)),
                Ok(unit(33_333, false, false)),
            ]),
            stopped: stopped.clone(),
            fail_start: false,
        };

        let mut pipeline = VideoCapturePipeline::start(Box::new(encoder), recorder.clone()).unwrap();
        wait_until_stopped(&pipeline);
        pipeline.stop();

        assert_eq!(recorder.formats.lock().unwrap().len(), 1);
        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_key_frame());
        assert_eq!(frames[1].pts_us(), 33_333);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(recorder.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_encoder_error_tears_down_and_reports() {
        let recorder = Arc::new(Recorder::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let encoder = Scripted {
            outputs: VecDeque::from(vec![
                Ok(unit(0, true, false)),
                Err(RewindError::encoder("codec exception")),
                Ok(unit(33_333, false, false)),
            ]),
            stopped: stopped.clone(),
            fail_start: false,
        };

        let pipeline = VideoCapturePipeline::start(Box::new(encoder), recorder.clone()).unwrap();
        wait_until_stopped(&pipeline);
        drop(pipeline);

        assert_eq!(recorder.frames.lock().unwrap().len(), 1);
        assert_eq!(*recorder.failures.lock().unwrap(), vec![StreamKind::Video]);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_configuration_error_is_returned() {
        let encoder = Scripted {
            outputs: VecDeque::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            fail_start: true,
        };
        let result = VideoCapturePipeline::start(Box::new(encoder), Arc::new(Recorder::default()));
        assert!(matches!(result, Err(RewindError::Config { .. })));
    }
}
