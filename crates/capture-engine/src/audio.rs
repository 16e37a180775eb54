//! Audio capture pipeline.
//!
//! Two threads: a capture thread blocking on device reads and an encoder
//! thread. They are joined by a bounded queue; when the queue is full the
//! capture thread waits instead of dropping samples.
//!
//! ```text
//! AudioSource ──read──▶ [capture] ──bounded queue──▶ [encode] ──▶ FrameSink
//!      (+ secondary source, mixed)                    AudioClock
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use rewind_common::clock::AudioClock;
use rewind_common::config::AudioDefaults;
use rewind_common::error::{RewindError, RewindResult};

use crate::encoder::{mix_samples, AudioEncoder, AudioSource};
use crate::frame::{FrameSink, StreamKind};
use crate::video::deliver;

/// Poll interval for both ends of the PCM queue.
const QUEUE_POLL: Duration = Duration::from_millis(20);

/// Nice value requested for the capture thread.
#[cfg(unix)]
const CAPTURE_NICE: libc::c_int = -10;

/// Sizing for the audio pipeline.
#[derive(Debug, Clone)]
pub struct AudioPipelineConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample frames per chunk read from the device.
    pub chunk_frames: usize,
    /// Chunks allowed in flight between capture and encode.
    pub queue_capacity: usize,
}

impl AudioPipelineConfig {
    pub fn from_defaults(audio: &AudioDefaults) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            chunk_frames: audio.chunk_frames,
            queue_capacity: audio.queue_capacity,
        }
    }

    fn chunk_samples(&self) -> usize {
        self.chunk_frames.max(1) * self.channels.max(1) as usize
    }
}

impl Default for AudioPipelineConfig {
    fn default() -> Self {
        Self::from_defaults(&AudioDefaults::default())
    }
}

/// The device and codec objects an audio pipeline runs on.
pub struct AudioComponents {
    pub source: Box<dyn AudioSource>,
    /// Optional second source mixed into the first (e.g. playback capture
    /// next to the microphone).
    pub secondary: Option<Box<dyn AudioSource>>,
    pub encoder: Box<dyn AudioEncoder>,
}

/// Runs the capture and encode threads for one audio stream.
pub struct AudioCapturePipeline {
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    encode: Option<JoinHandle<()>>,
}

impl AudioCapturePipeline {
    /// Start the sources and the encoder, then both threads. Start errors
    /// are returned; anything already started is stopped again.
    pub fn start(
        components: AudioComponents,
        config: AudioPipelineConfig,
        sink: Arc<dyn FrameSink>,
    ) -> RewindResult<Self> {
        Self::start_at(components, config, 0, sink)
    }

    /// Like [`start`](Self::start), with the first chunk stamped
    /// `start_pts_us` instead of zero.
    pub fn start_at(
        components: AudioComponents,
        config: AudioPipelineConfig,
        start_pts_us: i64,
        sink: Arc<dyn FrameSink>,
    ) -> RewindResult<Self> {
        let AudioComponents {
            mut source,
            secondary,
            mut encoder,
        } = components;

        source.start()?;
        let secondary = secondary.and_then(|mut extra| match extra.start() {
            Ok(()) => Some(extra),
            Err(e) => {
                tracing::warn!(error = %e, "Secondary audio source unavailable; capturing primary only");
                None
            }
        });
        if let Err(e) = encoder.start() {
            stop_source(source.as_mut(), "primary");
            if let Some(mut extra) = secondary {
                stop_source(extra.as_mut(), "secondary");
            }
            return Err(e);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam_channel::bounded::<Vec<i16>>(config.queue_capacity.max(1));

        let capture = {
            let running = running.clone();
            let sink = sink.clone();
            let chunk_samples = config.chunk_samples();
            std::thread::Builder::new()
                .name("rewind-audio-capture".to_string())
                .spawn(move || {
                    capture_loop(source, secondary, chunk_samples, tx, &running, sink.as_ref())
                })
                .map_err(|e| RewindError::capture(format!("Failed to spawn audio capture thread: {e}")))?
        };

        let encode = {
            let running = running.clone();
            let clock = AudioClock::starting_at(config.sample_rate, config.channels, start_pts_us);
            std::thread::Builder::new()
                .name("rewind-audio-encode".to_string())
                .spawn(move || encode_loop(encoder, clock, rx, &running, sink.as_ref()))
        };
        let encode = match encode {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                let _ = capture.join();
                return Err(RewindError::capture(format!(
                    "Failed to spawn audio encode thread: {e}"
                )));
            }
        };

        tracing::info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            chunk_frames = config.chunk_frames,
            start_pts_us,
            "Audio capture pipeline started"
        );
        Ok(Self {
            running,
            capture: Some(capture),
            encode: Some(encode),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop capturing; queued chunks are still encoded before the encoder
    /// thread exits.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let mut joined = false;
        for handle in [self.capture.take(), self.encode.take()].into_iter().flatten() {
            joined = true;
            if handle.join().is_err() {
                tracing::error!("Audio pipeline thread panicked");
            }
        }
        if joined {
            tracing::info!("Audio capture pipeline stopped");
        }
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut source: Box<dyn AudioSource>,
    mut secondary: Option<Box<dyn AudioSource>>,
    chunk_samples: usize,
    tx: Sender<Vec<i16>>,
    running: &AtomicBool,
    sink: &dyn FrameSink,
) {
    raise_priority();

    let mut buf = vec![0i16; chunk_samples];
    let mut extra = vec![0i16; chunk_samples];

    'capture: while running.load(Ordering::SeqCst) {
        let n = match source.read(&mut buf) {
            Ok(0) => {
                tracing::info!("Audio source reached end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                fail(running, sink, &e, "Audio capture device failed");
                break;
            }
        };

        if let Some(second) = secondary.as_mut() {
            match second.read(&mut extra[..n]) {
                Ok(m) => mix_samples(&mut buf[..n], &extra[..m]),
                Err(e) => {
                    tracing::warn!(error = %e, "Secondary audio source failed; continuing without it");
                    stop_source(second.as_mut(), "secondary");
                    secondary = None;
                }
            }
        }

        let mut chunk = buf[..n].to_vec();
        loop {
            match tx.send_timeout(chunk, QUEUE_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(pending)) => {
                    if !running.load(Ordering::SeqCst) {
                        break 'capture;
                    }
                    tracing::trace!("Audio encoder queue full; waiting");
                    chunk = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => break 'capture,
            }
        }
    }

    stop_source(source.as_mut(), "primary");
    if let Some(mut second) = secondary {
        stop_source(second.as_mut(), "secondary");
    }
}

fn encode_loop(
    mut encoder: Box<dyn AudioEncoder>,
    mut clock: AudioClock,
    rx: Receiver<Vec<i16>>,
    running: &AtomicBool,
    sink: &dyn FrameSink,
) {
    loop {
        match rx.recv_timeout(QUEUE_POLL) {
            Ok(chunk) => {
                let pts_us = clock.next_pts(chunk.len());
                match encoder.encode(&chunk, pts_us) {
                    Ok(outputs) => {
                        for output in outputs {
                            deliver(sink, StreamKind::Audio, output);
                        }
                    }
                    Err(e) => {
                        fail(running, sink, &e, "Audio encoder failed");
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            // Capture thread is gone and the queue is drained.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Err(e) = encoder.stop() {
        tracing::warn!(error = %e, "Failed to stop audio encoder");
    }
    tracing::debug!(frames = clock.frames_encoded(), "Audio encoder thread exiting");
}

/// Report the first failure only; later ones are fallout of the teardown.
fn fail(running: &AtomicBool, sink: &dyn FrameSink, error: &RewindError, what: &str) {
    if running.swap(false, Ordering::SeqCst) {
        tracing::error!(error = %error, "{what}; tearing down audio pipeline");
        sink.on_failure(StreamKind::Audio, error);
    }
}

fn stop_source(source: &mut dyn AudioSource, which: &str) {
    if let Err(e) = source.stop() {
        tracing::warn!(source = which, error = %e, "Failed to stop audio source");
    }
}

#[cfg(unix)]
fn raise_priority() {
    // SAFETY: setpriority has no memory-safety preconditions; `who = 0`
    // targets the calling thread on Linux.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, CAPTURE_NICE) };
    if rc != 0 {
        tracing::debug!(
            error = %std::io::Error::last_os_error(),
            "Could not raise audio capture thread priority"
        );
    }
}

#[cfg(not(unix))]
fn raise_priority() {}
