//! Shared fakes for engine integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use rewind_capture_engine::audio::AudioComponents;
use rewind_capture_engine::container::{ContainerFactory, ContainerWriter, Sample, TrackHandle};
use rewind_capture_engine::context::{SourceContext, StaticContext};
use rewind_capture_engine::dispatch::{AnalysisRequest, AnalysisSink};
use rewind_capture_engine::encoder::{AudioSource, PcmAudioEncoder, VideoEncoder};
use rewind_capture_engine::engine::{ClipCaptureEngine, EngineConfig, EngineParts};
use rewind_capture_engine::frame::{EncodedUnit, EncoderOutput, StreamFormat, StreamKind};
use rewind_capture_engine::pipeline::CapturePipeline;
use rewind_capture_engine::AudioPipelineConfig;
use rewind_common::error::{RewindError, RewindResult};

pub const FRAME_US: i64 = 100_000;
pub const KEY_EVERY: i64 = 10;

/// Everything one container writer saw.
#[derive(Debug, Default, Clone)]
pub struct Recording {
    pub path: PathBuf,
    pub tracks: Vec<StreamFormat>,
    pub samples: Vec<(usize, Sample)>,
    pub stopped: bool,
    pub released: bool,
}

impl Recording {
    pub fn track_samples(&self, kind: StreamKind) -> Vec<Sample> {
        let Some(index) = self.tracks.iter().position(|t| t.kind == kind) else {
            return Vec::new();
        };
        self.samples
            .iter()
            .filter(|(track, _)| *track == index)
            .map(|(_, sample)| sample.clone())
            .collect()
    }
}

/// Container factory keeping every write in memory.
#[derive(Default)]
pub struct MemoryContainers {
    pub recordings: Arc<Mutex<Vec<Arc<Mutex<Recording>>>>>,
    pub fail_open: AtomicBool,
}

impl MemoryContainers {
    pub fn recordings(&self) -> Vec<Recording> {
        self.recordings
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.lock().unwrap().clone())
            .collect()
    }
}

impl ContainerFactory for MemoryContainers {
    fn open(&self, path: &Path) -> RewindResult<Box<dyn ContainerWriter>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(RewindError::container("disk full"));
        }
        std::fs::File::create(path)?;
        let recording = Arc::new(Mutex::new(Recording {
            path: path.to_path_buf(),
            ..Recording::default()
        }));
        self.recordings.lock().unwrap().push(recording.clone());
        Ok(Box::new(MemoryWriter(recording)))
    }
}

struct MemoryWriter(Arc<Mutex<Recording>>);

impl ContainerWriter for MemoryWriter {
    fn add_track(&mut self, format: &StreamFormat) -> RewindResult<TrackHandle> {
        let mut rec = self.0.lock().unwrap();
        rec.tracks.push(format.clone());
        Ok(TrackHandle(rec.tracks.len() - 1))
    }

    fn start(&mut self) -> RewindResult<()> {
        Ok(())
    }

    fn write_sample(&mut self, track: TrackHandle, sample: Sample) -> RewindResult<()> {
        self.0.lock().unwrap().samples.push((track.0, sample));
        Ok(())
    }

    fn stop(&mut self) -> RewindResult<()> {
        self.0.lock().unwrap().stopped = true;
        Ok(())
    }

    fn release(&mut self) -> RewindResult<()> {
        self.0.lock().unwrap().released = true;
        Ok(())
    }
}

/// Video encoder replaying whatever the test pushes through a channel.
struct ScriptedVideo {
    outputs: Receiver<RewindResult<EncoderOutput>>,
}

impl VideoEncoder for ScriptedVideo {
    fn start(&mut self) -> RewindResult<()> {
        Ok(())
    }

    fn next_output(&mut self, timeout: Duration) -> RewindResult<EncoderOutput> {
        match self.outputs.recv_timeout(timeout) {
            Ok(output) => output,
            Err(RecvTimeoutError::Timeout) => Ok(EncoderOutput::Pending),
            Err(RecvTimeoutError::Disconnected) => Ok(EncoderOutput::EndOfStream),
        }
    }

    fn stop(&mut self) -> RewindResult<()> {
        Ok(())
    }
}

/// Test side of [`ScriptedVideo`].
pub struct VideoFeed {
    tx: Sender<RewindResult<EncoderOutput>>,
}

impl VideoFeed {
    pub fn format(&self) {
        let format = StreamFormat::new(StreamKind::Video, "video/x-h264,stream-format=avc");
        self.tx.send(Ok(EncoderOutput::FormatChanged(format))).unwrap();
    }

    /// Frame `index` of a 10 fps stream with a key frame every second.
    pub fn frame(&self, index: i64) {
        self.tx
            .send(Ok(EncoderOutput::Frame(EncodedUnit {
                data: vec![index as u8; 16],
                pts_us: index * FRAME_US,
                key_frame: index % KEY_EVERY == 0,
                codec_config: false,
            })))
            .unwrap();
    }

    pub fn frames(&self, range: std::ops::Range<i64>) {
        for index in range {
            self.frame(index);
        }
    }

    pub fn fail(&self) {
        self.tx
            .send(Err(RewindError::encoder("display surface lost")))
            .unwrap();
    }
}

/// Endless silence at roughly real-time pace.
struct PacedSilence;

impl AudioSource for PacedSilence {
    fn start(&mut self) -> RewindResult<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> RewindResult<usize> {
        std::thread::sleep(Duration::from_millis(10));
        buf.fill(0);
        Ok(buf.len())
    }

    fn stop(&mut self) -> RewindResult<()> {
        Ok(())
    }
}

pub struct ChannelSink(pub Sender<AnalysisRequest>);

impl AnalysisSink for ChannelSink {
    fn submit(&self, request: &AnalysisRequest) -> RewindResult<()> {
        self.0
            .send(request.clone())
            .map_err(|e| RewindError::capture(e.to_string()))
    }
}

/// Voice recorder that writes an empty file on start.
pub struct FakeMic {
    path: PathBuf,
    running: bool,
}

impl CapturePipeline for FakeMic {
    fn start(&mut self) -> RewindResult<()> {
        std::fs::File::create(&self.path)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> RewindResult<()> {
        self.running = false;
        Ok(())
    }

    fn release(&mut self) -> RewindResult<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

pub struct Harness {
    pub engine: ClipCaptureEngine,
    pub video: VideoFeed,
    pub containers: Arc<MemoryContainers>,
    pub analysis: Receiver<AnalysisRequest>,
    pub context: Arc<StaticContext>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(with_audio: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (video_tx, video_rx) = crossbeam_channel::unbounded();
        let (analysis_tx, analysis_rx) = crossbeam_channel::unbounded();
        let containers = Arc::new(MemoryContainers::default());
        let context = Arc::new(StaticContext::new(SourceContext::default()));

        let audio_config = AudioPipelineConfig {
            sample_rate: 1_000,
            channels: 1,
            chunk_frames: 10,
            queue_capacity: 8,
        };
        let config = EngineConfig {
            clips_dir: dir.path().to_path_buf(),
            buffer_capacity_us: 10_000_000,
            pre_roll_ms: 5_000,
            post_roll_ms: 5_000,
            audio: with_audio.then_some(audio_config),
            dispatch_delay: Duration::ZERO,
            link_max_age: Duration::from_secs(180),
        };

        let parts = EngineParts {
            video_encoder: Box::new(ScriptedVideo { outputs: video_rx }),
            audio: with_audio.then(|| {
                Box::new(|| {
                    Ok(AudioComponents {
                        source: Box::new(PacedSilence),
                        secondary: None,
                        encoder: Box::new(PcmAudioEncoder::new(1_000, 1)),
                    })
                }) as rewind_capture_engine::engine::AudioFactory
            }),
            containers: containers.clone(),
            voice_device: Box::new(|path: &Path| {
                Ok(Box::new(FakeMic {
                    path: path.to_path_buf(),
                    running: false,
                }) as Box<dyn CapturePipeline>)
            }),
            analysis: Arc::new(ChannelSink(analysis_tx)),
            context: context.clone(),
        };

        let engine = ClipCaptureEngine::init(config, parts).unwrap();
        Self {
            engine,
            video: VideoFeed { tx: video_tx },
            containers,
            analysis: analysis_rx,
            context,
            dir,
        }
    }

    /// Wait until the video thread has handled `count` frames in total.
    pub fn wait_video_frames(&self, count: u64) {
        let done = wait_until(|| {
            let stats = self.engine.status().video.stats;
            stats.frames_buffered + stats.frames_discarded >= count
        });
        assert!(done, "video thread did not handle {count} frames");
    }

    pub fn wait_video_format(&self) {
        assert!(wait_until(|| self.engine.status().video.format_known));
    }

    /// Start capture and buffer frames `0..count` with a known format.
    pub fn fill(&self, count: i64) {
        self.engine.start_capture().unwrap();
        self.video.format();
        self.wait_video_format();
        let before = self.engine.status().video.stats.frames_buffered;
        self.video.frames(0..count);
        self.wait_video_frames(before + count as u64);
    }

    pub fn wait_idle(&self) {
        assert!(wait_until(|| !self.engine.is_saving()), "clip never finished");
    }

    pub fn next_request(&self) -> AnalysisRequest {
        self.analysis
            .recv_timeout(Duration::from_secs(5))
            .expect("no analysis request dispatched")
    }
}

pub fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Every file under `dir`, recursively.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out
}
