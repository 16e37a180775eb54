//! The clip capture engine: one object owning every piece of capture state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use rewind_common::clock::ms_to_us;
use rewind_common::config::AppConfig;
use rewind_common::error::{RejectReason, RewindError, RewindResult};

use crate::assembler::{AssemblerState, ClipAssembler, ClipTicket, FinishedClip};
use crate::audio::{AudioCapturePipeline, AudioComponents, AudioPipelineConfig};
use crate::container::ContainerFactory;
use crate::context::{LinkTracker, SourceContextProvider};
use crate::dispatch::{AnalysisDispatcher, AnalysisSink, ClipMetadata};
use crate::encoder::VideoEncoder;
use crate::frame::{EncodedFrame, FrameSink, StreamFormat, StreamKind};
use crate::storage::ClipStorage;
use crate::stream::{PipelineStats, StreamState};
use crate::video::VideoCapturePipeline;
use crate::voice::{VoiceDeviceFactory, VoiceNote, VoiceNoteRecorder};
use crate::window::{CaptureWindow, CaptureWindowController};

/// Builds fresh audio components each time capture is enabled.
pub type AudioFactory = Box<dyn FnMut() -> RewindResult<AudioComponents> + Send>;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub clips_dir: PathBuf,
    pub buffer_capacity_us: i64,
    pub pre_roll_ms: u64,
    pub post_roll_ms: u64,
    /// `None` disables audio capture.
    pub audio: Option<AudioPipelineConfig>,
    pub dispatch_delay: Duration,
    pub link_max_age: Duration,
}

impl EngineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            clips_dir: config.clips_dir.clone(),
            buffer_capacity_us: ms_to_us(config.capture.buffer_capacity_ms),
            pre_roll_ms: config.capture.pre_roll_ms,
            post_roll_ms: config.capture.post_roll_ms,
            audio: config
                .audio
                .enabled
                .then(|| AudioPipelineConfig::from_defaults(&config.audio)),
            dispatch_delay: Duration::from_millis(config.analysis.dispatch_delay_ms),
            link_max_age: Duration::from_secs(config.analysis.link_max_age_secs),
        }
    }
}

/// The backend objects the engine runs on.
pub struct EngineParts {
    pub video_encoder: Box<dyn VideoEncoder>,
    pub audio: Option<AudioFactory>,
    pub containers: Arc<dyn ContainerFactory>,
    pub voice_device: VoiceDeviceFactory,
    pub analysis: Arc<dyn AnalysisSink>,
    pub context: Arc<dyn SourceContextProvider>,
}

/// Snapshot of one stream for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub format_known: bool,
    pub pipeline_running: bool,
    pub buffered_frames: usize,
    pub buffered_span_ms: i64,
    pub stats: PipelineStats,
}

/// Snapshot of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub capturing: bool,
    pub state: AssemblerState,
    pub current_clip: Option<String>,
    pub last_clip: Option<String>,
    pub window: CaptureWindow,
    pub video: StreamStatus,
    pub audio: StreamStatus,
    pub voice_note: Option<PathBuf>,
}

/// State shared with the pipeline threads.
struct EngineCore {
    video: Arc<StreamState>,
    audio: Arc<StreamState>,
    /// Held shared while a frame is checked and buffered, exclusively while
    /// capture is switched off and the buffers are cleared.
    capturing: RwLock<bool>,
    assembler: ClipAssembler,
    dispatcher: AnalysisDispatcher,
}

impl EngineCore {
    fn stream(&self, kind: StreamKind) -> &StreamState {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
        }
    }

    fn dispatch(&self, clip: FinishedClip) {
        self.dispatcher.dispatch(
            clip.path,
            ClipMetadata {
                clip_base: clip.clip_base,
                trigger_offset_us: clip.realized_pre_roll_us,
                duration_us: clip.duration_us,
            },
        );
    }

    fn finalize_and_dispatch(&self) -> Option<PathBuf> {
        let clip = self.assembler.finalize()?;
        let path = clip.path.clone();
        self.dispatch(clip);
        Some(path)
    }
}

impl FrameSink for EngineCore {
    fn on_format(&self, format: StreamFormat) {
        self.stream(format.kind).set_format(format);
    }

    fn on_frame(&self, frame: EncodedFrame) {
        let stream = self.stream(frame.kind());
        {
            let capturing = read(&self.capturing);
            if !*capturing {
                stream.discard();
                return;
            }
            stream.record(frame.clone());
        }
        // The gate and the buffer lock are released before the session lock
        // is taken.
        if let Some(clip) = self.assembler.write_frame(&frame) {
            self.dispatch(clip);
        }
    }

    fn on_failure(&self, kind: StreamKind, error: &RewindError) {
        self.stream(kind).reset();
        match kind {
            StreamKind::Video => {
                tracing::error!(error = %error, "Video pipeline lost; engine needs re-initialization");
                if let Some(path) = self.finalize_and_dispatch() {
                    tracing::warn!(path = %path.display(), "Clip finished early after video failure");
                }
            }
            StreamKind::Audio => {
                tracing::warn!(error = %error, "Audio pipeline lost; clips continue without audio");
            }
        }
    }
}

/// Retrospective clip capture.
///
/// Construct with [`init`](Self::init); capture starts disabled. All
/// methods take `&self` so the engine can be shared with a trigger source.
pub struct ClipCaptureEngine {
    core: Arc<EngineCore>,
    window: CaptureWindowController,
    links: Arc<LinkTracker>,
    voice: VoiceNoteRecorder,
    video_pipeline: Mutex<Option<VideoCapturePipeline>>,
    audio_pipeline: Mutex<Option<AudioCapturePipeline>>,
    audio_factory: Mutex<Option<AudioFactory>>,
    audio_config: Option<AudioPipelineConfig>,
    audio_stopped_at: Mutex<Option<Instant>>,
    running: AtomicBool,
}

impl ClipCaptureEngine {
    /// Build the engine and start the video encoder. Encoder configuration
    /// errors are returned.
    pub fn init(config: EngineConfig, parts: EngineParts) -> RewindResult<Self> {
        let EngineParts {
            video_encoder,
            audio,
            containers,
            voice_device,
            analysis,
            context,
        } = parts;

        let capacity_us = config.buffer_capacity_us;
        let video = Arc::new(StreamState::new(StreamKind::Video, capacity_us));
        let audio_stream = Arc::new(StreamState::new(StreamKind::Audio, capacity_us));
        let storage = ClipStorage::new(&config.clips_dir);
        let links = Arc::new(LinkTracker::new());

        let core = Arc::new(EngineCore {
            video: video.clone(),
            audio: audio_stream.clone(),
            capturing: RwLock::new(false),
            assembler: ClipAssembler::new(video, audio_stream, containers, storage.clone()),
            dispatcher: AnalysisDispatcher::new(
                analysis,
                context,
                links.clone(),
                config.dispatch_delay,
                config.link_max_age,
            ),
        });

        let sink: Arc<dyn FrameSink> = core.clone();
        let video_pipeline = VideoCapturePipeline::start(video_encoder, sink)?;

        let window = CaptureWindowController::new(capacity_us, config.pre_roll_ms, config.post_roll_ms);
        let initial = window.window();
        tracing::info!(
            clips_dir = %config.clips_dir.display(),
            capacity_ms = capacity_us / 1_000,
            pre_roll_ms = initial.pre_roll_ms(),
            post_roll_ms = initial.post_roll_ms(),
            audio = config.audio.is_some() && audio.is_some(),
            "Clip capture engine initialized"
        );

        Ok(Self {
            core,
            window,
            links,
            voice: VoiceNoteRecorder::new(storage, voice_device),
            video_pipeline: Mutex::new(Some(video_pipeline)),
            audio_pipeline: Mutex::new(None),
            audio_factory: Mutex::new(audio),
            audio_config: config.audio,
            audio_stopped_at: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    /// Enable buffering and start audio capture. Calling it again while
    /// capturing is a no-op. Audio start failures are logged and capture
    /// continues video-only.
    pub fn start_capture(&self) -> RewindResult<()> {
        self.ensure_running()?;
        if std::mem::replace(&mut *write(&self.core.capturing), true) {
            return Ok(());
        }
        self.start_audio();
        tracing::info!("Capture enabled");
        Ok(())
    }

    /// Disable buffering, stop audio and clear both buffers. With `flush`,
    /// a clip in progress is finished first; without it, the clip stays
    /// open and resumes when capture is enabled again.
    pub fn stop_capture(&self, flush: bool) {
        if flush {
            if let Some(path) = self.core.finalize_and_dispatch() {
                tracing::info!(path = %path.display(), "Flushed clip on capture stop");
            }
        }
        let was_capturing = {
            let mut capturing = write(&self.core.capturing);
            // Nothing checked before the flip can be appended after the clear.
            self.core.video.buffer().clear();
            self.core.audio.buffer().clear();
            std::mem::replace(&mut *capturing, false)
        };
        self.stop_audio();
        self.core.audio.reset();
        if was_capturing {
            tracing::info!(flush, "Capture disabled");
        }
    }

    /// Request a clip around now. Overrides replace the default window for
    /// this clip only.
    pub fn request_clip(
        &self,
        pre_roll_override_us: Option<i64>,
        post_roll_override_us: Option<i64>,
    ) -> RewindResult<ClipTicket> {
        let result = self.try_request_clip(pre_roll_override_us, post_roll_override_us);
        match &result {
            Ok(ticket) => tracing::info!(
                clip = %ticket.clip_base,
                target_end_ms = ticket.target_end_pts_us / 1_000,
                "Clip request accepted"
            ),
            Err(RewindError::Rejected(reason)) => {
                tracing::warn!(%reason, "Clip request rejected")
            }
            Err(e) => tracing::error!(error = %e, "Clip request failed"),
        }
        result
    }

    fn try_request_clip(&self, pre: Option<i64>, post: Option<i64>) -> RewindResult<ClipTicket> {
        self.ensure_running()?;
        if self.core.assembler.is_saving() {
            return Err(RejectReason::AlreadySaving.into());
        }
        if !self.is_capturing() {
            return Err(RejectReason::CaptureDisabled.into());
        }
        self.core.assembler.begin(self.window.resolve(pre, post))
    }

    /// Change the default window for future clips.
    pub fn set_window(&self, pre_ms: u64, post_ms: u64) -> CaptureWindow {
        self.window.set_window(pre_ms, post_ms)
    }

    pub fn window(&self) -> CaptureWindow {
        self.window.window()
    }

    /// Start a voice note for the clip in progress, else the last clip.
    pub fn start_voice_note(&self) -> RewindResult<VoiceNote> {
        let assembler = &self.core.assembler;
        let clip_base = assembler
            .current_clip_base()
            .or_else(|| assembler.last_clip_base());
        self.voice.start(clip_base)
    }

    pub fn stop_voice_note(&self) -> Option<VoiceNote> {
        self.voice.stop()
    }

    /// Feed clipboard text; a link in it is attached to the next clip.
    pub fn observe_clipboard(&self, text: &str) -> Option<String> {
        self.links.observe_text(text)
    }

    pub fn is_saving(&self) -> bool {
        self.core.assembler.is_saving()
    }

    pub fn is_capturing(&self) -> bool {
        *read(&self.core.capturing)
    }

    pub fn status(&self) -> EngineStatus {
        let assembler = &self.core.assembler;
        let video_running = lock(&self.video_pipeline)
            .as_ref()
            .is_some_and(VideoCapturePipeline::is_running);
        let audio_running = lock(&self.audio_pipeline)
            .as_ref()
            .is_some_and(AudioCapturePipeline::is_running);

        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            capturing: self.is_capturing(),
            state: assembler.state(),
            current_clip: assembler.current_clip_base(),
            last_clip: assembler.last_clip_base(),
            window: self.window.window(),
            video: stream_status(&self.core.video, video_running),
            audio: stream_status(&self.core.audio, audio_running),
            voice_note: self.voice.current_file(),
        }
    }

    /// Finish any clip, stop every pipeline and drop buffered media.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = self.core.finalize_and_dispatch() {
            tracing::info!(path = %path.display(), "Flushed clip on shutdown");
        }
        self.voice.stop();
        *write(&self.core.capturing) = false;
        self.stop_audio();

        let video = lock(&self.video_pipeline).take();
        if let Some(mut pipeline) = video {
            pipeline.stop();
        }

        self.core.video.reset();
        self.core.audio.reset();
        tracing::info!("Clip capture engine shut down");
    }

    fn ensure_running(&self) -> RewindResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RejectReason::NotRunning.into())
        }
    }

    fn start_audio(&self) {
        let Some(config) = self.audio_config.clone() else {
            return;
        };
        let mut slot = lock(&self.audio_pipeline);
        if slot.as_ref().is_some_and(AudioCapturePipeline::is_running) {
            return;
        }
        // A pipeline that died on its own still has threads to join.
        if let Some(mut dead) = slot.take() {
            dead.stop();
        }

        let components = match lock(&self.audio_factory).as_mut() {
            Some(factory) => factory(),
            None => return,
        };
        let start_pts_us = self.audio_resume_pts();
        let sink: Arc<dyn FrameSink> = self.core.clone();
        match components.and_then(|c| AudioCapturePipeline::start_at(c, config, start_pts_us, sink)) {
            Ok(pipeline) => *slot = Some(pipeline),
            Err(e) => tracing::warn!(error = %e, "Audio capture unavailable; clips will be muted"),
        }
    }

    fn stop_audio(&self) {
        let pipeline = lock(&self.audio_pipeline).take();
        if let Some(mut pipeline) = pipeline {
            pipeline.stop();
            *lock(&self.audio_stopped_at) = Some(Instant::now());
        }
    }

    /// First timestamp for a new audio pipeline. Audio time carries on past
    /// the last buffered frame by however long audio was off, so a clip
    /// left open across a pause keeps a monotonic audio track.
    fn audio_resume_pts(&self) -> i64 {
        let Some(last_us) = self.core.audio.last_pts() else {
            return 0;
        };
        let paused_us = lock(&self.audio_stopped_at)
            .take()
            .map_or(0, |at| i64::try_from(at.elapsed().as_micros()).unwrap_or(i64::MAX));
        last_us.saturating_add(paused_us.max(1))
    }
}

impl Drop for ClipCaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stream_status(stream: &StreamState, pipeline_running: bool) -> StreamStatus {
    StreamStatus {
        format_known: stream.format().is_some(),
        pipeline_running,
        buffered_frames: stream.buffer().len(),
        buffered_span_ms: stream.buffer().span_us() / 1_000,
        stats: stream.stats(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}
