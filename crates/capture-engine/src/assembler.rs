//! Clip save transactions.
//!
//! A save starts on the control thread: both ring buffers are
//! snapshotted, a container is opened and the pre-roll is written. From
//! then on the pipeline threads feed live frames through
//! [`ClipAssembler::write_frame`] until a video frame reaches the post-roll
//! deadline, at which point the file is finished on that thread.
//!
//! All container access goes through the session mutex. Callers must not
//! hold a ring buffer lock while calling in here.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use rewind_common::clock::StreamOffset;
use rewind_common::error::{RejectReason, RewindResult};

use crate::container::{ContainerFactory, ContainerWriter, Sample, TrackHandle};
use crate::frame::{EncodedFrame, StreamFormat, StreamKind};
use crate::storage::{remove_partial, ClipStorage};
use crate::stream::StreamState;
use crate::window::CaptureWindow;

/// Audio/video base offsets above this are logged as a warning.
const OFFSET_WARN_MS: f64 = 100.0;

/// State of the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblerState {
    /// No save in progress.
    Idle,
    /// A clip is being written.
    Saving,
}

/// Returned when a clip request is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct ClipTicket {
    pub clip_base: String,
    pub path: PathBuf,
    /// Window resolved for this clip; later window changes do not apply.
    pub window: CaptureWindow,
    /// Video PTS at which the clip is finished.
    pub target_end_pts_us: i64,
    /// Pre-roll actually written: from the first key frame inside the
    /// window to the trigger. Never more than the requested pre-roll.
    pub realized_pre_roll_us: i64,
    pub has_audio: bool,
}

/// A finished clip file.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedClip {
    pub clip_base: String,
    pub path: PathBuf,
    /// Distance from clip start to the trigger instant.
    pub realized_pre_roll_us: i64,
    /// Timestamp of the last written video sample.
    pub duration_us: i64,
    pub has_audio: bool,
    pub video_samples: u64,
    pub audio_samples: u64,
}

/// Per-track write position: each track is rebased to its own first
/// written frame.
#[derive(Debug)]
struct TrackCursor {
    kind: StreamKind,
    handle: TrackHandle,
    base_pts_us: Option<i64>,
    last_source_pts_us: Option<i64>,
    last_written_us: i64,
    written: u64,
}

impl TrackCursor {
    fn new(kind: StreamKind, handle: TrackHandle) -> Self {
        Self {
            kind,
            handle,
            base_pts_us: None,
            last_source_pts_us: None,
            last_written_us: 0,
            written: 0,
        }
    }

    /// Write a frame, rebased. Frames at or before the last written one
    /// are skipped, as are video delta frames before the first key frame.
    fn write(&mut self, writer: &mut dyn ContainerWriter, frame: &EncodedFrame) -> RewindResult<bool> {
        if self.last_source_pts_us.is_some_and(|last| frame.pts_us() <= last) {
            return Ok(false);
        }
        if self.written == 0 && self.kind == StreamKind::Video && !frame.is_key_frame() {
            return Ok(false);
        }

        let base = *self.base_pts_us.get_or_insert(frame.pts_us());
        let pts_us = (frame.pts_us() - base).max(0);
        writer.write_sample(
            self.handle,
            Sample {
                data: frame.bytes().clone(),
                pts_us,
                key_frame: frame.is_key_frame(),
            },
        )?;

        self.last_source_pts_us = Some(frame.pts_us());
        self.last_written_us = pts_us;
        self.written += 1;
        Ok(true)
    }
}

/// One in-flight save.
struct ClipSession {
    clip_base: String,
    path: PathBuf,
    writer: Box<dyn ContainerWriter>,
    video: TrackCursor,
    audio: Option<TrackCursor>,
    target_end_pts_us: i64,
    realized_pre_roll_us: i64,
}

impl ClipSession {
    fn write(&mut self, frame: &EncodedFrame) -> RewindResult<bool> {
        let cursor = match frame.kind() {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => match self.audio.as_mut() {
                Some(cursor) => cursor,
                None => return Ok(false),
            },
        };
        cursor.write(self.writer.as_mut(), frame)
    }

    fn reached_deadline(&self, frame: &EncodedFrame) -> bool {
        frame.kind() == StreamKind::Video && frame.pts_us() >= self.target_end_pts_us
    }
}

/// Owns the save transaction for the engine.
pub struct ClipAssembler {
    video: Arc<StreamState>,
    audio: Arc<StreamState>,
    containers: Arc<dyn ContainerFactory>,
    storage: ClipStorage,
    session: Mutex<Option<ClipSession>>,
    last_clip: Mutex<Option<String>>,
}

impl ClipAssembler {
    pub fn new(
        video: Arc<StreamState>,
        audio: Arc<StreamState>,
        containers: Arc<dyn ContainerFactory>,
        storage: ClipStorage,
    ) -> Self {
        Self {
            video,
            audio,
            containers,
            storage,
            session: Mutex::new(None),
            last_clip: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> &ClipStorage {
        &self.storage
    }

    pub fn state(&self) -> AssemblerState {
        if self.lock_session().is_some() {
            AssemblerState::Saving
        } else {
            AssemblerState::Idle
        }
    }

    pub fn is_saving(&self) -> bool {
        self.state() == AssemblerState::Saving
    }

    /// Base name of the clip being written, if any.
    pub fn current_clip_base(&self) -> Option<String> {
        self.lock_session().as_ref().map(|s| s.clip_base.clone())
    }

    /// Base name of the most recently finished clip.
    pub fn last_clip_base(&self) -> Option<String> {
        self.lock_last_clip().clone()
    }

    /// Start saving a clip: snapshot the buffers, open the container and
    /// write the pre-roll.
    ///
    /// Rejected without side effects when a save is already running or the
    /// video format is not known yet. If the container cannot be opened or
    /// the pre-roll cannot be written, the partial file is removed and the
    /// assembler stays idle.
    pub fn begin(&self, window: CaptureWindow) -> RewindResult<ClipTicket> {
        let mut slot = self.lock_session();
        if slot.is_some() {
            return Err(RejectReason::AlreadySaving.into());
        }
        let video_format = self.video.format().ok_or(RejectReason::FormatUnknown)?;
        let audio_format = self.audio.format();

        let video_frames = self.video.buffer().snapshot(window.pre_roll_us);
        let audio_frames = match audio_format {
            Some(_) => self.audio.buffer().snapshot(window.pre_roll_us),
            None => Vec::new(),
        };

        let latest_us = video_frames
            .last()
            .map(EncodedFrame::pts_us)
            .or_else(|| self.video.last_pts())
            .unwrap_or(0);
        let target_end_pts_us = latest_us.saturating_add(window.post_roll_us);

        let (clip_base, path) = self.storage.next_clip_path(self.containers.extension())?;
        let mut writer = self.containers.open(&path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to open clip container");
            remove_partial(&path);
            e
        })?;

        let prepared = prepare_tracks(writer.as_mut(), &video_format, audio_format.as_ref())
            .and_then(|(mut video, mut audio)| {
                write_pre_roll(writer.as_mut(), &mut video, audio.as_mut(), &video_frames, &audio_frames)?;
                Ok((video, audio))
            });
        let (video, audio) = match prepared {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to start clip; discarding");
                release_quietly(writer.as_mut());
                remove_partial(&path);
                return Err(e);
            }
        };

        // Leading delta frames of the snapshot are not written, so the clip
        // starts at the first key frame inside the window.
        let realized_pre_roll_us = video.base_pts_us.map_or(0, |first| latest_us - first);

        if audio.is_none() {
            tracing::warn!(clip = %clip_base, "No audio format known; clip will be muted");
        }
        if let (Some(video_base), Some(audio_base)) = (
            video.base_pts_us,
            audio.as_ref().and_then(|a| a.base_pts_us),
        ) {
            let offset = StreamOffset {
                reference_us: video_base,
                measured_us: audio_base,
            };
            if offset.exceeds_threshold_ms(OFFSET_WARN_MS) {
                tracing::warn!(
                    clip = %clip_base,
                    offset_ms = offset.offset_ms(),
                    "Audio and video pre-roll start apart; tracks are rebased independently"
                );
            } else {
                tracing::debug!(clip = %clip_base, offset_ms = offset.offset_ms(), "Track base offset");
            }
        }

        let ticket = ClipTicket {
            clip_base: clip_base.clone(),
            path: path.clone(),
            window,
            target_end_pts_us,
            realized_pre_roll_us,
            has_audio: audio.is_some(),
        };
        tracing::info!(
            clip = %clip_base,
            pre_roll_ms = window.pre_roll_ms(),
            post_roll_ms = window.post_roll_ms(),
            realized_pre_roll_ms = realized_pre_roll_us / 1_000,
            video_frames = video.written,
            audio_frames = audio.as_ref().map_or(0, |a| a.written),
            "Clip save started"
        );

        *slot = Some(ClipSession {
            clip_base,
            path,
            writer,
            video,
            audio,
            target_end_pts_us,
            realized_pre_roll_us,
        });
        Ok(ticket)
    }

    /// Write a live frame to the clip in progress. Returns the finished
    /// clip when this frame completed it.
    ///
    /// A write error aborts the save: the partial file is removed and the
    /// assembler goes back to idle.
    pub fn write_frame(&self, frame: &EncodedFrame) -> Option<FinishedClip> {
        let mut slot = self.lock_session();
        let session = slot.as_mut()?;

        if let Err(e) = session.write(frame) {
            tracing::error!(
                clip = %session.clip_base,
                stream = %frame.kind(),
                error = %e,
                "Failed to write frame; aborting clip"
            );
            if let Some(session) = slot.take() {
                abort(session);
            }
            return None;
        }

        if session.reached_deadline(frame) {
            return slot.take().map(|session| self.finish(session));
        }
        None
    }

    /// Finish the clip in progress now, whatever its deadline.
    pub fn finalize(&self) -> Option<FinishedClip> {
        let mut slot = self.lock_session();
        slot.take().map(|session| self.finish(session))
    }

    fn finish(&self, session: ClipSession) -> FinishedClip {
        let ClipSession {
            clip_base,
            path,
            mut writer,
            video,
            audio,
            realized_pre_roll_us,
            ..
        } = session;

        // Each step runs even if the other failed.
        if let Err(e) = writer.stop() {
            tracing::warn!(clip = %clip_base, error = %e, "Failed to stop container writer");
        }
        if let Err(e) = writer.release() {
            tracing::warn!(clip = %clip_base, error = %e, "Failed to release container writer");
        }

        *self.lock_last_clip() = Some(clip_base.clone());

        let finished = FinishedClip {
            clip_base,
            path,
            realized_pre_roll_us,
            duration_us: video.last_written_us,
            has_audio: audio.is_some(),
            video_samples: video.written,
            audio_samples: audio.as_ref().map_or(0, |a| a.written),
        };
        tracing::info!(
            clip = %finished.clip_base,
            path = %finished.path.display(),
            duration_ms = finished.duration_us / 1_000,
            video_samples = finished.video_samples,
            audio_samples = finished.audio_samples,
            "Clip saved"
        );
        finished
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ClipSession>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_last_clip(&self) -> MutexGuard<'_, Option<String>> {
        self.last_clip.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn prepare_tracks(
    writer: &mut dyn ContainerWriter,
    video_format: &StreamFormat,
    audio_format: Option<&StreamFormat>,
) -> RewindResult<(TrackCursor, Option<TrackCursor>)> {
    let video = TrackCursor::new(StreamKind::Video, writer.add_track(video_format)?);
    let audio = match audio_format {
        Some(format) => Some(TrackCursor::new(StreamKind::Audio, writer.add_track(format)?)),
        None => None,
    };
    writer.start()?;
    Ok((video, audio))
}

/// Write both snapshots, interleaved by source timestamp.
fn write_pre_roll(
    writer: &mut dyn ContainerWriter,
    video: &mut TrackCursor,
    mut audio: Option<&mut TrackCursor>,
    video_frames: &[EncodedFrame],
    audio_frames: &[EncodedFrame],
) -> RewindResult<()> {
    let mut v = video_frames.iter().peekable();
    let mut a = audio_frames.iter().peekable();
    loop {
        let take_video = match (v.peek(), a.peek()) {
            (Some(vf), Some(af)) => vf.pts_us() <= af.pts_us(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return Ok(()),
        };
        if take_video {
            if let Some(frame) = v.next() {
                video.write(writer, frame)?;
            }
        } else if let Some(frame) = a.next() {
            if let Some(cursor) = audio.as_deref_mut() {
                cursor.write(writer, frame)?;
            }
        }
    }
}

fn abort(session: ClipSession) {
    let ClipSession {
        clip_base,
        path,
        mut writer,
        ..
    } = session;
    release_quietly(writer.as_mut());
    remove_partial(&path);
    tracing::warn!(clip = %clip_base, "Clip aborted");
}

fn release_quietly(writer: &mut dyn ContainerWriter) {
    if let Err(e) = writer.release() {
        tracing::warn!(error = %e, "Failed to release container writer");
    }
}

impl std::fmt::Debug for ClipAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipAssembler")
            .field("state", &self.state())
            .field("last_clip", &self.last_clip_base())
            .finish()
    }
}
