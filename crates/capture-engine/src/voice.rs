//! Voice notes: audio-only recordings attached to a clip by name.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use rewind_common::error::{RewindError, RewindResult};

use crate::pipeline::CapturePipeline;
use crate::storage::{remove_partial, ClipStorage};

/// Opens a recording device writing to the given file.
pub type VoiceDeviceFactory =
    Box<dyn Fn(&Path) -> RewindResult<Box<dyn CapturePipeline>> + Send + Sync>;

/// A voice note file and the clip it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceNote {
    pub path: PathBuf,
    pub clip_base: String,
}

struct ActiveNote {
    note: VoiceNote,
    device: Box<dyn CapturePipeline>,
}

/// Records at most one voice note at a time.
pub struct VoiceNoteRecorder {
    storage: ClipStorage,
    open_device: VoiceDeviceFactory,
    active: Mutex<Option<ActiveNote>>,
}

impl VoiceNoteRecorder {
    pub fn new(storage: ClipStorage, open_device: VoiceDeviceFactory) -> Self {
        Self {
            storage,
            open_device,
            active: Mutex::new(None),
        }
    }

    /// Start recording a note for `clip_base`, or for the newest clip on
    /// disk when no base is given. Returns the note already being recorded
    /// if there is one.
    pub fn start(&self, clip_base: Option<String>) -> RewindResult<VoiceNote> {
        let mut active = self.lock();
        if let Some(current) = active.as_ref() {
            tracing::debug!(path = %current.note.path.display(), "Voice note already recording");
            return Ok(current.note.clone());
        }

        let clip_base = clip_base
            .or_else(|| self.storage.latest_clip_base())
            .ok_or(RewindError::NoAssociatedClip)?;
        let path = self.storage.voice_note_path(&clip_base)?;

        let mut device = (self.open_device)(&path).map_err(|e| {
            tracing::error!(error = %e, "Failed to open voice note device");
            e
        })?;
        if let Err(e) = device.start() {
            tracing::error!(path = %path.display(), error = %e, "Failed to start voice note");
            if let Err(release) = device.release() {
                tracing::warn!(error = %release, "Failed to release voice note device");
            }
            remove_partial(&path);
            return Err(e);
        }

        tracing::info!(clip = %clip_base, path = %path.display(), "Voice note started");
        let note = VoiceNote { path, clip_base };
        *active = Some(ActiveNote {
            note: note.clone(),
            device,
        });
        Ok(note)
    }

    /// Stop the current note. Device errors are logged; there is nothing
    /// the caller could do about them.
    pub fn stop(&self) -> Option<VoiceNote> {
        let ActiveNote { note, mut device } = self.lock().take()?;

        if let Err(e) = device.stop() {
            tracing::warn!(path = %note.path.display(), error = %e, "Failed to stop voice note device");
        }
        if let Err(e) = device.release() {
            tracing::warn!(path = %note.path.display(), error = %e, "Failed to release voice note device");
        }
        tracing::info!(path = %note.path.display(), "Voice note saved");
        Some(note)
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|a| a.note.path.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveNote>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for VoiceNoteRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}
