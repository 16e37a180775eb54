//! On-disk layout for clips and voice notes.
//!
//! ```text
//! <root>/
//!   2026-10-17/
//!     video/clip_20261017_142501.mkv
//!     audio/clip_20261017_142501_voice.wav
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use rewind_common::error::RewindResult;

/// Resolves where clips and voice notes are written.
#[derive(Debug, Clone)]
pub struct ClipStorage {
    root: PathBuf,
}

impl ClipStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Today's video directory, created on demand.
    pub fn video_dir(&self) -> RewindResult<PathBuf> {
        self.day_subdir(Local::now(), "video")
    }

    /// Today's audio directory, created on demand.
    pub fn audio_dir(&self) -> RewindResult<PathBuf> {
        self.day_subdir(Local::now(), "audio")
    }

    /// A fresh clip base name and the container path for it.
    ///
    /// Base names are `clip_<YYYYMMDD_HHMMSS>`; a numeric suffix keeps two
    /// clips within the same second apart.
    pub fn next_clip_path(&self, extension: &str) -> RewindResult<(String, PathBuf)> {
        let now = Local::now();
        let dir = self.day_subdir(now, "video")?;
        let stamp = format!("clip_{}", now.format("%Y%m%d_%H%M%S"));

        let mut base = stamp.clone();
        let mut n = 1;
        while dir.join(format!("{base}.{extension}")).exists() {
            base = format!("{stamp}_{n}");
            n += 1;
        }
        let path = dir.join(format!("{base}.{extension}"));
        Ok((base, path))
    }

    /// Path of the voice note attached to a clip base.
    pub fn voice_note_path(&self, clip_base: &str) -> RewindResult<PathBuf> {
        Ok(self.audio_dir()?.join(format!("{clip_base}_voice.wav")))
    }

    /// Base name of the most recently modified clip in today's video
    /// directory.
    pub fn latest_clip_base(&self) -> Option<String> {
        let dir = self
            .root
            .join(Local::now().format("%Y-%m-%d").to_string())
            .join("video");
        let entries = std::fs::read_dir(&dir).ok()?;

        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| {
                let path = entry.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name.starts_with("clip_") && path.extension().is_some()
            })
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .max_by_key(|(modified, _)| *modified)
            .and_then(|(_, path)| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
    }

    fn day_subdir(&self, when: DateTime<Local>, kind: &str) -> RewindResult<PathBuf> {
        let dir = self
            .root
            .join(when.format("%Y-%m-%d").to_string())
            .join(kind);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Remove a file left behind by a failed write. A missing file is fine;
/// other failures are logged.
pub(crate) fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_partial_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_a.mkv");
        std::fs::write(&path, b"partial").unwrap();

        remove_partial(&path);
        assert!(!path.exists());
        remove_partial(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_clip_paths_live_under_dated_video_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ClipStorage::new(dir.path());
        let (base, path) = storage.next_clip_path("mkv").unwrap();

        assert!(base.starts_with("clip_"));
        assert_eq!(path.extension().unwrap(), "mkv");
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "video");
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_same_second_clips_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ClipStorage::new(dir.path());
        let (_, first) = storage.next_clip_path("mkv").unwrap();
        std::fs::write(&first, b"x").unwrap();
        let (second_base, second) = storage.next_clip_path("mkv").unwrap();

        assert_ne!(first, second);
        // Either a suffix was added or the clock moved on to the next second.
        assert!(!second.exists());
        assert!(second_base.starts_with("clip_"));
    }

    #[test]
    fn test_voice_note_named_after_clip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ClipStorage::new(dir.path());
        let path = storage.voice_note_path("clip_20260101_000000").unwrap();
        assert_eq!(
            path.file_name().unwrap(),
            "clip_20260101_000000_voice.wav"
        );
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "audio");
    }

    #[test]
    fn test_latest_clip_base_picks_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ClipStorage::new(dir.path());
        assert_eq!(storage.latest_clip_base(), None);

        let video = storage.video_dir().unwrap();
        std::fs::write(video.join("clip_20260101_000000.mkv"), b"old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::write(video.join("clip_20260101_000100.mkv"), b"new").unwrap();
        std::fs::write(video.join("notes.txt"), b"ignored").unwrap();

        assert_eq!(
            storage.latest_clip_base().as_deref(),
            Some("clip_20260101_000100")
        );
    }
}
