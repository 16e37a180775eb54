//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory where clips and voice notes are stored.
    pub clips_dir: PathBuf,

    /// Ring buffer and capture window settings.
    pub capture: CaptureDefaults,

    /// Audio capture settings.
    pub audio: AudioDefaults,

    /// Hand-off to the analysis worker.
    pub analysis: AnalysisConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Video capture and ring buffer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureDefaults {
    /// How much encoded history each ring buffer keeps.
    pub buffer_capacity_ms: u64,

    /// Default pre-roll for clip requests.
    pub pre_roll_ms: u64,

    /// Default post-roll for clip requests.
    pub post_roll_ms: u64,

    /// Target frame rate.
    pub fps: u32,

    /// Video bitrate in kbit/s.
    pub bitrate_kbps: u32,

    /// Seconds between forced key frames.
    pub keyframe_interval_secs: u32,
}

/// Audio capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDefaults {
    /// Whether to capture audio at all.
    pub enabled: bool,

    /// Audio codec: "opus", or "pcm" for raw S16LE.
    pub codec: String,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count.
    pub channels: u16,

    /// Sample frames read from the device per chunk.
    pub chunk_frames: usize,

    /// Chunks the capture thread may queue ahead of the encoder.
    pub queue_capacity: usize,
}

/// Analysis dispatch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Delay between clip finalization and dispatch.
    pub dispatch_delay_ms: u64,

    /// JSONL job queue consumed by the analysis worker. Log only when unset.
    pub queue_file: Option<PathBuf>,

    /// Clipboard links older than this are not attached to a clip.
    pub link_max_age_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "rewind=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clips_dir: dirs_default_clips(),
            capture: CaptureDefaults::default(),
            audio: AudioDefaults::default(),
            analysis: AnalysisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            buffer_capacity_ms: 10_000,
            pre_roll_ms: 5_000,
            post_roll_ms: 5_000,
            fps: 30,
            bitrate_kbps: 4_000,
            keyframe_interval_secs: 1,
        }
    }
}

impl Default for AudioDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: "opus".to_string(),
            sample_rate: 44_100,
            channels: 1,
            chunk_frames: 2_048,
            queue_capacity: 64,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            dispatch_delay_ms: 3_000,
            queue_file: None,
            link_max_age_secs: 180,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<PathBuf, std::io::Error> {
        let config_path = config_file_path();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Save config to an explicit path.
    pub fn save_to(&self, config_path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("rewind").join("config.json")
}

/// Default clip directory.
fn dirs_default_clips() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local").join("share")
        });
    base.join("rewind").join("clips")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.json"));
        assert_eq!(config.capture.buffer_capacity_ms, 10_000);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.analysis.link_max_age_secs, 180);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "capture": { "pre_roll_ms": 3000 } }"#).unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.capture.pre_roll_ms, 3_000);
        assert_eq!(config.capture.post_roll_ms, 5_000);
        assert!(config.audio.enabled);
    }

    #[test]
    fn test_unparsable_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.capture.fps, 30);
    }

    #[test]
    fn test_save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.capture.post_roll_ms = 7_000;
        config.analysis.queue_file = Some(PathBuf::from("/tmp/jobs.jsonl"));
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.capture.post_roll_ms, 7_000);
        assert_eq!(
            loaded.analysis.queue_file,
            Some(PathBuf::from("/tmp/jobs.jsonl"))
        );
    }
}
