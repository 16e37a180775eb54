//! Error types shared across Rewind crates.

use std::path::PathBuf;

/// Why a clip request was turned away without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("a clip is already being saved")]
    AlreadySaving,

    #[error("capture is disabled")]
    CaptureDisabled,

    #[error("video encoder has not reported an output format yet")]
    FormatUnknown,

    #[error("engine is not running")]
    NotRunning,
}

/// Top-level error type for Rewind operations.
#[derive(Debug, thiserror::Error)]
pub enum RewindError {
    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("Encoder error: {message}")]
    Encoder { message: String },

    #[error("Container error: {message}")]
    Container { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Clip request rejected: {0}")]
    Rejected(RejectReason),

    #[error("No clip to associate the voice note with")]
    NoAssociatedClip,

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using RewindError.
pub type RewindResult<T> = Result<T, RewindError>;

impl RewindError {
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture {
            message: msg.into(),
        }
    }

    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder {
            message: msg.into(),
        }
    }

    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// The rejection reason, if this error is a synchronous rejection.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<RejectReason> for RewindError {
    fn from(reason: RejectReason) -> Self {
        Self::Rejected(reason)
    }
}
