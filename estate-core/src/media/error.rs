use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::browser::AutomationError;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no frames to assemble")]
    NoFrames,
    #[error("frames span multiple sessions: {0:?}")]
    MixedSessions(Vec<String>),
    #[error("duplicate frame sequence number {0}")]
    DuplicateSequence(u64),
    #[error("malformed frame {path}: {reason}")]
    MalformedFrame { path: PathBuf, reason: String },
    #[error("screenshot capture failed: {0}")]
    Capture(#[from] AutomationError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("video encoder '{0}' is not available")]
    EncoderUnavailable(String),
    #[error("video encoder exited with {status}: {stderr}")]
    EncoderFailed { status: String, stderr: String },
    #[error("video encoder timed out after {0:?}")]
    EncoderTimeout(Duration),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MediaError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MediaError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<MediaError> for AutomationError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::Capture(inner) => inner,
            MediaError::Io { source, .. } => AutomationError::Io(source),
            MediaError::EncoderTimeout(limit) => {
                AutomationError::Timeout(format!("video encoder after {limit:?}"))
            }
            other => AutomationError::Encoder(other.to_string()),
        }
    }
}
