//! # Error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the motion confirmation and clip recording core.
#[derive(Debug, Error)]
pub enum ClipError {
    /// Output clip could not be opened.
    #[error("failed to create clip sink {path:?}: {source}")]
    SinkCreationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    /// Writing to an open clip failed. The session has been closed.
    #[error("failed to write to clip sink {path:?}: {source}")]
    SinkWriteFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    /// Frame does not match the dimensions fixed at construction.
    #[error("invalid frame dimensions: expected {expected:?}, got {actual:?}")]
    InvalidFrameDimensions {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// CSV row or snapshot could not be written.
    #[error("event log error: {0}")]
    EventLog(String),
}

impl ClipError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

pub type Result<T, E = ClipError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = ClipError::InvalidFrameDimensions {
            expected: (640, 480),
            actual: (320, 240),
        };
        assert_eq!(
            err.to_string(),
            "invalid frame dimensions: expected (640, 480), got (320, 240)"
        );

        let err = ClipError::config("persistence must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration: persistence must be at least 1"
        );
    }

    #[test]
    fn sink_errors_keep_source() {
        let err = ClipError::SinkCreationFailed {
            path: "motion_clips/motion_x.rawclip".into(),
            source: anyhow::anyhow!("disk full"),
        };
        let source = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(source.as_deref(), Some("disk full"));
    }
}
