use std::fmt;

use thiserror::Error;

use crate::source::ImageSourceCandidate;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ViewerError {
    #[error("Frame index {index} is out of range (frame count {frame_count})")]
    IndexOutOfRange { index: usize, frame_count: usize },

    #[error(
        "Corrupt frame buffer {width}x{height} with {total_samples} samples: {reason}"
    )]
    CorruptBuffer {
        width: usize,
        height: usize,
        total_samples: usize,
        reason: String,
    },

    #[error("No renderable source for study {study} ({} candidates tried)", .attempts.len())]
    NoRenderableSource {
        study: String,
        attempts: Vec<FailedAttempt>,
    },

    #[error("Export is not allowed: {0}")]
    ExportRestricted(String),

    #[error("No frame is displayed")]
    NoFrameDisplayed,

    #[error("Could not encode export: {0}")]
    ExportFailed(String),

    #[error("Discarded response for token {token} (expecting {expected:?})")]
    StaleResponse { token: u64, expected: Option<u64> },
}

impl ViewerError {
    /// Failures the operator can recover from by re-running resolution.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ViewerError::NoRenderableSource { .. })
    }

    pub fn attempts(&self) -> &[FailedAttempt] {
        match self {
            ViewerError::NoRenderableSource { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// Failure of a single candidate attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("not found")]
    NotFound,
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("timed out")]
    Timeout,
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt {
    pub candidate: ImageSourceCandidate,
    pub error: FetchError,
}

impl fmt::Display for FailedAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.candidate, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CandidateKind;

    #[test]
    fn corrupt_buffer_message_names_buffer_size() {
        let err = ViewerError::CorruptBuffer {
            width: 4,
            height: 4,
            total_samples: 17,
            reason: "sample count is not a multiple of the frame size".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("4x4"));
        assert!(text.contains("17"));
    }

    #[test]
    fn only_missing_source_is_retryable() {
        let missing = ViewerError::NoRenderableSource {
            study: "CT-1".to_string(),
            attempts: vec![FailedAttempt {
                candidate: ImageSourceCandidate::new(
                    CandidateKind::Processed,
                    "processed/a/frame_0000.png",
                    None,
                ),
                error: FetchError::NotFound,
            }],
        };
        assert!(missing.is_retryable());
        assert_eq!(missing.attempts().len(), 1);
        assert!(missing.to_string().contains("1 candidates"));

        let out_of_range = ViewerError::IndexOutOfRange {
            index: 3,
            frame_count: 2,
        };
        assert!(!out_of_range.is_retryable());
        assert!(out_of_range.attempts().is_empty());
    }
}
