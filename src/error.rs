#![forbid(unsafe_code)]

use std::fmt;
use thiserror::Error;

use crate::models::MediaKind;

/// Engine output fragments that mean the source answered with a bot check
/// instead of media.
const CHALLENGE_MARKERS: &[&str] = &["sign in", "not a bot"];

pub type FetchResult<T> = Result<T, FetchError>;

/// The logical operation an orchestrated attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Metadata,
    Video,
    Audio,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Metadata => "metadata",
            Operation::Video => "video download",
            Operation::Audio => "audio download",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MediaKind> for Operation {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => Operation::Video,
            MediaKind::Audio => Operation::Audio,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("source requested verification: {0}")]
    ChallengeDetected(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("{operation} failed for {url}: {reason}")]
    DownloadFailed {
        operation: Operation,
        url: String,
        reason: String,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("job tracker is not running")]
    TrackerClosed,
}

impl FetchError {
    /// Classifies a failure message reported by an extraction engine.
    pub fn from_engine_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_challenge(&message) {
            FetchError::ChallengeDetected(message)
        } else {
            FetchError::ExtractionFailed(message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::ChallengeDetected(_) | FetchError::ExtractionFailed(_)
        )
    }
}

pub fn is_challenge(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CHALLENGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_markers_are_case_insensitive() {
        let err = FetchError::from_engine_message(
            "ERROR: [youtube] abc: Sign in to confirm you're NOT A BOT",
        );
        assert!(matches!(err, FetchError::ChallengeDetected(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_engine_messages_are_extraction_failures() {
        let err = FetchError::from_engine_message("HTTP Error 503: Service Unavailable");
        assert_eq!(
            err,
            FetchError::ExtractionFailed("HTTP Error 503: Service Unavailable".into())
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_input_is_not_retryable() {
        assert!(!FetchError::InvalidInput("nope".into()).is_retryable());
        assert!(!FetchError::NotFound("download x".into()).is_retryable());
    }

    #[test]
    fn download_failed_names_operation_and_url() {
        let err = FetchError::DownloadFailed {
            operation: Operation::from(MediaKind::Audio),
            url: "https://youtu.be/x".into(),
            reason: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "audio download failed for https://youtu.be/x: boom"
        );
    }
}
