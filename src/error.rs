use std::time::Duration;

use thiserror::Error;

use crate::events::Endpoint;

/// Library error type for local library operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The configured library directory is missing or not a directory.
    #[error("invalid library directory: {0}")]
    BadDir(String),

    /// The scan completed but found no media.
    #[error("no media found in configured library")]
    EmptyScan,

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),
}

/// Failure of a single fetch against the asset source or content fetcher.
///
/// These never abort a pipeline: the prefetch queue drops the asset and moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The fetch was cancelled by a reset or teardown. Never user-visible.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Session-level failure of a video playback attempt.
///
/// `Display` is the text surfaced to the consumer as the error message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("could not verify the {endpoint} stream: {reason}")]
    VerificationFailed { endpoint: Endpoint, reason: String },

    #[error("the {endpoint} stream is not playable")]
    NotPlayable { endpoint: Endpoint },

    #[error("could not load the {endpoint} stream: {reason}")]
    LoadFailed { endpoint: Endpoint, reason: String },

    #[error("buffering stalled after {checks} checks without progress")]
    StallTimeout { checks: u32 },

    #[error("timed out after {}s waiting for the stream to start", .0.as_secs())]
    ConnectionTimeout(Duration),

    #[error("playback error: {0}")]
    Playback(String),
}

impl SessionError {
    /// Heuristic for failures worth offering a direct fallback retry for.
    pub fn is_auth_related(&self) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        ["401", "403", "unauthorized", "forbidden", "auth"]
            .iter()
            .any(|needle| text.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_heuristic_matches_status_codes() {
        let err = SessionError::VerificationFailed {
            endpoint: Endpoint::Primary,
            reason: "HTTP 401".into(),
        };
        assert!(err.is_auth_related());
        assert!(!SessionError::StallTimeout { checks: 5 }.is_auth_related());
    }

    #[test]
    fn timeout_message_is_human_readable() {
        let msg = SessionError::ConnectionTimeout(Duration::from_secs(30)).to_string();
        assert_eq!(msg, "timed out after 30s waiting for the stream to start");
    }
}
