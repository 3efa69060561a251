//! Transfer error taxonomy shared by workers, the chunk coordinator, and the
//! scheduler facade.
//!
//! Every failure a worker unit can report is one of these variants, so higher
//! layers can decide retries without string matching. `Canceled` always wins
//! over any other concurrently-determined outcome for the same task.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified transfer failure. Carried inside `Failed` status updates and
/// persisted with them, so the payloads are plain data (no source chaining).
/// Adjacent tagging: internal tagging cannot represent the string-carrying
/// variants.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransferError {
    /// Connection-level failure: DNS, connect, reset, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx, non-404 HTTP response.
    #[error("HTTP {code}")]
    HttpStatus { code: u32, body: Option<String> },

    /// HTTP 404: a distinguished terminal outcome, not a generic failure.
    #[error("resource not found")]
    NotFound,

    /// Disk failure: create/write/rename, or a missing chunk file at stitch time.
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// Probe response unusable for chunking (no Content-Length or no byte
    /// ranges). A task-shape error, never retried.
    #[error("chunking precondition failed: {0}")]
    ChunkingPrecondition(String),

    /// Cooperative cancellation.
    #[error("canceled by request")]
    Canceled,

    /// Unexpected coordinator-side failure (worker panic, join error).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Whether a task or chunk failing with this error may be re-admitted
    /// (subject to its remaining retry budget).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Network(_) | TransferError::HttpStatus { .. }
        )
    }

    /// Convenience constructor for IO failures.
    pub fn filesystem(e: &std::io::Error) -> Self {
        TransferError::Filesystem(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_http_are_retryable() {
        assert!(TransferError::Network("reset".into()).is_retryable());
        assert!(TransferError::HttpStatus { code: 503, body: None }.is_retryable());
    }

    #[test]
    fn shape_errors_are_not_retryable() {
        assert!(!TransferError::NotFound.is_retryable());
        assert!(!TransferError::ChunkingPrecondition("no ranges".into()).is_retryable());
        assert!(!TransferError::Filesystem("missing".into()).is_retryable());
        assert!(!TransferError::Canceled.is_retryable());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let e = TransferError::HttpStatus { code: 500, body: Some("oops".into()) };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\""));
        let back: TransferError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn string_variants_roundtrip() {
        for e in [
            TransferError::Network("connection reset".into()),
            TransferError::Filesystem("disk full".into()),
            TransferError::ChunkingPrecondition("no ranges".into()),
            TransferError::Internal("join error".into()),
            TransferError::NotFound,
            TransferError::Canceled,
        ] {
            let json = serde_json::to_string(&e).unwrap();
            let back: TransferError = serde_json::from_str(&json).unwrap();
            assert_eq!(back, e);
        }
    }
}
