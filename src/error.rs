//! Error taxonomy shared across the crate.
//!
//! The ingestion consumer keys its retry/dead-letter decisions off
//! [`TidepoolError::is_retryable`]: transient I/O and resource exhaustion
//! are retried with backoff, everything else either surfaces to the caller
//! (synchronous tag/user/access operations) or goes straight to the
//! dead-letter topic (permanent content failures).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TidepoolError {
    /// Bad input shape. Surfaced to the caller immediately, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing tag, user, or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// Hierarchy cycle, duplicate tag id, or in-use deletion.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage, broker, or database failure (including timeouts).
    /// Retried per the broker policy, eventually dead-lettered.
    #[error("transient i/o error: {0}")]
    TransientIo(String),

    /// Memory headroom threshold breached during extraction.
    /// Retried with backoff like transient I/O.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Unparseable or corrupt file content. Retrying cannot help, so the
    /// message is dead-lettered without exhausting the retry budget.
    #[error("permanent content error: {0}")]
    PermanentContent(String),
}

impl TidepoolError {
    /// Whether the broker retry policy applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TidepoolError::TransientIo(_) | TidepoolError::ResourceExhaustion(_)
        )
    }
}

impl From<sqlx::Error> for TidepoolError {
    fn from(e: sqlx::Error) -> Self {
        TidepoolError::TransientIo(format!("database: {e}"))
    }
}

impl From<std::io::Error> for TidepoolError {
    fn from(e: std::io::Error) -> Self {
        TidepoolError::TransientIo(format!("io: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, TidepoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TidepoolError::TransientIo("timeout".into()).is_retryable());
        assert!(TidepoolError::ResourceExhaustion("oom".into()).is_retryable());
        assert!(!TidepoolError::Validation("bad".into()).is_retryable());
        assert!(!TidepoolError::Conflict("cycle".into()).is_retryable());
        assert!(!TidepoolError::PermanentContent("corrupt".into()).is_retryable());
    }
}
