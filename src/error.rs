//! Error taxonomy for the sync core.
//!
//! Two layers:
//! - [`BackendError`]: what the remote document service (or its realtime
//!   channel) reported.
//! - [`SyncError`]: what the sync core surfaces to its callers. Only write
//!   failures and explicit lookups reach the UI; transport trouble is absorbed
//!   into [`ConnectionState`](crate::sync::ConnectionState).
//!
//! Both are `Clone` so one in-flight fetch result can be handed to every
//! waiter that joined it.

use std::time::Duration;

/// Failure reported by a [`Backend`](crate::backend::Backend) call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Transport-level failures that the connection manager retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Failure surfaced by the sync core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(BackendError),

    #[error("write failed: {0}")]
    Write(BackendError),

    #[error("message {0} is not in any loaded chat")]
    MessageNotFound(String),

    #[error("invalid channel path: {0}")]
    InvalidChannelPath(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_retryable() {
        let err = BackendError::not_found("messages", "m1");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "document messages/m1 not found");
    }

    #[test]
    fn transport_and_timeout_are_retryable() {
        assert!(BackendError::Transport("reset".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(!BackendError::Unauthorized("expired".into()).is_retryable());
    }

    #[test]
    fn write_error_wraps_backend_message() {
        let err = SyncError::Write(BackendError::Rejected {
            status: 400,
            message: "invalid document".into(),
        });
        assert!(err.to_string().contains("invalid document"));
    }
}
