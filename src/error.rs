//! Error types shared across the engine, the store and the external clients.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a language model provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate limit, overload or server fault. Worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider refused to generate for this prompt.
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    /// Anything else: malformed response, empty output, bad request.
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Per-recipient delivery failures reported by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target thread could not be resolved to a reachable peer.
    #[error("target {0} could not be resolved")]
    Unresolvable(i64),

    /// Blocked by the user or no write permission in the chat.
    #[error("delivery forbidden: {0}")]
    Forbidden(String),

    /// The transport asked us to wait before sending again.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    /// The transport did not answer in time.
    #[error("transport request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Other(String),
}

/// Errors from the conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The persisted document exists but cannot be parsed.
    #[error("corrupt conversation document {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("failed to serialize conversation {0}: {1}")]
    Serialize(i64, #[source] serde_json::Error),
}
