//! Error types for the sync layer.

use thiserror::Error;

/// Errors that can occur while fetching, mutating or streaming dashboard data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Authentication failed, or credentials were still stale after the
    /// single transparent refresh.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Server accepted the request but answered with a bare message where an
    /// entity was expected.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Entity not found.
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: i64 },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket error on the push channel.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The operation was superseded by a newer one against the same target.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error (cache mirror).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// A superseded request. Never surfaced, never rolled back.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Stale credentials. Eligible for exactly one refresh-and-retry.
    pub fn is_auth_expiry(&self) -> bool {
        match self {
            SyncError::Api { status, message } => {
                *status == 401 || message.contains("token_expired")
            }
            _ => false,
        }
    }

    /// Server-side hiccup worth retrying for idempotent reads.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Api { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
