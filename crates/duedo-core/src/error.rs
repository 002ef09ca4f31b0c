//! Error types shared by the store client and the reminder scheduler.

/// Failure reported by a [`crate::store::TaskStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The store rejected the session (HTTP 401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No row matched the id, or the row is not visible to this user.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The payload was rejected before or by the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Any other non-success response.
    #[error("store returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded into task rows.
    #[error("failed to decode store response: {0}")]
    Decode(String),

    /// Local file store I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// A reminder could not be armed or removed.
///
/// Never escapes [`crate::reminder::ReminderScheduler::schedule`]; it is
/// logged there and degraded to "no reminder".
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("reminder spool error: {0}")]
    Spool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode reminder: {0}")]
    Serialize(#[from] serde_json::Error),
}
