//! Error types for the backend seam and the conversation core.

/// Failure of a call into the backend collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Non-2xx HTTP response.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    /// Connection, TLS or protocol failure below HTTP.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    /// Response body did not match the expected shape.
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    /// The call did not resolve within the configured bound.
    #[error("request timed out")]
    Timeout,
    /// The backend refused the call (closed, injected failure, missing session).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Realtime socket failure.
    #[error("realtime: {0}")]
    Realtime(String),
}

/// Error kinds surfaced by the message synchronizer and conversation list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("remote failure: {0}")]
    RemoteFailure(String),
    #[error("message content is empty")]
    ValidationFailure,
}

impl SyncError {
    /// Text shown inline and in toasts. Never includes backend internals.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::AuthenticationRequired => "Authentication required".to_string(),
            SyncError::InvalidIdentifier(_) => "Invalid user ID format".to_string(),
            SyncError::RemoteFailure(_) => "Something went wrong. Please try again".to_string(),
            SyncError::ValidationFailure => "Message cannot be empty".to_string(),
        }
    }
}

impl From<BackendError> for SyncError {
    fn from(e: BackendError) -> Self {
        SyncError::RemoteFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_become_remote_failures() {
        let err: SyncError = BackendError::Http {
            status: 503,
            body: "down".into(),
        }
        .into();
        assert_eq!(err, SyncError::RemoteFailure("http 503: down".into()));
        assert_eq!(err.user_message(), "Something went wrong. Please try again");
    }

    #[test]
    fn user_messages_do_not_leak_identifiers() {
        let err = SyncError::InvalidIdentifier("abc".into());
        assert!(!err.user_message().contains("abc"));
    }
}
