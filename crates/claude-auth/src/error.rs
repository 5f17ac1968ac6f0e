//! Error types for OAuth token operations

/// Errors from token-endpoint operations.
///
/// The refresh variants carry the retry decision: `RefreshRejected` is
/// terminal (the caller should disable the account), `RefreshTransient`
/// is retryable with backoff.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("token exchange failed ({status}): {body}")]
    ExchangeFailed { status: u16, body: String },

    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    #[error("refresh token rejected ({status}): {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("token refresh failed ({status}): {body}")]
    RefreshTransient { status: u16, body: String },
}

impl Error {
    /// Whether a refresh failure means the refresh token is permanently dead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::RefreshRejected { .. })
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
