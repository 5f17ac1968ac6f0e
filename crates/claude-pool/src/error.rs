//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no eligible account in pool")]
    NoEligibleAccount,

    #[error("account not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] claude_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
