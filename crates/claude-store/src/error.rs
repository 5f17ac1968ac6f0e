//! Error types for store operations

/// Errors from persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("account {0} has an empty access or refresh token")]
    EmptyToken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("legacy accounts file parse error: {0}")]
    LegacyParse(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
