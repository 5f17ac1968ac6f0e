//! Service-specific error types and client-facing error bodies

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Rotation proxy errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] claude_store::Error),
}

/// Result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Build the JSON error body every client-visible failure uses:
/// `{"error":{"type":<kind>,"message":<human>}}`.
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
