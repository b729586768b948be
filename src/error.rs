//! Error type shared by the hub, the resolver and the remote helpers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Everything that can go wrong inside the crate.
///
/// "Not found", "hidden by an allow-test" and "path traversal" are not here:
/// resolution reports all three as an absent value.
#[derive(Error, Debug)]
pub enum AfrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("invalid message: expected a JSON object")]
    NotAnObject,

    #[error("can't construct client: incoming signal already cancelled")]
    Cancelled,

    #[error("client transport is closed")]
    ClientClosed,

    #[error("client is not reading: {0} messages pending")]
    ClientStalled(usize),

    #[error("client belongs to a different registry")]
    ForeignClient,

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("\"--port\" is required")]
    MissingPort,

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("non-OK response (code {status}): {body}")]
    Status { status: u16, body: String },
}

impl AfrError {
    /// True for failures caused by a client going away, which are expected
    /// and must not be reported as errors.
    pub fn is_cancel(&self) -> bool {
        match self {
            AfrError::Cancelled | AfrError::ClientClosed => true,
            AfrError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

impl IntoResponse for AfrError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
