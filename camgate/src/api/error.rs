//! API error handling.
//!
//! The gateway's consumers are `<img>`/`<video>` tags and curl, so failed
//! requests answer with a plain-text body rather than a JSON envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::Error;

/// API error type that converts to a plain-text HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 502 Bad Gateway error.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::Configuration(_) => Self::internal(error.to_string()),
            Error::NoDigestChallenge | Error::Challenge(_) | Error::UpstreamStatus { .. } => {
                Self::bad_gateway(error.to_string())
            }
            Error::Http(_) => Self::bad_gateway(error.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}
