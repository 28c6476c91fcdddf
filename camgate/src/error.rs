//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no Digest challenge from camera")]
    NoDigestChallenge,

    #[error("Digest challenge error: {0}")]
    Challenge(#[from] digest_auth::ChallengeError),

    #[error("camera returned HTTP {status}")]
    UpstreamStatus { status: reqwest::StatusCode },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
