//! HTTP Digest Access Authentication for IP camera firmware.
//!
//! Implements the RFC 2617 "auth" quality-of-protection handshake with the
//! MD5 algorithm: challenge parsing from a `WWW-Authenticate` header,
//! response computation, and `Authorization` header rendering.
//!
//! The MD5 core is implemented in-tree (see [`md5`]) because the cameras
//! mandate MD5 Digest; no general cryptographic strength is claimed.

pub mod challenge;
pub mod md5;
pub mod response;

pub use challenge::{ChallengeError, DigestChallenge};
pub use md5::{md5, md5_hex};
pub use response::{DigestResponse, NONCE_COUNT};
