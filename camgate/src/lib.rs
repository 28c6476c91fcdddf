//! camgate library crate.
//!
//! A local gateway that exposes Digest-protected IP cameras and a backend
//! event stream to browsers over plain HTTP: an MJPEG relay, a supervised
//! ffmpeg RTSP-to-MPEG-TS relay, and an SSE fan-out proxy.

pub mod api;
pub mod config;
pub mod error;
pub mod relay;
pub mod transcoder;

pub use error::{Error, Result};
