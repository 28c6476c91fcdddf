//! External transcoder supervision: command construction, per-camera session
//! registry, spawn/probe/fallback logic, and teardown.

pub mod command;
pub mod supervisor;

pub use command::{build_args, redact, resolve_binary};
pub use supervisor::{
    FfmpegSpawner, MediaSpawner, TS_CHUNK_SIZE, TranscoderSupervisor,
};
