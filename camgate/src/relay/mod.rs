//! Byte/line relay primitives shared by all proxied streams.

pub mod pump;

pub use pump::{ClientGone, KeepAlive, PumpEnd, PumpMode, RelaySink, StreamPump};
