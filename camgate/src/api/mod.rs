//! HTTP surface of the gateway: router, multi-port server, and the
//! proxy route handlers.

pub mod error;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, GatewayServer};
