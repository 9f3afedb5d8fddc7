//! Daemon side of the Foundry self-hosted agent: configuration, the
//! control-plane listener and the legacy local endpoint.

pub mod config;
pub mod error;
pub mod listener;
pub mod server;

pub use error::{Error, Result};

/// Agent version, reported at registration and on the status endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
