//! Backgate - a single-backend gateway that supervises its upstream
//!
//! At startup the gateway:
//! - Terminates stale backend processes left over from earlier runs
//! - Spawns the backend HTTP server in its own process group
//! - Polls until the backend answers HTTP, or gives up and runs degraded
//!
//! Afterwards every inbound request is forwarded to the backend over a
//! pooled loopback connection and the response is relayed back.

pub mod config;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod pool;
pub mod proxy;
pub mod supervisor;

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
