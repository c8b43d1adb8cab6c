//! HTTP API gateway for the Cubicle sandbox control plane.
//!
//! Exposes per-owner VM lifecycle endpoints (create, list, inspect, rename,
//! start/stop, delete) on top of [`cubicle_runtime::VmOrchestrator`]. Callers
//! are identified by the `x-owner-id` header set by an upstream auth layer.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod routes;
pub mod server;

pub use config::{GatewayConfig, RuntimeConfig};
pub use error::{GatewayError, StartupError};
pub use routes::create_router;
pub use server::serve;
