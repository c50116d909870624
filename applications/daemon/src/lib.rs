//! SoulSpot Daemon Library
//!
//! Configuration, tracing setup and lifecycle of the SoulSpot background
//! daemon. The `soulspot` binary is a thin CLI over this crate.

pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use config::SoulSpotConfig;
pub use daemon::{Daemon, DaemonBuilder, DaemonStats};
pub use error::{DaemonError, Result};
