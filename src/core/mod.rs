//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`server`] - Server lifecycle orchestration
//! - [`lifecycle`] - Lifecycle state machine
//! - [`version`] - Build information
//! - [`time`] - Wall-clock helpers
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod server;
pub mod time;
pub mod version;
