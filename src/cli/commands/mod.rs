//! CLI command implementations.

mod start;
mod version;

pub use start::{banner, init_tracing, run_start};
pub use version::run_version;
