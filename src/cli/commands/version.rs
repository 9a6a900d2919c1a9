//! Version command implementation.

use anyhow::Result;

use crate::core::version;

/// Print build information.
pub fn run_version() -> Result<()> {
    println!("{}", version::get());
    Ok(())
}
