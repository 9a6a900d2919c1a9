//! kubelite - single-binary Kubernetes control plane.
//!
//! Usage:
//!   kubelite --version
//!   kubelite --server-mode single --data-dir /var/lib/k8s
//!   kubelite --server-mode ha --etcd-servers http://10.0.0.1:2379,http://10.0.0.2:2379

use anyhow::Result;
use clap::Parser;
use kubelite::cli::commands::{run_start, run_version};
use kubelite::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        return run_version();
    }
    run_start(cli).await
}
