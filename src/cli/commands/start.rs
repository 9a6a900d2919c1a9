//! Start command implementation.

use anyhow::{Context, Result};

use crate::cli::Cli;
use crate::core::config::{resolve_log_level, Config};
use crate::core::server::Server;
use crate::core::version::BuildInfo;

/// Initialize the tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` takes precedence over `level` when set.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let (resolved, known) = resolve_log_level(level);
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(resolved).into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();

    if !known {
        tracing::warn!(level, "unknown log level, using info");
    }
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(level: &str) {
    let _ = resolve_log_level(level);
}

/// Startup banner.
pub fn banner(info: &BuildInfo, mode: &str) -> String {
    format!(
        "kubelite {} (kubernetes {}, {} mode)\n{}",
        info.git_version, info.k8s_version, mode, info
    )
}

/// Merge the config file (when present) with command-line overrides.
///
/// File read and parse errors already name the file; validation errors
/// may come from a flag, so they carry no path.
pub fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(&cli.config, &cli.overrides()).context("failed to load configuration")
}

/// Load configuration, then run the server until a termination signal.
pub async fn run_start(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    init_tracing(&config.server.log_level);

    let mut server = Server::new(config).context("invalid configuration")?;
    println!("{}", banner(crate::core::version::get(), server.mode().as_str()));

    server.run().await.context("server failed")
}
