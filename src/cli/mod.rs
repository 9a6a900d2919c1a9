//! Command-line interface.

pub mod commands;

use clap::Parser;
use std::path::PathBuf;

use crate::core::config::{ConfigOverrides, DEFAULT_CONFIG_PATH};

/// kubelite - lightweight Kubernetes control plane for edge deployments.
#[derive(Parser, Debug)]
#[command(name = "kubelite")]
#[command(author, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// Print version information and exit.
    #[arg(long)]
    pub version: bool,

    /// Configuration file path (YAML, or TOML with a .toml extension).
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Root directory for persisted state.
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Deployment mode: single or ha.
    #[arg(long)]
    pub server_mode: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// SQLite database file for single mode.
    #[arg(long)]
    pub sqlite_path: Option<String>,

    /// Comma-separated external etcd endpoints for HA mode.
    #[arg(long, value_delimiter = ',')]
    pub etcd_servers: Option<Vec<String>>,
}

impl Cli {
    /// Flags that override the config file.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server_mode: self.server_mode.clone(),
            data_dir: self.data_dir.clone(),
            log_level: self.log_level.clone(),
            sqlite_path: self.sqlite_path.clone(),
            etcd_servers: self.etcd_servers.as_ref().map(|servers| {
                servers
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
        }
    }
}
