//! Common test utilities.
//!
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use kubelite::adapters::etcd::SharedState;
use kubelite::core::config::{Config, EmbeddedConfig};
use kubelite::storage::SqliteStore;
use std::io::Write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::watch;

/// Create a temporary directory for test data.
pub fn temp_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Configuration for `mode` rooted at `data_dir`.
pub fn config_for(mode: &str, data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.mode = mode.to_string();
    config.server.data_dir = data_dir.display().to_string();
    config
}

/// Write `content` to a temporary file with the given suffix.
pub fn write_config(content: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Embedded service state over a fresh database.
pub struct EtcdFixture {
    pub dir: TempDir,
    pub state: SharedState,
    pub shutdown_tx: watch::Sender<bool>,
}

impl EtcdFixture {
    pub fn new() -> Self {
        Self::with_settings(EmbeddedConfig::default())
    }

    pub fn with_settings(settings: EmbeddedConfig) -> Self {
        let dir = temp_test_dir();
        let store = SqliteStore::open(&dir.path().join("state.db"), &settings)
            .expect("Failed to open store");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dir,
            state: SharedState::new(store, settings, shutdown_rx),
            shutdown_tx,
        }
    }
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}
