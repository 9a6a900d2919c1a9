//! Storage layer.
//!
//! The deployment mode picks the backend: single-node servers run the
//! embedded SQLite store behind an etcd-compatible unix socket, HA servers
//! point at an external etcd cluster.
//!
//! # Modules
//!
//! - [`sqlite`] - MVCC key-value log on SQLite
//! - [`compaction`] - Periodic history compaction
//! - [`embedded`] - Embedded store lifecycle
//! - [`external`] - External etcd reference
//! - [`endpoint`] - Endpoint descriptor handed to components

pub mod compaction;
pub mod embedded;
pub mod endpoint;
pub mod external;
pub mod sqlite;

pub use compaction::CompactionPolicy;
pub use embedded::EmbeddedStore;
pub use endpoint::{EndpointScheme, StorageEndpoint};
pub use external::ExternalStore;
pub use sqlite::SqliteStore;

use crate::core::config::{DeploymentMode, StorageConfig};
use crate::core::error::StorageResult;

/// A constructed, not yet started storage backend.
#[derive(Debug)]
pub enum StorageBackend {
    Embedded(EmbeddedStore),
    External(ExternalStore),
}

/// Pick the backend for the configured mode. No side effects.
pub fn select_backend(config: &StorageConfig) -> StorageBackend {
    match config.mode {
        DeploymentMode::Single => StorageBackend::Embedded(EmbeddedStore::new(config.clone())),
        DeploymentMode::Ha => StorageBackend::External(ExternalStore::new(&config.etcd_servers)),
    }
}

impl StorageBackend {
    /// Short backend name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Embedded(_) => "embedded",
            Self::External(_) => "external",
        }
    }

    /// Start the backend and publish its endpoint.
    pub async fn start(self) -> StorageResult<StorageHandle> {
        match self {
            Self::Embedded(mut store) => {
                let endpoint = store.start().await?;
                Ok(StorageHandle {
                    endpoint,
                    backend: Some(Self::Embedded(store)),
                })
            }
            Self::External(store) => {
                tracing::info!(endpoint = %store.endpoint(), "using external etcd");
                Ok(StorageHandle {
                    endpoint: store.endpoint().clone(),
                    backend: Some(Self::External(store)),
                })
            }
        }
    }
}

/// A started backend: its endpoint plus the means to stop it.
#[derive(Debug)]
pub struct StorageHandle {
    endpoint: StorageEndpoint,
    backend: Option<StorageBackend>,
}

impl StorageHandle {
    /// Endpoint components connect to.
    pub fn endpoint(&self) -> &StorageEndpoint {
        &self.endpoint
    }

    /// Check whether `stop` has run.
    pub fn is_stopped(&self) -> bool {
        self.backend.is_none()
    }

    /// Stop the backend. Later calls do nothing.
    pub async fn stop(&mut self) {
        match self.backend.take() {
            Some(StorageBackend::Embedded(mut store)) => store.stop().await,
            Some(StorageBackend::External(_)) => {
                tracing::debug!(endpoint = %self.endpoint, "released external etcd endpoint");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_selector_follows_mode() {
        let single = StorageConfig::new(DeploymentMode::Single, "/tmp/unused");
        assert_eq!(select_backend(&single).kind(), "embedded");

        let ha = StorageConfig::new(DeploymentMode::Ha, "/tmp/unused");
        assert_eq!(select_backend(&ha).kind(), "external");
    }

    #[test]
    fn test_selector_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(DeploymentMode::Single, dir.path().join("data"));
        let _ = select_backend(&config);
        assert!(!dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_external_handle_stops_once() {
        let mut config = StorageConfig::new(DeploymentMode::Ha, "/tmp/unused");
        config.etcd_servers = vec!["http://10.1.1.1:2379".to_string()];
        let mut handle = select_backend(&config).start().await.unwrap();
        assert_eq!(handle.endpoint().to_string(), "http://10.1.1.1:2379");

        handle.stop().await;
        assert!(handle.is_stopped());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_embedded_handle_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(DeploymentMode::Single, dir.path());
        let mut handle = select_backend(&config).start().await.unwrap();
        assert_eq!(handle.endpoint().scheme(), EndpointScheme::Unix);
        handle.stop().await;
        handle.stop().await;
        assert!(!dir.path().join("kine.sock").exists());
    }
}
