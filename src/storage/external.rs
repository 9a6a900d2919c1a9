//! Reference to an external etcd cluster.
//!
//! Nothing is started or dialed; the selected address is handed to the
//! components as-is.

use crate::core::config::DEFAULT_EXTERNAL_ENDPOINT;
use crate::storage::endpoint::StorageEndpoint;

/// External etcd endpoint selected from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalStore {
    endpoint: StorageEndpoint,
}

impl ExternalStore {
    /// Use the first configured server, or the local default.
    pub fn new(servers: &[String]) -> Self {
        let address = servers
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_EXTERNAL_ENDPOINT);
        if servers.len() > 1 {
            tracing::debug!(
                selected = address,
                configured = servers.len(),
                "using first external etcd endpoint"
            );
        }
        Self {
            endpoint: StorageEndpoint::network(address),
        }
    }

    pub fn endpoint(&self) -> &StorageEndpoint {
        &self.endpoint
    }
}
