//! Storage endpoint descriptor.

use std::fmt;
use std::path::{Path, PathBuf};

/// Addressing scheme of a storage endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointScheme {
    /// Filesystem socket of the embedded store.
    Unix,
    /// Network address of an external etcd member.
    Network,
}

/// The endpoint every control-plane component uses to reach storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageEndpoint {
    scheme: EndpointScheme,
    address: String,
}

impl StorageEndpoint {
    /// Endpoint for a unix socket at `path`.
    pub fn unix(path: &Path) -> Self {
        Self {
            scheme: EndpointScheme::Unix,
            address: path.display().to_string(),
        }
    }

    /// Endpoint for a network address, kept verbatim.
    pub fn network(address: impl Into<String>) -> Self {
        Self {
            scheme: EndpointScheme::Network,
            address: address.into(),
        }
    }

    /// Addressing scheme.
    pub fn scheme(&self) -> EndpointScheme {
        self.scheme
    }

    /// Socket path or network address, without scheme prefix.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Socket path for unix endpoints.
    pub fn socket_path(&self) -> Option<PathBuf> {
        match self.scheme {
            EndpointScheme::Unix => Some(PathBuf::from(&self.address)),
            EndpointScheme::Network => None,
        }
    }
}

impl fmt::Display for StorageEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            EndpointScheme::Unix => write!(f, "unix://{}", self.address),
            EndpointScheme::Network => f.write_str(&self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_endpoint_renders_with_scheme() {
        let endpoint = StorageEndpoint::unix(Path::new("/var/lib/k8s/kine.sock"));
        assert_eq!(endpoint.to_string(), "unix:///var/lib/k8s/kine.sock");
        assert_eq!(endpoint.scheme(), EndpointScheme::Unix);
        assert_eq!(
            endpoint.socket_path(),
            Some(PathBuf::from("/var/lib/k8s/kine.sock"))
        );
    }

    #[test]
    fn network_endpoint_is_verbatim() {
        let endpoint = StorageEndpoint::network("http://10.0.0.5:2379");
        assert_eq!(endpoint.to_string(), "http://10.0.0.5:2379");
        assert_eq!(endpoint.socket_path(), None);
    }
}
