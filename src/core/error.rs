//! Error types.
//!
//! Startup errors follow a fixed taxonomy: configuration, filesystem, storage
//! start and component start. All of them are fatal for the process. Storage
//! request errors carry etcd's canonical messages so that clients of the
//! embedded endpoint see the same strings a real etcd would return.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::lifecycle::LifecycleState;

/// Errors raised by the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Deployment mode is neither `single` nor `ha`.
    #[error("invalid server mode '{value}': must be 'single' or 'ha'")]
    InvalidMode { value: String },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Directory preparation failed.
    #[error("failed to create directory {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The storage backend could not be started.
    #[error("failed to start storage: {0}")]
    Storage(#[from] StorageError),

    /// A component failed to start.
    #[error("failed to start components: {0}")]
    Component(#[from] ComponentError),

    /// The lifecycle state machine refused a transition.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Errors raised by a control-plane component.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("{component} failed to start: {reason}")]
    StartFailed {
        component: &'static str,
        reason: String,
    },

    #[error("{component} failed to stop: {reason}")]
    StopFailed {
        component: &'static str,
        reason: String,
    },
}

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite returned an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// Filesystem error on a storage path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The embedded listener could not bind its socket.
    #[error("failed to listen on {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The gRPC server on the embedded socket failed.
    #[error("embedded endpoint transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The requested revision is below the compaction floor.
    #[error("etcdserver: mvcc: required revision has been compacted")]
    Compacted { revision: i64, compact_revision: i64 },

    /// The requested revision is above the current revision.
    #[error("etcdserver: mvcc: required revision is a future revision")]
    FutureRevision { revision: i64, current_revision: i64 },

    /// The lease does not exist or has expired.
    #[error("etcdserver: requested lease not found")]
    LeaseNotFound { lease_id: i64 },

    /// A lease with the requested id already exists.
    #[error("etcdserver: lease already exists")]
    LeaseExists { lease_id: i64 },

    /// `ignore_value`/`ignore_lease` on a key that does not exist.
    #[error("etcdserver: key not found")]
    KeyNotFound,

    /// Malformed request.
    #[error("{message}")]
    InvalidRequest { message: String },

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {message}")]
    Task { message: String },
}

impl StorageError {
    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Check whether a client may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Task { .. })
            || matches!(
                self,
                Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy
                        || e.code == rusqlite::ErrorCode::DatabaseLocked
            )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for lifecycle operations.
pub type ServerResult<T> = Result<T, ServerError>;
