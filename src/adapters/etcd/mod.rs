//! etcd v3 gRPC adapter for the embedded store.
//!
//! Serves the subset of the etcd v3 API that Kubernetes control-plane
//! components use, backed by the SQLite MVCC log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 etcd v3 gRPC (unix socket)                  │
//! ├─────────────┬─────────────┬─────────────┬───────────────────┤
//! │   KV API    │  Watch API  │  Lease API  │    Maintenance    │
//! │  Range/Put  │   Create    │   Grant     │      Status       │
//! │ Delete/Txn  │   Cancel    │   Revoke    │                   │
//! │   Compact   │   Progress  │  KeepAlive  │                   │
//! └─────────────┴─────────────┴─────────────┴───────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SqliteStore (MVCC log)                      │
//! │  writes wake the watch poller; sweeper expires leases;      │
//! │  compactor trims history                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`proto`] - Wire types with etcd field tags
//! - [`kv`] - Range, Put, DeleteRange, Txn and Compact
//! - [`txn`] - Compare evaluation and branch execution
//! - [`watch`] - Log poller and per-stream watch state
//! - [`lease`] - Lease grant, revoke, keepalive and expiry sweep
//! - [`maintenance`] - Status reporting
//! - [`grpc`] - tonic service wrappers and the unix-socket server
//! - [`errors`] - Error mapping to gRPC status codes

pub mod errors;
pub mod grpc;
pub mod kv;
pub mod lease;
pub mod maintenance;
pub mod proto;
pub mod txn;
pub mod watch;

use std::sync::Arc;
use tokio::sync::{broadcast, watch as shutdown, Notify};

use crate::core::config::EmbeddedConfig;
use crate::core::error::{StorageError, StorageResult};
use crate::storage::sqlite::{KvRecord, LogEvent, SqliteStore};

pub use errors::{grpc_code, to_status};
pub use grpc::serve_unix;
pub use kv::KvService;
pub use lease::LeaseService;
pub use maintenance::MaintenanceService;
pub use watch::{WatchHub, WatchService};

/// Cluster id reported in every response header.
pub const CLUSTER_ID: u64 = 1;
/// Member id reported in every response header.
pub const MEMBER_ID: u64 = 1;
/// Raft term reported in every response header.
pub const RAFT_TERM: u64 = 1;

/// Capacity of the event fan-out channel shared by watch streams.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared state for the gRPC services.
#[derive(Clone)]
pub struct SharedState {
    /// MVCC store.
    pub store: Arc<SqliteStore>,
    /// Wakes the watch poller after a committed write.
    pub writes: Arc<Notify>,
    /// Batches of log events published by the poller.
    pub events: broadcast::Sender<Arc<Vec<LogEvent>>>,
    /// Embedded store tuning.
    pub settings: Arc<EmbeddedConfig>,
    /// Shutdown signal receiver.
    pub shutdown_rx: shutdown::Receiver<bool>,
}

impl SharedState {
    /// Create shared state around an opened store.
    pub fn new(
        store: SqliteStore,
        settings: EmbeddedConfig,
        shutdown_rx: shutdown::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: Arc::new(store),
            writes: Arc::new(Notify::new()),
            events,
            settings: Arc::new(settings),
            shutdown_rx,
        }
    }

    /// Create a response header at `revision`.
    pub fn header(&self, revision: i64) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: CLUSTER_ID,
            member_id: MEMBER_ID,
            revision,
            raft_term: RAFT_TERM,
        }
    }

    /// Signal the watch poller that new log entries exist.
    pub fn wake_watchers(&self) {
        self.writes.notify_one();
    }

    /// Resolves once shutdown is signalled.
    pub async fn shutdown_requested(&self) {
        wait_for_shutdown(self.shutdown_rx.clone()).await;
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Run a store call on the blocking pool.
pub async fn run_blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task {
            message: e.to_string(),
        })?
}

/// Resolves once `true` is sent or the sender is dropped.
pub async fn wait_for_shutdown(mut shutdown_rx: shutdown::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Convert a stored record into its wire form.
pub fn to_key_value(record: KvRecord) -> proto::KeyValue {
    proto::KeyValue {
        key: record.key,
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        version: record.version,
        value: record.value,
        lease: record.lease,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Keeps the temporary directory and the shutdown sender alive.
    pub struct Fixture {
        _dir: TempDir,
        pub shutdown_tx: shutdown::Sender<bool>,
    }

    /// Shared state over a fresh store in a temporary directory.
    pub fn shared_state() -> (Fixture, SharedState) {
        let dir = TempDir::new().unwrap();
        let settings = EmbeddedConfig::default();
        let store = SqliteStore::open(&dir.path().join("state.db"), &settings).unwrap();
        let (shutdown_tx, shutdown_rx) = shutdown::channel(false);
        (
            Fixture {
                _dir: dir,
                shutdown_tx,
            },
            SharedState::new(store, settings, shutdown_rx),
        )
    }
}
