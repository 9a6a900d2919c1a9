//! Embedded etcd-compatible store.
//!
//! Opens the SQLite database, then runs the etcd gRPC endpoint on a unix
//! socket inside one spawned task. `start()` returns once that task reports
//! the socket bound, so the published endpoint is dial-able immediately.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::adapters::etcd::grpc::bind_unix;
use crate::adapters::etcd::{run_blocking, serve_unix, SharedState};
use crate::core::config::StorageConfig;
use crate::core::error::{StorageError, StorageResult};
use crate::storage::endpoint::StorageEndpoint;
use crate::storage::sqlite::SqliteStore;

/// Socket file name under the data directory.
pub const SOCKET_FILE: &str = "kine.sock";

/// Database location under the data directory.
pub const DATABASE_DIR: &str = "db";
pub const DATABASE_FILE: &str = "state.db";

/// Bound on waiting for the listener task during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed etcd endpoint on a unix socket.
#[derive(Debug)]
pub struct EmbeddedStore {
    config: StorageConfig,
    endpoint: Option<StorageEndpoint>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<StorageResult<()>>>,
}

impl EmbeddedStore {
    /// Create an unstarted store.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            endpoint: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Database file: the explicit path if configured, else `<data>/db/state.db`.
    pub fn database_path(&self) -> PathBuf {
        self.config.sqlite_path.clone().unwrap_or_else(|| {
            self.config
                .data_dir
                .join(DATABASE_DIR)
                .join(DATABASE_FILE)
        })
    }

    /// Socket file the endpoint listens on.
    pub fn socket_path(&self) -> PathBuf {
        self.config.data_dir.join(SOCKET_FILE)
    }

    /// Published endpoint; `None` until started.
    pub fn endpoint(&self) -> Option<&StorageEndpoint> {
        self.endpoint.as_ref()
    }

    /// Check whether the listener task is running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Open the database and start serving.
    pub async fn start(&mut self) -> StorageResult<StorageEndpoint> {
        if let Some(endpoint) = self.endpoint.clone().filter(|_| self.task.is_some()) {
            return Ok(endpoint);
        }

        let db_path = self.database_path();
        let socket_path = self.socket_path();
        let settings = self.config.embedded.clone();

        tracing::info!(
            database = %db_path.display(),
            socket = %socket_path.display(),
            "starting embedded store"
        );

        let open_settings = settings.clone();
        let store = run_blocking(move || SqliteStore::open(&db_path, &open_settings)).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = SharedState::new(store, settings, shutdown_rx);
        let (ready_tx, ready_rx) = oneshot::channel();

        let listen_path = socket_path.clone();
        let task = tokio::spawn(async move {
            let listener = match bind_unix(&listen_path) {
                Ok(listener) => {
                    let _ = ready_tx.send(Ok(()));
                    listener
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return Ok(());
                }
            };
            serve_unix(state, listener, listen_path).await
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = task.await;
                return Err(e);
            }
            Err(_) => {
                let message = match task.await {
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                    Ok(Ok(())) => "listener exited before becoming ready".to_string(),
                };
                return Err(StorageError::Task { message });
            }
        }

        let endpoint = StorageEndpoint::unix(&socket_path);
        tracing::info!(endpoint = %endpoint, "embedded store ready");
        self.endpoint = Some(endpoint.clone());
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(endpoint)
    }

    /// Stop serving and wait for the listener task. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(Ok(()))) => tracing::info!("embedded store stopped"),
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "embedded store stopped with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "embedded store task panicked"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = STOP_TIMEOUT.as_secs(),
                    "embedded store stop timed out, aborting"
                );
                task.abort();
                let _ = task.await;
            }
        }

        let socket_path = self.socket_path();
        if let Err(e) = std::fs::remove_file(&socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(socket = %socket_path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}
