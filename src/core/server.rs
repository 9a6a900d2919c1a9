//! Server lifecycle orchestration.
//!
//! Start order: directories → storage → components (API server, controller
//! manager, scheduler, kubelet, kube-proxy). Shutdown runs in reverse:
//! components → storage → tracked tasks.

use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::components::{default_components, Component, ComponentContext, TaskSet};
use crate::core::config::{Config, DeploymentMode, StorageConfig};
use crate::core::error::{ServerError, ServerResult};
use crate::core::lifecycle::{Lifecycle, LifecycleState};
use crate::storage::{select_backend, StorageEndpoint, StorageHandle};

/// Permissions for directories the server creates.
const DIR_MODE: u32 = 0o755;

/// Bound on waiting for tracked tasks during shutdown.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests shutdown of a running server from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the server to shut down.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// The kubelite server process.
pub struct Server {
    config: Config,
    storage_config: StorageConfig,
    lifecycle: Lifecycle,
    components: Vec<Box<dyn Component>>,
    /// Number of components (from the front) whose start succeeded.
    started: usize,
    storage: Option<StorageHandle>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: TaskSet,
}

impl Server {
    /// Create a server. Validates configuration; touches nothing on disk.
    pub fn new(config: Config) -> ServerResult<Self> {
        config.validate()?;
        let storage_config = config.storage_config()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            storage_config,
            lifecycle: Lifecycle::new(),
            components: default_components(),
            started: 0,
            storage: None,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            tasks: TaskSet::default(),
        })
    }

    /// Replace the component set.
    pub fn with_components(mut self, components: Vec<Box<dyn Component>>) -> Self {
        self.components = components;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> DeploymentMode {
        self.storage_config.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Storage endpoint, once storage has started and until it stops.
    pub fn storage_endpoint(&self) -> Option<&StorageEndpoint> {
        self.storage
            .as_ref()
            .filter(|handle| !handle.is_stopped())
            .map(StorageHandle::endpoint)
    }

    /// Handle for requesting shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Request shutdown; `run` returns after teardown completes.
    pub fn request_shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Number of tracked background tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Start storage and components.
    ///
    /// Any failure tears down whatever already started and is returned.
    pub async fn start(&mut self) -> ServerResult<()> {
        let state = self.lifecycle.state();
        if state != LifecycleState::Initializing {
            return Err(ServerError::InvalidTransition {
                from: state,
                to: LifecycleState::StorageStarting,
            });
        }

        let build = crate::core::version::get();
        tracing::info!(
            version = %build.git_version,
            k8s_version = %build.k8s_version,
            mode = %self.storage_config.mode,
            data_dir = %self.storage_config.data_dir.display(),
            "starting kubelite"
        );

        if let Err(e) = self.start_stages().await {
            tracing::error!(state = %self.lifecycle.state(), error = %e, "startup failed");
            self.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            storage = %self.storage_endpoint().map(ToString::to_string).unwrap_or_default(),
            "kubelite running"
        );
        Ok(())
    }

    async fn start_stages(&mut self) -> ServerResult<()> {
        self.prepare_directories()?;

        self.lifecycle.advance(LifecycleState::StorageStarting)?;
        self.start_storage().await?;

        self.lifecycle.advance(LifecycleState::ComponentsStarting)?;
        self.start_components()?;

        self.lifecycle.advance(LifecycleState::Running)?;
        Ok(())
    }

    /// Create the data directory and, in single mode, the database directories.
    fn prepare_directories(&self) -> ServerResult<()> {
        let data_dir = &self.storage_config.data_dir;
        create_dir(data_dir)?;

        if self.storage_config.mode == DeploymentMode::Single {
            create_dir(&data_dir.join(crate::storage::embedded::DATABASE_DIR))?;
            if let Some(parent) = self
                .storage_config
                .sqlite_path
                .as_deref()
                .and_then(Path::parent)
                .filter(|p| !p.as_os_str().is_empty())
            {
                create_dir(parent)?;
            }
        }

        tracing::debug!(data_dir = %data_dir.display(), "directories prepared");
        Ok(())
    }

    async fn start_storage(&mut self) -> ServerResult<()> {
        let backend = select_backend(&self.storage_config);
        tracing::debug!(backend = backend.kind(), "starting storage");
        let handle = backend.start().await?;
        tracing::info!(endpoint = %handle.endpoint(), "storage started");
        self.storage = Some(handle);
        Ok(())
    }

    fn start_components(&mut self) -> ServerResult<()> {
        let Some(endpoint) = self.storage_endpoint().cloned() else {
            return Err(ServerError::InvalidConfig {
                message: "storage endpoint unavailable".to_string(),
            });
        };
        let ctx = ComponentContext::new(
            endpoint,
            self.storage_config.data_dir.clone(),
            self.storage_config.mode,
            self.shutdown_rx.clone(),
            Arc::clone(&self.tasks),
        );

        for component in &mut self.components {
            component.start(&ctx)?;
            self.started += 1;
        }
        Ok(())
    }

    /// Start, wait for SIGINT/SIGTERM or a shutdown request, then shut down.
    pub async fn run(&mut self) -> ServerResult<()> {
        self.start().await?;
        self.wait_for_termination().await;
        self.shutdown().await;
        Ok(())
    }

    async fn wait_for_termination(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = interrupt => tracing::warn!("shutdown signal received (SIGINT)"),
            _ = terminate => tracing::warn!("shutdown signal received (SIGTERM)"),
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                tracing::info!("shutdown requested by component");
            }
        }
    }

    /// Tear everything down in reverse start order. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if self.lifecycle.state().is_terminating() {
            tracing::debug!(state = %self.lifecycle.state(), "shutdown already done");
            return;
        }
        if let Err(e) = self.lifecycle.advance(LifecycleState::ShuttingDown) {
            tracing::warn!(error = %e, "unexpected lifecycle state during shutdown");
        }
        tracing::info!("stopping kubelite");
        self.shutdown_tx.send_replace(true);

        for component in self.components[..self.started].iter_mut().rev() {
            if let Err(e) = component.stop() {
                tracing::warn!(component = component.name(), error = %e, "component stop failed");
            }
        }
        self.started = 0;

        if let Some(mut storage) = self.storage.take() {
            storage.stop().await;
        }

        self.drain_tasks().await;

        if let Err(e) = self.lifecycle.advance(LifecycleState::Stopped) {
            tracing::warn!(error = %e, "unexpected lifecycle state during shutdown");
        }
        tracing::info!("kubelite stopped");
    }

    async fn drain_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + TASK_DRAIN_TIMEOUT;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("background task did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

fn create_dir(path: &Path) -> ServerResult<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|source| ServerError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ComponentError;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn config(mode: &str, dir: &Path) -> Config {
        let mut config = Config::default();
        config.server.mode = mode.to_string();
        config.server.data_dir = dir.display().to_string();
        config
    }

    /// Records start/stop calls into a shared journal.
    struct Recording {
        name: &'static str,
        fail_start: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Component for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start(&mut self, _ctx: &ComponentContext) -> Result<(), ComponentError> {
            if self.fail_start {
                return Err(ComponentError::StartFailed {
                    component: self.name,
                    reason: "boom".to_string(),
                });
            }
            self.journal.lock().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop(&mut self) -> Result<(), ComponentError> {
            self.journal.lock().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    fn recording(
        names: &[(&'static str, bool)],
        journal: &Arc<Mutex<Vec<String>>>,
    ) -> Vec<Box<dyn Component>> {
        names
            .iter()
            .map(|&(name, fail_start)| {
                Box::new(Recording {
                    name,
                    fail_start,
                    journal: Arc::clone(journal),
                }) as Box<dyn Component>
            })
            .collect()
    }

    #[test]
    fn test_invalid_mode_fails_before_side_effects() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let result = Server::new(config("bogus", &data));
        assert!(matches!(result, Err(ServerError::InvalidMode { .. })));
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn test_components_stop_in_reverse() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut server = Server::new(config("ha", dir.path()))
            .unwrap()
            .with_components(recording(&[("a", false), ("b", false)], &journal));

        server.start().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        server.shutdown().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(
            *journal.lock(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
    }

    #[tokio::test]
    async fn test_component_failure_aborts_later_starts() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut server = Server::new(config("single", dir.path()))
            .unwrap()
            .with_components(recording(
                &[("a", false), ("b", true), ("c", false)],
                &journal,
            ));

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Component(_)));
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(*journal.lock(), vec!["start a", "stop a"]);
        assert!(!dir.path().join("kine.sock").exists());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new(config("ha", dir.path())).unwrap();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::InvalidTransition { .. })
        ));
        assert_eq!(server.state(), LifecycleState::Running);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new(config("single", dir.path())).unwrap();
        server.shutdown().await;
        server.shutdown().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(server.storage_endpoint().is_none());
    }
}
