//! Control-plane components.
//!
//! Every component receives the same [`ComponentContext`] and is started
//! synchronously in a fixed order. The Kubernetes components are not built
//! yet; [`PendingComponent`] stands in for each of them and only records
//! that it is missing.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::DeploymentMode;
use crate::core::error::ComponentError;
use crate::storage::StorageEndpoint;

/// Tasks spawned on behalf of components, drained at shutdown.
pub type TaskSet = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Everything a component may use while running.
#[derive(Debug, Clone)]
pub struct ComponentContext {
    /// Storage endpoint every component talks to.
    pub storage_endpoint: StorageEndpoint,
    /// Root directory for persisted state.
    pub data_dir: PathBuf,
    /// Active deployment mode.
    pub mode: DeploymentMode,
    /// Flips to `true` when the server begins shutting down.
    pub shutdown_rx: watch::Receiver<bool>,
    tasks: TaskSet,
}

impl ComponentContext {
    pub fn new(
        storage_endpoint: StorageEndpoint,
        data_dir: PathBuf,
        mode: DeploymentMode,
        shutdown_rx: watch::Receiver<bool>,
        tasks: TaskSet,
    ) -> Self {
        Self {
            storage_endpoint,
            data_dir,
            mode,
            shutdown_rx,
            tasks,
        }
    }

    /// Spawn a background task the server waits for during shutdown.
    ///
    /// The task should exit once `shutdown_rx` turns `true`.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "spawning component task");
        self.tasks.lock().push(tokio::spawn(future));
    }
}

/// A startable control-plane component.
pub trait Component: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Start the component. Must not block.
    fn start(&mut self, ctx: &ComponentContext) -> Result<(), ComponentError>;

    /// Stop the component.
    fn stop(&mut self) -> Result<(), ComponentError>;
}

/// The Kubernetes components, in start order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    ApiServer,
    ControllerManager,
    Scheduler,
    Kubelet,
    KubeProxy,
}

impl ComponentKind {
    /// All kinds in start order.
    pub const ALL: [ComponentKind; 5] = [
        Self::ApiServer,
        Self::ControllerManager,
        Self::Scheduler,
        Self::Kubelet,
        Self::KubeProxy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiServer => "kube-apiserver",
            Self::ControllerManager => "kube-controller-manager",
            Self::Scheduler => "kube-scheduler",
            Self::Kubelet => "kubelet",
            Self::KubeProxy => "kube-proxy",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placeholder for a component that has no implementation yet.
#[derive(Debug)]
pub struct PendingComponent {
    kind: ComponentKind,
    started: bool,
}

impl PendingComponent {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            started: false,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Component for PendingComponent {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn start(&mut self, ctx: &ComponentContext) -> Result<(), ComponentError> {
        tracing::info!(
            component = self.name(),
            storage = %ctx.storage_endpoint,
            "starting {} (not yet implemented)",
            self.name()
        );
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ComponentError> {
        if self.started {
            tracing::info!(component = self.name(), "stopping {}", self.name());
            self.started = false;
        }
        Ok(())
    }
}

/// The default component set, in start order.
pub fn default_components() -> Vec<Box<dyn Component>> {
    ComponentKind::ALL
        .into_iter()
        .map(|kind| Box::new(PendingComponent::new(kind)) as Box<dyn Component>)
        .collect()
}
