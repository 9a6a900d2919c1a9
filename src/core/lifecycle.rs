//! Server lifecycle state machine.
//!
//! ```text
//! Initializing → StorageStarting → ComponentsStarting → Running
//!       │               │                  │               │
//!       └───────────────┴──────────────────┴───────────────┴──→ ShuttingDown → Stopped
//! ```
//!
//! States only move forward. `ShuttingDown` is reachable from every state
//! before it, either on a termination signal or on a fatal startup error.

use std::fmt;

use crate::core::error::{ServerError, ServerResult};

/// Lifecycle state of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Validating configuration and preparing directories.
    Initializing,
    /// Selecting and starting the storage backend.
    StorageStarting,
    /// Starting control-plane components in order.
    ComponentsStarting,
    /// Serving until a termination signal arrives.
    Running,
    /// Tearing down components and storage.
    ShuttingDown,
    /// Terminal state.
    Stopped,
}

impl LifecycleState {
    /// Check whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Initializing, StorageStarting)
                | (StorageStarting, ComponentsStarting)
                | (ComponentsStarting, Running)
                | (
                    Initializing | StorageStarting | ComponentsStarting | Running,
                    ShuttingDown
                )
                | (ShuttingDown, Stopped)
        )
    }

    /// Check whether shutdown has begun or completed.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }

    /// Stable lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::StorageStarting => "storage_starting",
            Self::ComponentsStarting => "components_starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current lifecycle state and enforces forward-only movement.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Create a tracker in `Initializing`.
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Initializing,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move to `next`, rejecting backward or skipping transitions.
    pub fn advance(&mut self, next: LifecycleState) -> ServerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ServerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn happy_path_walks_every_state() {
        let mut lifecycle = Lifecycle::new();
        for next in [
            StorageStarting,
            ComponentsStarting,
            Running,
            ShuttingDown,
            Stopped,
        ] {
            lifecycle.advance(next).unwrap();
            assert_eq!(lifecycle.state(), next);
        }
    }

    #[test]
    fn shutdown_reachable_from_every_live_state() {
        for state in [Initializing, StorageStarting, ComponentsStarting, Running] {
            assert!(state.can_transition_to(ShuttingDown), "{state}");
        }
        assert!(!Stopped.can_transition_to(ShuttingDown));
        assert!(!ShuttingDown.can_transition_to(ShuttingDown));
    }

    #[test]
    fn states_are_never_revisited() {
        assert!(!Running.can_transition_to(StorageStarting));
        assert!(!StorageStarting.can_transition_to(Initializing));
        assert!(!Stopped.can_transition_to(Initializing));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn skipping_forward_is_rejected() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.advance(Running).unwrap_err();
        assert!(matches!(
            err,
            ServerError::InvalidTransition {
                from: Initializing,
                to: Running
            }
        ));
        assert_eq!(lifecycle.state(), Initializing);
        assert!(!Initializing.can_transition_to(Stopped));
    }
}
