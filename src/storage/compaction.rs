//! Periodic log compaction.
//!
//! Every interval the compactor raises the compaction floor to
//! `current_revision - min_retain_revisions`, dropping history no reader at
//! or above the floor can observe. Watchers that resume below the floor get a
//! compacted cancellation, the same as against etcd.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::core::config::EmbeddedConfig;
use crate::core::error::{StorageError, StorageResult};
use crate::storage::sqlite::SqliteStore;

/// Compaction policy for the embedded store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Minimum revisions to retain below the current revision.
    pub min_retain_revisions: i64,
    /// Time between compaction passes; `None` disables the compactor.
    pub interval: Option<Duration>,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddedConfig::default())
    }
}

impl CompactionPolicy {
    /// Policy derived from embedded store settings.
    pub fn from_config(config: &EmbeddedConfig) -> Self {
        Self {
            min_retain_revisions: config.compact_min_retain,
            interval: config.compact_interval(),
        }
    }

    /// Propose a new compaction floor, or `None` if it would not advance.
    pub fn propose_floor(&self, current_revision: i64, floor: i64) -> Option<i64> {
        let target = current_revision.saturating_sub(self.min_retain_revisions);
        (target > floor).then_some(target)
    }
}

/// Run one compaction pass. Returns the new floor and the rows removed.
pub fn compact_once(
    store: &SqliteStore,
    policy: &CompactionPolicy,
) -> StorageResult<Option<(i64, usize)>> {
    let current = store.current_revision()?;
    let floor = store.compact_revision()?;
    let Some(target) = policy.propose_floor(current, floor) else {
        return Ok(None);
    };
    match store.compact(target) {
        Ok(removed) => Ok(Some((target, removed))),
        // Someone compacted further in the meantime.
        Err(StorageError::Compacted { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Compact on the policy interval until shutdown.
pub async fn run_compactor(
    store: Arc<SqliteStore>,
    policy: CompactionPolicy,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(period) = policy.interval else {
        tracing::debug!("compactor disabled");
        return;
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }
        let worker = Arc::clone(&store);
        let result = tokio::task::spawn_blocking(move || compact_once(&worker, &policy)).await;
        match result {
            Ok(Ok(Some((floor, removed)))) => {
                tracing::info!(floor, removed, "compacted revision history");
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "compaction failed"),
            Err(e) => tracing::warn!(error = %e, "compaction task failed"),
        }
    }
    tracing::debug!("compactor stopped");
}
