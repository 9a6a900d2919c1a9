//! etcd Maintenance.Status.
//!
//! Clients probe Status to learn the server version. The embedded store is a
//! single member, so it always reports itself as leader.

use super::{proto, SharedState, MEMBER_ID, RAFT_TERM};
use crate::core::error::StorageResult;

/// Maintenance service implementation.
#[derive(Clone, Debug)]
pub struct MaintenanceService {
    state: SharedState,
}

impl MaintenanceService {
    /// Create a new maintenance service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handle Status request.
    pub fn status(&self, _req: proto::StatusRequest) -> StorageResult<proto::StatusResponse> {
        let revision = self.state.store.current_revision()?;
        let db_size = self.state.store.db_size()?;
        let index = u64::try_from(revision).unwrap_or_default();
        Ok(proto::StatusResponse {
            header: Some(self.state.header(revision)),
            version: self.state.settings.emulated_etcd_version.clone(),
            db_size,
            leader: MEMBER_ID,
            raft_index: index,
            raft_term: RAFT_TERM,
            raft_applied_index: index,
            errors: Vec::new(),
            db_size_in_use: db_size,
            is_learner: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::shared_state;
    use super::*;
    use crate::core::config::DEFAULT_EMULATED_ETCD_VERSION;

    #[test]
    fn test_status_reports_emulated_version() {
        let (_fixture, state) = shared_state();
        let svc = MaintenanceService::new(state);
        let status = svc.status(proto::StatusRequest {}).unwrap();
        assert_eq!(status.version, DEFAULT_EMULATED_ETCD_VERSION);
        assert_eq!(status.leader, MEMBER_ID);
        assert!(status.db_size > 0);
    }
}
