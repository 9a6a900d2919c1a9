//! etcd lease operations.
//!
//! Leases live in the `leases` table with an absolute expiry. Keepalives push
//! the expiry forward by the granted TTL, and a background sweeper revokes
//! expired leases together with every key attached to them.

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use super::{proto, run_blocking, to_status, SharedState};
use crate::core::error::{StorageError, StorageResult};
use crate::core::time::now_ms;

/// Buffered responses per keepalive stream.
const KEEPALIVE_BUFFER: usize = 16;

/// Lease service implementation.
#[derive(Clone, Debug)]
pub struct LeaseService {
    state: SharedState,
}

impl LeaseService {
    /// Create a new lease service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handle LeaseGrant request. `id == 0` lets the store pick an id.
    pub fn grant(&self, req: proto::LeaseGrantRequest) -> StorageResult<proto::LeaseGrantResponse> {
        let now = now_ms();
        let lease = self
            .state
            .store
            .write(|batch| batch.grant_lease(req.id, req.ttl, now))?;
        tracing::debug!(lease_id = lease.id, ttl = lease.granted_ttl, "lease granted");
        let revision = self.state.store.current_revision()?;
        Ok(proto::LeaseGrantResponse {
            header: Some(self.state.header(revision)),
            id: lease.id,
            ttl: lease.granted_ttl,
            error: String::new(),
        })
    }

    /// Handle LeaseRevoke request.
    pub fn revoke(
        &self,
        req: proto::LeaseRevokeRequest,
    ) -> StorageResult<proto::LeaseRevokeResponse> {
        let deleted = self
            .state
            .store
            .write(|batch| batch.revoke_lease(req.id))?;
        tracing::debug!(lease_id = req.id, keys = deleted.len(), "lease revoked");
        if !deleted.is_empty() {
            self.state.wake_watchers();
        }
        let revision = self.state.store.current_revision()?;
        Ok(proto::LeaseRevokeResponse {
            header: Some(self.state.header(revision)),
        })
    }

    /// Refresh one lease. Unknown or expired leases answer with TTL 0.
    pub fn keep_alive_once(
        &self,
        req: proto::LeaseKeepAliveRequest,
    ) -> StorageResult<proto::LeaseKeepAliveResponse> {
        let now = now_ms();
        let ttl = match self
            .state
            .store
            .write(|batch| batch.refresh_lease(req.id, now))
        {
            Ok(lease) => lease.granted_ttl,
            Err(StorageError::LeaseNotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        let revision = self.state.store.current_revision()?;
        Ok(proto::LeaseKeepAliveResponse {
            header: Some(self.state.header(revision)),
            id: req.id,
            ttl,
        })
    }

    /// Handle LeaseTimeToLive request. Unknown leases report TTL -1.
    pub fn time_to_live(
        &self,
        req: proto::LeaseTimeToLiveRequest,
    ) -> StorageResult<proto::LeaseTimeToLiveResponse> {
        let now = now_ms();
        let revision = self.state.store.current_revision()?;
        let mut resp = proto::LeaseTimeToLiveResponse {
            header: Some(self.state.header(revision)),
            id: req.id,
            ttl: -1,
            ..Default::default()
        };
        if let Some(lease) = self.state.store.lease(req.id)? {
            if lease.expires_at_ms > now {
                resp.ttl = lease.remaining_secs(now);
                resp.granted_ttl = lease.granted_ttl;
                if req.keys {
                    resp.keys = self.state.store.lease_keys(req.id)?;
                }
            }
        }
        Ok(resp)
    }

    /// Handle LeaseLeases request.
    pub fn leases(
        &self,
        _req: proto::LeaseLeasesRequest,
    ) -> StorageResult<proto::LeaseLeasesResponse> {
        let leases = self.state.store.leases()?;
        let revision = self.state.store.current_revision()?;
        Ok(proto::LeaseLeasesResponse {
            header: Some(self.state.header(revision)),
            leases: leases
                .into_iter()
                .map(|lease| proto::LeaseStatus { id: lease.id })
                .collect(),
        })
    }

    /// Revoke every lease that expired at or before `now_ms`.
    ///
    /// Returns the number of leases revoked. Expiry is re-checked inside the
    /// write so a keepalive racing the sweep wins.
    pub fn sweep_expired(&self, now_ms: i64) -> StorageResult<usize> {
        let mut revoked = 0;
        let mut deleted_keys = 0;
        for id in self.state.store.expired_leases(now_ms)? {
            let deleted = self.state.store.write(|batch| match batch.lease(id)? {
                Some(lease) if lease.expires_at_ms <= now_ms => {
                    batch.revoke_lease(id).map(Some)
                }
                _ => Ok(None),
            })?;
            if let Some(deleted) = deleted {
                revoked += 1;
                deleted_keys += deleted.len();
            }
        }
        if deleted_keys > 0 {
            self.state.wake_watchers();
        }
        if revoked > 0 {
            tracing::debug!(revoked, deleted_keys, "expired leases revoked");
        }
        Ok(revoked)
    }

    /// Sweep expired leases on an interval until shutdown.
    pub async fn run_sweeper(self) {
        let mut ticker = tokio::time::interval(self.state.settings.lease_sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.state.shutdown_requested();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            let svc = self.clone();
            if let Err(e) = run_blocking(move || svc.sweep_expired(now_ms())).await {
                tracing::warn!(error = %e, "lease sweep failed");
            }
        }
        tracing::debug!("lease sweeper stopped");
    }

    /// Answer each keepalive request on `inbound` until the client hangs up.
    pub fn keep_alive_stream<S>(
        &self,
        mut inbound: S,
    ) -> ReceiverStream<Result<proto::LeaseKeepAliveResponse, Status>>
    where
        S: Stream<Item = Result<proto::LeaseKeepAliveRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);
        let svc = self.clone();
        tokio::spawn(async move {
            let shutdown = svc.state.shutdown_requested();
            tokio::pin!(shutdown);
            loop {
                let req = tokio::select! {
                    _ = &mut shutdown => break,
                    next = inbound.next() => match next {
                        Some(Ok(req)) => req,
                        Some(Err(status)) => {
                            tracing::debug!(%status, "keepalive stream closed by client");
                            break;
                        }
                        None => break,
                    },
                };
                let worker = svc.clone();
                let resp = run_blocking(move || worker.keep_alive_once(req))
                    .await
                    .map_err(to_status);
                let failed = resp.is_err();
                if tx.send(resp).await.is_err() || failed {
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::shared_state;
    use super::super::KvService;
    use super::*;

    fn grant(svc: &LeaseService, ttl: i64) -> i64 {
        svc.grant(proto::LeaseGrantRequest { ttl, id: 0 })
            .unwrap()
            .id
    }

    #[test]
    fn test_grant_and_time_to_live() {
        let (_fixture, state) = shared_state();
        let svc = LeaseService::new(state);
        let id = grant(&svc, 30);
        let ttl = svc
            .time_to_live(proto::LeaseTimeToLiveRequest { id, keys: true })
            .unwrap();
        assert_eq!(ttl.granted_ttl, 30);
        assert!(ttl.ttl > 0 && ttl.ttl <= 30);
        assert!(ttl.keys.is_empty());

        let leases = svc.leases(proto::LeaseLeasesRequest {}).unwrap();
        assert_eq!(leases.leases, vec![proto::LeaseStatus { id }]);
    }

    #[test]
    fn test_time_to_live_unknown_lease() {
        let (_fixture, state) = shared_state();
        let svc = LeaseService::new(state);
        let resp = svc
            .time_to_live(proto::LeaseTimeToLiveRequest { id: 5, keys: false })
            .unwrap();
        assert_eq!(resp.ttl, -1);
    }

    #[test]
    fn test_revoke_deletes_attached_keys() {
        let (_fixture, state) = shared_state();
        let svc = LeaseService::new(state.clone());
        let kv = KvService::new(state);
        let id = grant(&svc, 60);
        kv.put(proto::PutRequest {
            key: b"/registry/events/e1".to_vec(),
            value: b"x".to_vec(),
            lease: id,
            ..Default::default()
        })
        .unwrap();

        svc.revoke(proto::LeaseRevokeRequest { id }).unwrap();
        let resp = kv
            .range(proto::RangeRequest {
                key: b"/registry/events/e1".to_vec(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resp.count, 0);
        assert!(matches!(
            svc.revoke(proto::LeaseRevokeRequest { id }),
            Err(StorageError::LeaseNotFound { .. })
        ));
    }

    #[test]
    fn test_keep_alive_unknown_lease_reports_zero_ttl() {
        let (_fixture, state) = shared_state();
        let svc = LeaseService::new(state);
        let resp = svc
            .keep_alive_once(proto::LeaseKeepAliveRequest { id: 99 })
            .unwrap();
        assert_eq!(resp.ttl, 0);

        let id = grant(&svc, 10);
        let resp = svc
            .keep_alive_once(proto::LeaseKeepAliveRequest { id })
            .unwrap();
        assert_eq!(resp.ttl, 10);
    }

    #[test]
    fn test_sweep_revokes_only_expired() {
        let (_fixture, state) = shared_state();
        let svc = LeaseService::new(state);
        let short = grant(&svc, 1);
        let long = grant(&svc, 3600);

        assert_eq!(svc.sweep_expired(now_ms()).unwrap(), 0);
        let later = now_ms() + 2_000;
        assert_eq!(svc.sweep_expired(later).unwrap(), 1);

        let remaining: Vec<i64> = svc
            .leases(proto::LeaseLeasesRequest {})
            .unwrap()
            .leases
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(remaining, vec![long]);
        assert_ne!(short, long);
    }

    #[tokio::test]
    async fn test_keep_alive_stream_answers_each_request() {
        let (_fixture, state) = shared_state();
        let svc = LeaseService::new(state);
        let id = grant(&svc, 15);

        let inbound = tokio_stream::iter(vec![
            Ok(proto::LeaseKeepAliveRequest { id }),
            Ok(proto::LeaseKeepAliveRequest { id }),
        ]);
        let responses: Vec<_> = svc.keep_alive_stream(inbound).collect().await;
        assert_eq!(responses.len(), 2);
        for resp in responses {
            let resp = resp.unwrap();
            assert_eq!(resp.id, id);
            assert_eq!(resp.ttl, 15);
        }
    }
}
