//! etcd watch streams.
//!
//! A single [`WatchHub`] polls the log for entries above the last revision it
//! published and broadcasts them in batches. It wakes immediately after a
//! committed write and otherwise every poll interval. Each gRPC watch stream
//! runs its own task that multiplexes any number of watchers, replays history
//! for watchers created with a start revision, and filters the broadcast by
//! key range and event type.
//!
//! Every watcher remembers the highest revision it has seen, so events that
//! arrive through both the replay and the broadcast are delivered once.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use super::proto::{self, watch_request::RequestUnion, EventType, FilterType};
use super::{run_blocking, to_key_value, to_status, SharedState};
use crate::core::error::{StorageError, StorageResult};
use crate::storage::sqlite::{EventKind, KeyRange, LogEvent};

/// Maximum log entries read per poll or replay page.
pub const POLL_BATCH: usize = 500;

/// Buffered responses per watch stream.
const WATCH_BUFFER: usize = 128;

/// Watch id used for responses to a progress request.
pub const PROGRESS_WATCH_ID: i64 = -1;

/// Polls the log and fans new events out to every watch stream.
#[derive(Debug)]
pub struct WatchHub {
    state: SharedState,
    published: i64,
}

impl WatchHub {
    /// Create a hub that publishes entries written after this call.
    pub fn new(state: SharedState) -> StorageResult<Self> {
        let published = state.store.current_revision()?;
        Ok(Self { state, published })
    }

    /// Poll until shutdown.
    pub async fn run(self) {
        let mut last = self.published;
        tracing::debug!(revision = last, "watch poller started");

        let mut ticker = tokio::time::interval(self.state.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.state.shutdown_requested();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.state.writes.notified() => {}
                _ = ticker.tick() => {}
            }
            match self.drain(last).await {
                Ok(next) => last = next,
                Err(e) => tracing::warn!(error = %e, after = last, "watch poll failed"),
            }
        }
        tracing::debug!(revision = last, "watch poller stopped");
    }

    /// Publish every entry above `last`; returns the new high-water mark.
    async fn drain(&self, mut last: i64) -> StorageResult<i64> {
        loop {
            let store = Arc::clone(&self.state.store);
            let after = last;
            let batch = run_blocking(move || store.after(after, POLL_BATCH)).await?;
            let Some(tail) = batch.last() else {
                return Ok(last);
            };
            last = tail.revision();
            let full = batch.len() == POLL_BATCH;
            // Sending fails only when no stream is subscribed.
            let _ = self.state.events.send(Arc::new(batch));
            if !full {
                return Ok(last);
            }
        }
    }
}

/// Watch service implementation.
#[derive(Clone, Debug)]
pub struct WatchService {
    state: SharedState,
}

impl WatchService {
    /// Create a new watch service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve one bidirectional watch stream.
    pub fn watch_stream<S>(
        &self,
        inbound: S,
    ) -> ReceiverStream<Result<proto::WatchResponse, Status>>
    where
        S: Stream<Item = Result<proto::WatchRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        // Subscribe before any create so no published batch is missed.
        let events = self.state.events.subscribe();
        let stream = WatchStream {
            state: self.state.clone(),
            tx,
            watchers: BTreeMap::new(),
            next_id: 0,
        };
        tokio::spawn(stream.run(inbound, events));
        ReceiverStream::new(rx)
    }
}

#[derive(Debug)]
struct Watcher {
    range: KeyRange,
    no_put: bool,
    no_delete: bool,
    prev_kv: bool,
    progress_notify: bool,
    /// Highest revision already delivered or skipped.
    last_revision: i64,
    /// Events were sent since the last progress tick.
    active: bool,
}

impl Watcher {
    fn from_request(req: &proto::WatchCreateRequest, last_revision: i64) -> Self {
        let has = |filter: FilterType| req.filters.contains(&(filter as i32));
        Self {
            range: KeyRange::new(&req.key, &req.range_end),
            no_put: has(FilterType::Noput),
            no_delete: has(FilterType::Nodelete),
            prev_kv: req.prev_kv,
            progress_notify: req.progress_notify,
            last_revision,
            active: false,
        }
    }

    fn matches(&self, event: &LogEvent) -> bool {
        event.revision() > self.last_revision
            && self.range.contains(&event.kv.key)
            && match event.kind {
                EventKind::Put => !self.no_put,
                EventKind::Delete => !self.no_delete,
            }
    }

    fn to_proto(&self, event: &LogEvent) -> proto::Event {
        let kind = match event.kind {
            EventKind::Put => EventType::Put,
            EventKind::Delete => EventType::Delete,
        };
        proto::Event {
            r#type: kind as i32,
            kv: Some(to_key_value(event.kv.clone())),
            prev_kv: if self.prev_kv {
                event.prev_kv.clone().map(to_key_value)
            } else {
                None
            },
        }
    }
}

struct WatchStream {
    state: SharedState,
    tx: mpsc::Sender<Result<proto::WatchResponse, Status>>,
    watchers: BTreeMap<i64, Watcher>,
    next_id: i64,
}

impl WatchStream {
    async fn run<S>(
        mut self,
        mut inbound: S,
        mut events: broadcast::Receiver<Arc<Vec<LogEvent>>>,
    ) where
        S: Stream<Item = Result<proto::WatchRequest, Status>> + Unpin,
    {
        let interval = self.state.settings.notify_interval();
        let mut progress = tokio::time::interval_at(Instant::now() + interval, interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = self.state.clone();
        let shutdown = state.shutdown_requested();
        tokio::pin!(shutdown);

        loop {
            let open = tokio::select! {
                _ = &mut shutdown => false,
                next = inbound.next() => match next {
                    Some(Ok(req)) => self.handle(req).await,
                    Some(Err(status)) => {
                        tracing::debug!(%status, "watch stream closed by client");
                        false
                    }
                    None => false,
                },
                batch = events.recv() => match batch {
                    Ok(batch) => self.dispatch(&batch).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watch stream lagged; replaying from store");
                        self.catch_up().await
                    }
                    Err(RecvError::Closed) => false,
                },
                _ = progress.tick() => self.notify_progress().await,
            };
            if !open {
                break;
            }
        }
        tracing::debug!(watchers = self.watchers.len(), "watch stream ended");
    }

    async fn handle(&mut self, req: proto::WatchRequest) -> bool {
        match req.request_union {
            Some(RequestUnion::CreateRequest(create)) => self.create(create).await,
            Some(RequestUnion::CancelRequest(cancel)) => self.cancel(cancel.watch_id).await,
            Some(RequestUnion::ProgressRequest(_)) => match self.revisions().await {
                Ok((current, _)) => {
                    self.send(proto::WatchResponse {
                        header: Some(self.state.header(current)),
                        watch_id: PROGRESS_WATCH_ID,
                        ..Default::default()
                    })
                    .await
                }
                Err(e) => self.fail(e).await,
            },
            None => true,
        }
    }

    async fn create(&mut self, req: proto::WatchCreateRequest) -> bool {
        let (current, floor) = match self.revisions().await {
            Ok(revisions) => revisions,
            Err(e) => return self.fail(e).await,
        };
        let header = Some(self.state.header(current));

        let watch_id = if req.watch_id != 0 {
            if self.watchers.contains_key(&req.watch_id) {
                return self
                    .send(proto::WatchResponse {
                        header,
                        watch_id: req.watch_id,
                        created: true,
                        canceled: true,
                        cancel_reason: "etcdserver: duplicate watch ID".to_string(),
                        ..Default::default()
                    })
                    .await;
            }
            req.watch_id
        } else {
            while self.watchers.contains_key(&self.next_id) {
                self.next_id += 1;
            }
            self.next_id
        };

        if req.start_revision > 0 && req.start_revision < floor {
            tracing::debug!(
                watch_id,
                start_revision = req.start_revision,
                compact_revision = floor,
                "watch start revision compacted"
            );
            let created = proto::WatchResponse {
                header: header.clone(),
                watch_id,
                created: true,
                ..Default::default()
            };
            let canceled = proto::WatchResponse {
                header,
                watch_id,
                canceled: true,
                compact_revision: floor,
                cancel_reason: StorageError::Compacted {
                    revision: req.start_revision,
                    compact_revision: floor,
                }
                .to_string(),
                ..Default::default()
            };
            return self.send(created).await && self.send(canceled).await;
        }

        let start = if req.start_revision > 0 {
            req.start_revision
        } else {
            current + 1
        };
        self.watchers
            .insert(watch_id, Watcher::from_request(&req, start - 1));
        tracing::debug!(
            watch_id,
            key = %String::from_utf8_lossy(&req.key),
            start_revision = start,
            "watch created"
        );

        let created = proto::WatchResponse {
            header,
            watch_id,
            created: true,
            ..Default::default()
        };
        if !self.send(created).await {
            return false;
        }
        if start <= current {
            return self.replay(start - 1).await;
        }
        true
    }

    async fn cancel(&mut self, watch_id: i64) -> bool {
        self.watchers.remove(&watch_id);
        let current = match self.revisions().await {
            Ok((current, _)) => current,
            Err(e) => return self.fail(e).await,
        };
        tracing::debug!(watch_id, "watch canceled");
        self.send(proto::WatchResponse {
            header: Some(self.state.header(current)),
            watch_id,
            canceled: true,
            ..Default::default()
        })
        .await
    }

    /// Deliver a batch to every watcher that has not yet seen it.
    async fn dispatch(&mut self, batch: &[LogEvent]) -> bool {
        let Some(tail) = batch.last().map(LogEvent::revision) else {
            return true;
        };
        let mut responses = Vec::new();
        for (&watch_id, watcher) in self.watchers.iter_mut() {
            let events: Vec<proto::Event> = batch
                .iter()
                .filter(|event| watcher.matches(event))
                .map(|event| watcher.to_proto(event))
                .collect();
            watcher.last_revision = watcher.last_revision.max(tail);
            if !events.is_empty() {
                watcher.active = true;
                responses.push(proto::WatchResponse {
                    header: Some(self.state.header(tail)),
                    watch_id,
                    events,
                    ..Default::default()
                });
            }
        }
        for resp in responses {
            if !self.send(resp).await {
                return false;
            }
        }
        true
    }

    /// Read the log from `after` and dispatch it page by page.
    async fn replay(&mut self, mut after: i64) -> bool {
        loop {
            let store = Arc::clone(&self.state.store);
            let from = after;
            let page = match run_blocking(move || store.after(from, POLL_BATCH)).await {
                Ok(page) => page,
                Err(e) => return self.fail(e).await,
            };
            let Some(tail) = page.last().map(LogEvent::revision) else {
                return true;
            };
            if !self.dispatch(&page).await {
                return false;
            }
            if page.len() < POLL_BATCH {
                return true;
            }
            after = tail;
        }
    }

    async fn catch_up(&mut self) -> bool {
        match self.watchers.values().map(|w| w.last_revision).min() {
            Some(from) => self.replay(from).await,
            None => true,
        }
    }

    async fn notify_progress(&mut self) -> bool {
        let idle: Vec<i64> = self
            .watchers
            .iter()
            .filter(|(_, w)| w.progress_notify && !w.active)
            .map(|(&id, _)| id)
            .collect();
        for watcher in self.watchers.values_mut() {
            watcher.active = false;
        }
        if idle.is_empty() {
            return true;
        }
        let current = match self.revisions().await {
            Ok((current, _)) => current,
            Err(e) => return self.fail(e).await,
        };
        for watch_id in idle {
            let resp = proto::WatchResponse {
                header: Some(self.state.header(current)),
                watch_id,
                ..Default::default()
            };
            if !self.send(resp).await {
                return false;
            }
        }
        true
    }

    /// Current revision and compaction floor.
    async fn revisions(&self) -> StorageResult<(i64, i64)> {
        let store = Arc::clone(&self.state.store);
        run_blocking(move || Ok((store.current_revision()?, store.compact_revision()?))).await
    }

    async fn send(&self, resp: proto::WatchResponse) -> bool {
        self.tx.send(Ok(resp)).await.is_ok()
    }

    async fn fail(&self, err: StorageError) -> bool {
        let _ = self.tx.send(Err(to_status(err))).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::shared_state;
    use super::super::KvService;
    use super::*;
    use std::time::Duration;

    fn create(key: &[u8], range_end: &[u8], start_revision: i64) -> proto::WatchRequest {
        proto::WatchRequest {
            request_union: Some(RequestUnion::CreateRequest(proto::WatchCreateRequest {
                key: key.to_vec(),
                range_end: range_end.to_vec(),
                start_revision,
                prev_kv: true,
                ..Default::default()
            })),
        }
    }

    fn put(kv: &KvService, key: &str, value: &str) {
        kv.put(proto::PutRequest {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        })
        .unwrap();
    }

    async fn next(
        stream: &mut ReceiverStream<Result<proto::WatchResponse, Status>>,
    ) -> proto::WatchResponse {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("watch response within timeout")
            .expect("stream open")
            .expect("ok response")
    }

    #[tokio::test]
    async fn test_watch_receives_live_events() {
        let (fixture, state) = shared_state();
        tokio::spawn(WatchHub::new(state.clone()).unwrap().run());
        let kv = KvService::new(state.clone());
        let svc = WatchService::new(state);

        let (req_tx, req_rx) = mpsc::channel(4);
        let mut stream = svc.watch_stream(ReceiverStream::new(req_rx).map(Ok));
        req_tx
            .send(create(b"/registry/pods/", b"/registry/pods0", 0))
            .await
            .unwrap();
        let created = next(&mut stream).await;
        assert!(created.created);
        assert_eq!(created.watch_id, 0);

        put(&kv, "/registry/services/s", "ignored");
        put(&kv, "/registry/pods/a", "v1");

        let resp = next(&mut stream).await;
        assert_eq!(resp.events.len(), 1);
        let kv0 = resp.events[0].kv.as_ref().unwrap();
        assert_eq!(kv0.key, b"/registry/pods/a");
        assert_eq!(kv0.mod_revision, 2);

        fixture.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_watch_replays_from_start_revision() {
        let (fixture, state) = shared_state();
        let kv = KvService::new(state.clone());
        put(&kv, "k", "1");
        put(&kv, "k", "2");
        kv.delete_range(proto::DeleteRangeRequest {
            key: b"k".to_vec(),
            ..Default::default()
        })
        .unwrap();

        let svc = WatchService::new(state);
        let inbound = tokio_stream::iter(vec![Ok(create(b"k", b"", 2))]).chain(tokio_stream::pending());
        let mut stream = svc.watch_stream(inbound);
        assert!(next(&mut stream).await.created);

        let replay = next(&mut stream).await;
        let kinds: Vec<i32> = replay.events.iter().map(|e| e.r#type).collect();
        assert_eq!(kinds, vec![EventType::Put as i32, EventType::Delete as i32]);
        assert_eq!(replay.events[0].prev_kv.as_ref().unwrap().value, b"1");
        assert_eq!(replay.events[1].kv.as_ref().unwrap().mod_revision, 3);

        fixture.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_watch_on_compacted_revision_is_canceled() {
        let (fixture, state) = shared_state();
        let kv = KvService::new(state.clone());
        put(&kv, "k", "1");
        put(&kv, "k", "2");
        put(&kv, "k", "3");
        state.store.compact(3).unwrap();

        let svc = WatchService::new(state);
        let inbound = tokio_stream::iter(vec![Ok(create(b"k", b"", 1))]).chain(tokio_stream::pending());
        let mut stream = svc.watch_stream(inbound);
        assert!(next(&mut stream).await.created);
        let canceled = next(&mut stream).await;
        assert!(canceled.canceled);
        assert_eq!(canceled.compact_revision, 3);

        fixture.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_and_progress_requests() {
        let (fixture, state) = shared_state();
        let svc = WatchService::new(state);
        let requests = vec![
            Ok(create(b"a", b"", 0)),
            Ok(proto::WatchRequest {
                request_union: Some(RequestUnion::ProgressRequest(
                    proto::WatchProgressRequest {},
                )),
            }),
            Ok(proto::WatchRequest {
                request_union: Some(RequestUnion::CancelRequest(proto::WatchCancelRequest {
                    watch_id: 0,
                })),
            }),
        ];
        let inbound = tokio_stream::iter(requests).chain(tokio_stream::pending());
        let mut stream = svc.watch_stream(inbound);
        assert!(next(&mut stream).await.created);
        assert_eq!(next(&mut stream).await.watch_id, PROGRESS_WATCH_ID);
        let canceled = next(&mut stream).await;
        assert!(canceled.canceled);
        assert_eq!(canceled.watch_id, 0);

        fixture.shutdown_tx.send(true).unwrap();
    }

    #[test]
    fn test_filters_drop_event_kinds() {
        let req = proto::WatchCreateRequest {
            key: b"k".to_vec(),
            filters: vec![FilterType::Nodelete as i32],
            ..Default::default()
        };
        let watcher = Watcher::from_request(&req, 0);
        let mut event = LogEvent {
            kind: EventKind::Delete,
            kv: crate::storage::sqlite::KvRecord {
                key: b"k".to_vec(),
                mod_revision: 1,
                ..Default::default()
            },
            prev_kv: None,
        };
        assert!(!watcher.matches(&event));
        event.kind = EventKind::Put;
        assert!(watcher.matches(&event));
    }
}
