//! etcd adapter integration tests.
//!
//! Drive the etcd services the way the API server does: writes, prefix
//! lists, guarded creates, watches and leases against one SQLite log.

mod common;

use common::{assert_ok, EtcdFixture};
use kubelite::adapters::etcd::proto::{
    self, compare, request_op, watch_request, CompactionRequest, DeleteRangeRequest,
    LeaseGrantRequest, LeaseRevokeRequest, PutRequest, RangeRequest, StatusRequest, TxnRequest,
    WatchCreateRequest, WatchRequest,
};
use kubelite::adapters::etcd::{
    KvService, LeaseService, MaintenanceService, WatchHub, WatchService,
};
use kubelite::core::error::StorageError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::Status;

fn put(kv: &KvService, key: &str, value: &str) -> i64 {
    assert_ok(kv.put(PutRequest {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        ..Default::default()
    }))
    .header
    .unwrap()
    .revision
}

fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    end
}

// ============================================================================
// KV
// ============================================================================

#[test]
fn put_then_range_returns_value_with_increasing_revisions() {
    let fixture = EtcdFixture::new();
    let kv = KvService::new(fixture.state.clone());

    let r1 = put(&kv, "/registry/pods/default/a", "v1");
    let r2 = put(&kv, "/registry/pods/default/a", "v2");
    assert!(r2 > r1);

    let resp = assert_ok(kv.range(RangeRequest {
        key: b"/registry/pods/default/a".to_vec(),
        ..Default::default()
    }));
    assert_eq!(resp.count, 1);
    let item = &resp.kvs[0];
    assert_eq!(item.value, b"v2");
    assert_eq!(item.create_revision, r1);
    assert_eq!(item.mod_revision, r2);
    assert_eq!(item.version, 2);

    let old = assert_ok(kv.range(RangeRequest {
        key: b"/registry/pods/default/a".to_vec(),
        revision: r1,
        ..Default::default()
    }));
    assert_eq!(old.kvs[0].value, b"v1");
}

#[test]
fn prefix_range_honours_limit_and_count() {
    let fixture = EtcdFixture::new();
    let kv = KvService::new(fixture.state.clone());
    for name in ["a", "b", "c", "d"] {
        put(&kv, &format!("/registry/services/{name}"), name);
    }
    put(&kv, "/registry/serviceaccounts/x", "x");

    let resp = assert_ok(kv.range(RangeRequest {
        key: b"/registry/services/".to_vec(),
        range_end: prefix_end("/registry/services/"),
        limit: 2,
        ..Default::default()
    }));
    assert_eq!(resp.kvs.len(), 2);
    assert_eq!(resp.count, 4);
    assert!(resp.more);

    let counted = assert_ok(kv.range(RangeRequest {
        key: b"/registry/services/".to_vec(),
        range_end: prefix_end("/registry/services/"),
        count_only: true,
        ..Default::default()
    }));
    assert!(counted.kvs.is_empty());
    assert_eq!(counted.count, 4);
}

#[test]
fn txn_creates_only_when_absent() {
    let fixture = EtcdFixture::new();
    let kv = KvService::new(fixture.state.clone());

    let create = || TxnRequest {
        compare: vec![proto::Compare {
            result: compare::CompareResult::Equal as i32,
            target: compare::CompareTarget::Mod as i32,
            key: b"/registry/namespaces/default".to_vec(),
            range_end: Vec::new(),
            target_union: Some(compare::TargetUnion::ModRevision(0)),
        }],
        success: vec![proto::RequestOp {
            request: Some(request_op::Request::RequestPut(PutRequest {
                key: b"/registry/namespaces/default".to_vec(),
                value: b"ns".to_vec(),
                ..Default::default()
            })),
        }],
        failure: vec![proto::RequestOp {
            request: Some(request_op::Request::RequestRange(RangeRequest {
                key: b"/registry/namespaces/default".to_vec(),
                ..Default::default()
            })),
        }],
    };

    let first = assert_ok(kv.txn(create()));
    assert!(first.succeeded);

    let second = assert_ok(kv.txn(create()));
    assert!(!second.succeeded);
    match &second.responses[0].response {
        Some(proto::response_op::Response::ResponseRange(range)) => {
            assert_eq!(range.kvs[0].value, b"ns");
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn compacted_revision_is_rejected() {
    let fixture = EtcdFixture::new();
    let kv = KvService::new(fixture.state.clone());
    let first = put(&kv, "/k", "1");
    put(&kv, "/k", "2");
    let third = put(&kv, "/k", "3");

    assert_ok(kv.compact(CompactionRequest {
        revision: third,
        physical: false,
    }));
    let err = kv
        .range(RangeRequest {
            key: b"/k".to_vec(),
            revision: first,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::Compacted { .. }));
    assert_eq!(
        err.to_string(),
        "etcdserver: mvcc: required revision has been compacted"
    );

    let err = kv
        .range(RangeRequest {
            key: b"/k".to_vec(),
            revision: third + 10,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::FutureRevision { .. }));
}

// ============================================================================
// Watch
// ============================================================================

#[tokio::test]
async fn delete_is_visible_to_watch_as_tombstone() {
    let fixture = EtcdFixture::new();
    let kv = KvService::new(fixture.state.clone());
    let hub = WatchHub::new(fixture.state.clone()).unwrap();
    tokio::spawn(hub.run());

    let (req_tx, req_rx) = mpsc::channel::<Result<WatchRequest, Status>>(4);
    let mut responses = WatchService::new(fixture.state.clone())
        .watch_stream(ReceiverStream::new(req_rx));

    req_tx
        .send(Ok(WatchRequest {
            request_union: Some(watch_request::RequestUnion::CreateRequest(
                WatchCreateRequest {
                    key: b"/registry/configmaps/".to_vec(),
                    range_end: prefix_end("/registry/configmaps/"),
                    prev_kv: true,
                    ..Default::default()
                },
            )),
        }))
        .await
        .unwrap();

    let created = responses.next().await.unwrap().unwrap();
    assert!(created.created);

    put(&kv, "/registry/configmaps/cm", "data");
    assert_ok(kv.delete_range(DeleteRangeRequest {
        key: b"/registry/configmaps/cm".to_vec(),
        ..Default::default()
    }));

    let mut events = Vec::new();
    while events.len() < 2 {
        let resp = tokio::time::timeout(Duration::from_secs(5), responses.next())
            .await
            .expect("watch timed out")
            .unwrap()
            .unwrap();
        events.extend(resp.events);
    }
    assert_eq!(events[0].r#type, proto::EventType::Put as i32);
    assert_eq!(events[1].r#type, proto::EventType::Delete as i32);
    let prev = events[1].prev_kv.as_ref().unwrap();
    assert_eq!(prev.value, b"data");

    fixture.shutdown_tx.send(true).unwrap();
}

// ============================================================================
// Lease and Maintenance
// ============================================================================

#[test]
fn lease_revoke_removes_keys() {
    let fixture = EtcdFixture::new();
    let kv = KvService::new(fixture.state.clone());
    let leases = LeaseService::new(fixture.state.clone());

    let lease = assert_ok(leases.grant(LeaseGrantRequest { ttl: 60, id: 0 })).id;
    assert_ok(kv.put(PutRequest {
        key: b"/registry/leases/kube-node-lease/n1".to_vec(),
        value: b"hb".to_vec(),
        lease,
        ..Default::default()
    }));

    assert_ok(leases.revoke(LeaseRevokeRequest { id: lease }));
    let resp = assert_ok(kv.range(RangeRequest {
        key: b"/registry/leases/kube-node-lease/n1".to_vec(),
        ..Default::default()
    }));
    assert_eq!(resp.count, 0);
}

#[test]
fn status_reports_emulated_version() {
    let fixture = EtcdFixture::new();
    let status = assert_ok(MaintenanceService::new(fixture.state.clone()).status(StatusRequest {}));
    assert_eq!(status.version, "3.5.13");
    assert!(status.db_size > 0);
}
