//! etcd KV operations: Range, Put, DeleteRange, Txn and Compact.
//!
//! Reads go straight to the store at the requested revision. Writes run in a
//! single store transaction and wake the watch poller once committed. The
//! `*_in` helpers operate on an open [`WriteBatch`] so transactions reuse the
//! exact same semantics as the top-level calls.

use std::cmp::Ordering;

use super::proto::{self, SortOrder, SortTarget};
use super::{to_key_value, txn, SharedState};
use crate::core::error::{StorageError, StorageResult};
use crate::storage::sqlite::{KeyRange, KvRecord, RangeResult, WriteBatch};

/// KV service implementation.
#[derive(Clone, Debug)]
pub struct KvService {
    state: SharedState,
}

impl KvService {
    /// Create a new KV service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handle Range (Get) request.
    pub fn range(&self, req: proto::RangeRequest) -> StorageResult<proto::RangeResponse> {
        let range = KeyRange::new(&req.key, &req.range_end);
        let result = self
            .state
            .store
            .range(&range, req.revision, fetch_limit(&req))?;
        Ok(shape_range(&self.state, &req, result))
    }

    /// Handle Put request.
    pub fn put(&self, req: proto::PutRequest) -> StorageResult<proto::PutResponse> {
        validate_put(&req)?;
        let resp = self
            .state
            .store
            .write(|batch| put_in(&self.state, batch, &req))?;
        tracing::trace!(
            key = %String::from_utf8_lossy(&req.key),
            revision = resp.header.as_ref().map_or(0, |h| h.revision),
            "put"
        );
        self.state.wake_watchers();
        Ok(resp)
    }

    /// Handle DeleteRange request.
    pub fn delete_range(
        &self,
        req: proto::DeleteRangeRequest,
    ) -> StorageResult<proto::DeleteRangeResponse> {
        let resp = self
            .state
            .store
            .write(|batch| delete_in(&self.state, batch, &req))?;
        if resp.deleted > 0 {
            self.state.wake_watchers();
        }
        Ok(resp)
    }

    /// Handle Txn request.
    pub fn txn(&self, req: proto::TxnRequest) -> StorageResult<proto::TxnResponse> {
        txn::validate(&req)?;
        let resp = self
            .state
            .store
            .write(|batch| txn::execute(&self.state, batch, &req))?;
        self.state.wake_watchers();
        Ok(resp)
    }

    /// Handle Compact request.
    pub fn compact(
        &self,
        req: proto::CompactionRequest,
    ) -> StorageResult<proto::CompactionResponse> {
        let removed = self.state.store.compact(req.revision)?;
        tracing::info!(revision = req.revision, removed, "compacted on request");
        let current = self.state.store.current_revision()?;
        Ok(proto::CompactionResponse {
            header: Some(self.state.header(current)),
        })
    }
}

/// Range inside an open write batch.
pub(super) fn range_in(
    state: &SharedState,
    batch: &WriteBatch<'_>,
    req: &proto::RangeRequest,
) -> StorageResult<proto::RangeResponse> {
    let range = KeyRange::new(&req.key, &req.range_end);
    let result = batch.range(&range, req.revision, fetch_limit(req))?;
    Ok(shape_range(state, req, result))
}

/// Put inside an open write batch.
pub(super) fn put_in(
    state: &SharedState,
    batch: &WriteBatch<'_>,
    req: &proto::PutRequest,
) -> StorageResult<proto::PutResponse> {
    let existing = if req.ignore_value || req.ignore_lease {
        Some(batch.get(&req.key)?.ok_or(StorageError::KeyNotFound)?)
    } else {
        None
    };

    let (value, lease) = match &existing {
        Some(current) => (
            if req.ignore_value { &current.value } else { &req.value },
            if req.ignore_lease { current.lease } else { req.lease },
        ),
        None => (&req.value, req.lease),
    };

    if lease != 0 && !batch.lease_exists(lease)? {
        return Err(StorageError::LeaseNotFound { lease_id: lease });
    }

    let (revision, prev) = batch.put(&req.key, value, lease)?;
    Ok(proto::PutResponse {
        header: Some(state.header(revision)),
        prev_kv: prev.filter(|_| req.prev_kv).map(to_key_value),
    })
}

/// DeleteRange inside an open write batch.
pub(super) fn delete_in(
    state: &SharedState,
    batch: &WriteBatch<'_>,
    req: &proto::DeleteRangeRequest,
) -> StorageResult<proto::DeleteRangeResponse> {
    if req.key.is_empty() {
        return Err(StorageError::invalid("etcdserver: key is not provided"));
    }
    let range = KeyRange::new(&req.key, &req.range_end);
    let deleted = batch.delete_range(&range)?;
    let revision = batch.revision()?;
    Ok(proto::DeleteRangeResponse {
        header: Some(state.header(revision)),
        deleted: deleted.len() as i64,
        prev_kvs: if req.prev_kv {
            deleted
                .into_iter()
                .map(|(_, record)| to_key_value(record))
                .collect()
        } else {
            Vec::new()
        },
    })
}

pub(super) fn validate_put(req: &proto::PutRequest) -> StorageResult<()> {
    if req.key.is_empty() {
        return Err(StorageError::invalid("etcdserver: key is not provided"));
    }
    if req.ignore_value && !req.value.is_empty() {
        return Err(StorageError::invalid("etcdserver: value is provided"));
    }
    if req.ignore_lease && req.lease != 0 {
        return Err(StorageError::invalid("etcdserver: lease is provided"));
    }
    Ok(())
}

/// Sort order after applying etcd's default: non-key targets sort ascending.
fn effective_order(req: &proto::RangeRequest) -> SortOrder {
    match (req.sort_order(), req.sort_target()) {
        (SortOrder::None, SortTarget::Key) => SortOrder::None,
        (SortOrder::None, _) => SortOrder::Ascend,
        (order, _) => order,
    }
}

fn has_revision_filters(req: &proto::RangeRequest) -> bool {
    req.min_mod_revision > 0
        || req.max_mod_revision > 0
        || req.min_create_revision > 0
        || req.max_create_revision > 0
}

/// The store returns keys in ascending order, so only other orderings and
/// revision filters need the whole range before the limit applies.
fn needs_full_scan(req: &proto::RangeRequest) -> bool {
    let natural = match effective_order(req) {
        SortOrder::None => true,
        SortOrder::Ascend => req.sort_target() == SortTarget::Key,
        SortOrder::Descend => false,
    };
    !natural || has_revision_filters(req)
}

fn fetch_limit(req: &proto::RangeRequest) -> Option<usize> {
    if req.limit <= 0 || needs_full_scan(req) {
        None
    } else {
        usize::try_from(req.limit).ok()
    }
}

fn passes_filters(req: &proto::RangeRequest, record: &KvRecord) -> bool {
    (req.min_mod_revision <= 0 || record.mod_revision >= req.min_mod_revision)
        && (req.max_mod_revision <= 0 || record.mod_revision <= req.max_mod_revision)
        && (req.min_create_revision <= 0 || record.create_revision >= req.min_create_revision)
        && (req.max_create_revision <= 0 || record.create_revision <= req.max_create_revision)
}

fn compare_by(target: SortTarget, a: &KvRecord, b: &KvRecord) -> Ordering {
    match target {
        SortTarget::Key => a.key.cmp(&b.key),
        SortTarget::Version => a.version.cmp(&b.version),
        SortTarget::Create => a.create_revision.cmp(&b.create_revision),
        SortTarget::Mod => a.mod_revision.cmp(&b.mod_revision),
        SortTarget::Value => a.value.cmp(&b.value),
    }
}

fn shape_range(
    state: &SharedState,
    req: &proto::RangeRequest,
    result: RangeResult,
) -> proto::RangeResponse {
    let RangeResult {
        mut records,
        count,
        mut more,
        revision,
    } = result;

    if needs_full_scan(req) {
        records.retain(|record| passes_filters(req, record));
        let target = req.sort_target();
        match effective_order(req) {
            SortOrder::Ascend => records.sort_by(|a, b| compare_by(target, a, b)),
            SortOrder::Descend => records.sort_by(|a, b| compare_by(target, b, a)),
            SortOrder::None => {}
        }
        if let Ok(limit) = usize::try_from(req.limit) {
            if limit > 0 && records.len() > limit {
                records.truncate(limit);
                more = true;
            }
        }
    }

    let kvs = if req.count_only {
        Vec::new()
    } else {
        records
            .into_iter()
            .map(|mut record| {
                if req.keys_only {
                    record.value.clear();
                }
                to_key_value(record)
            })
            .collect()
    };

    proto::RangeResponse {
        header: Some(state.header(revision)),
        kvs,
        more,
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::shared_state;
    use super::*;

    fn put(svc: &KvService, key: &str, value: &str) -> i64 {
        svc.put(proto::PutRequest {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        })
        .unwrap()
        .header
        .unwrap()
        .revision
    }

    fn prefix(p: &str) -> proto::RangeRequest {
        let KeyRange::Between(key, range_end) = KeyRange::prefix(p.as_bytes()) else {
            unreachable!()
        };
        proto::RangeRequest {
            key,
            range_end,
            ..Default::default()
        }
    }

    #[test]
    fn test_put_then_range_single_key() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        assert_eq!(put(&svc, "/registry/ns/default", "a"), 1);

        let resp = svc
            .range(proto::RangeRequest {
                key: b"/registry/ns/default".to_vec(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resp.count, 1);
        assert_eq!(resp.kvs[0].value, b"a");
        assert_eq!(resp.header.unwrap().revision, 1);
    }

    #[test]
    fn test_put_returns_prev_kv_when_asked() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        put(&svc, "k", "old");
        let resp = svc
            .put(proto::PutRequest {
                key: b"k".to_vec(),
                value: b"new".to_vec(),
                prev_kv: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resp.prev_kv.unwrap().value, b"old");
    }

    #[test]
    fn test_put_ignore_value_requires_existing_key() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        let err = svc
            .put(proto::PutRequest {
                key: b"missing".to_vec(),
                ignore_value: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyNotFound));

        put(&svc, "k", "keep");
        svc.put(proto::PutRequest {
            key: b"k".to_vec(),
            ignore_value: true,
            ..Default::default()
        })
        .unwrap();
        let resp = svc
            .range(proto::RangeRequest {
                key: b"k".to_vec(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resp.kvs[0].value, b"keep");
        assert_eq!(resp.kvs[0].version, 2);
    }

    #[test]
    fn test_put_with_unknown_lease_fails() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        let err = svc
            .put(proto::PutRequest {
                key: b"k".to_vec(),
                lease: 77,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::LeaseNotFound { lease_id: 77 }));
    }

    #[test]
    fn test_range_sorted_descending_by_mod_revision_with_limit() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        put(&svc, "/p/a", "1");
        put(&svc, "/p/b", "2");
        put(&svc, "/p/a", "3");

        let mut req = prefix("/p/");
        req.sort_order = SortOrder::Descend as i32;
        req.sort_target = SortTarget::Mod as i32;
        req.limit = 1;
        let resp = svc.range(req).unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(resp.kvs[0].key, b"/p/a");
        assert!(resp.more);
        assert_eq!(resp.count, 2);
    }

    #[test]
    fn test_range_count_only_and_keys_only() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        put(&svc, "/p/a", "1");
        put(&svc, "/p/b", "2");

        let mut req = prefix("/p/");
        req.count_only = true;
        let resp = svc.range(req).unwrap();
        assert!(resp.kvs.is_empty());
        assert_eq!(resp.count, 2);

        let mut req = prefix("/p/");
        req.keys_only = true;
        let resp = svc.range(req).unwrap();
        assert!(resp.kvs.iter().all(|kv| kv.value.is_empty()));
    }

    #[test]
    fn test_range_min_mod_revision_filter() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        put(&svc, "/p/a", "1");
        put(&svc, "/p/b", "2");
        let mut req = prefix("/p/");
        req.min_mod_revision = 2;
        let resp = svc.range(req).unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(resp.kvs[0].key, b"/p/b");
    }

    #[test]
    fn test_delete_range_reports_prev_kvs() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        put(&svc, "/p/a", "1");
        put(&svc, "/p/b", "2");
        put(&svc, "/q", "3");
        let mut req = proto::DeleteRangeRequest {
            prev_kv: true,
            ..Default::default()
        };
        let range = prefix("/p/");
        req.key = range.key;
        req.range_end = range.range_end;
        let resp = svc.delete_range(req).unwrap();
        assert_eq!(resp.deleted, 2);
        assert_eq!(resp.prev_kvs.len(), 2);
        assert_eq!(resp.header.unwrap().revision, 5);
    }

    #[test]
    fn test_compact_rejects_old_reads() {
        let (_dir, state) = shared_state();
        let svc = KvService::new(state);
        put(&svc, "k", "1");
        put(&svc, "k", "2");
        svc.compact(proto::CompactionRequest {
            revision: 2,
            physical: false,
        })
        .unwrap();
        let err = svc
            .range(proto::RangeRequest {
                key: b"k".to_vec(),
                revision: 1,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Compacted { .. }));
    }
}
