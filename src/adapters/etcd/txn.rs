//! etcd transaction operations.
//!
//! A Txn evaluates every Compare against the latest state, then runs either
//! the success or the failure ops inside the same store transaction. Each
//! write op inside the branch gets its own revision, so a branch may put a
//! given key at most once.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::kv::{delete_in, put_in, range_in, validate_put};
use super::proto::compare::{CompareResult, CompareTarget, TargetUnion};
use super::proto::{self, request_op::Request, response_op::Response};
use super::SharedState;
use crate::core::error::{StorageError, StorageResult};
use crate::storage::sqlite::{KeyRange, KvRecord, WriteBatch};

/// Maximum number of ops in one branch, matching etcd's default.
pub const MAX_TXN_OPS: usize = 128;

/// Maximum nesting depth of Txn ops.
pub const MAX_TXN_DEPTH: usize = 8;

/// Reject oversized or malformed transactions before opening a batch.
pub fn validate(req: &proto::TxnRequest) -> StorageResult<()> {
    validate_depth(req, 0)?;
    put_keys(&req.success)?;
    put_keys(&req.failure)?;
    Ok(())
}

/// Keys written by Put ops in one branch, nested branches included.
fn put_keys(ops: &[proto::RequestOp]) -> StorageResult<HashSet<&[u8]>> {
    let duplicate = || StorageError::invalid("etcdserver: duplicate key given in txn request");
    let mut keys = HashSet::new();
    for op in ops {
        match &op.request {
            Some(Request::RequestPut(put)) => {
                if !keys.insert(put.key.as_slice()) {
                    return Err(duplicate());
                }
            }
            Some(Request::RequestTxn(nested)) => {
                // Only one nested branch runs, so they may share keys.
                let success = put_keys(&nested.success)?;
                let failure = put_keys(&nested.failure)?;
                for key in success.union(&failure) {
                    if !keys.insert(*key) {
                        return Err(duplicate());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(keys)
}

fn validate_depth(req: &proto::TxnRequest, depth: usize) -> StorageResult<()> {
    if depth > MAX_TXN_DEPTH {
        return Err(StorageError::invalid(
            "etcdserver: too many nested txn requests",
        ));
    }
    if req.compare.len() > MAX_TXN_OPS
        || req.success.len() > MAX_TXN_OPS
        || req.failure.len() > MAX_TXN_OPS
    {
        return Err(StorageError::invalid(
            "etcdserver: too many operations in txn request",
        ));
    }
    for op in req.success.iter().chain(&req.failure) {
        match &op.request {
            Some(Request::RequestPut(put)) => validate_put(put)?,
            Some(Request::RequestTxn(nested)) => validate_depth(nested, depth + 1)?,
            Some(_) => {}
            None => return Err(StorageError::invalid("etcdserver: request op is empty")),
        }
    }
    Ok(())
}

/// Evaluate compares and run the chosen branch.
pub(super) fn execute(
    state: &SharedState,
    batch: &WriteBatch<'_>,
    req: &proto::TxnRequest,
) -> StorageResult<proto::TxnResponse> {
    let succeeded = compares_hold(batch, &req.compare)?;
    let ops = if succeeded { &req.success } else { &req.failure };

    let mut responses = Vec::with_capacity(ops.len());
    for op in ops {
        responses.push(apply_op(state, batch, op)?);
    }

    Ok(proto::TxnResponse {
        header: Some(state.header(batch.revision()?)),
        succeeded,
        responses,
    })
}

fn apply_op(
    state: &SharedState,
    batch: &WriteBatch<'_>,
    op: &proto::RequestOp,
) -> StorageResult<proto::ResponseOp> {
    let response = match &op.request {
        Some(Request::RequestRange(r)) => Response::ResponseRange(range_in(state, batch, r)?),
        Some(Request::RequestPut(r)) => Response::ResponsePut(put_in(state, batch, r)?),
        Some(Request::RequestDeleteRange(r)) => {
            Response::ResponseDeleteRange(delete_in(state, batch, r)?)
        }
        Some(Request::RequestTxn(r)) => Response::ResponseTxn(execute(state, batch, r)?),
        None => return Err(StorageError::invalid("etcdserver: request op is empty")),
    };
    Ok(proto::ResponseOp {
        response: Some(response),
    })
}

fn compares_hold(batch: &WriteBatch<'_>, compares: &[proto::Compare]) -> StorageResult<bool> {
    for cmp in compares {
        if !compare_holds(batch, cmp)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A missing key compares as zero for numeric targets and fails value compares.
fn compare_holds(batch: &WriteBatch<'_>, cmp: &proto::Compare) -> StorageResult<bool> {
    let range = KeyRange::new(&cmp.key, &cmp.range_end);
    let records = batch.range(&range, 0, None)?.records;
    if records.is_empty() {
        return Ok(cmp.target() != CompareTarget::Value
            && evaluate(cmp, &KvRecord::default()));
    }
    Ok(records.iter().all(|record| evaluate(cmp, record)))
}

/// Evaluate one compare against one record.
pub fn evaluate(cmp: &proto::Compare, record: &KvRecord) -> bool {
    let ordering = match cmp.target() {
        CompareTarget::Value => {
            let expected: &[u8] = match &cmp.target_union {
                Some(TargetUnion::Value(v)) => v.as_slice(),
                _ => &[],
            };
            record.value.as_slice().cmp(expected)
        }
        CompareTarget::Version => record.version.cmp(&int_target(cmp)),
        CompareTarget::Create => record.create_revision.cmp(&int_target(cmp)),
        CompareTarget::Mod => record.mod_revision.cmp(&int_target(cmp)),
        CompareTarget::Lease => record.lease.cmp(&int_target(cmp)),
    };
    match cmp.result() {
        CompareResult::Equal => ordering == Ordering::Equal,
        CompareResult::Greater => ordering == Ordering::Greater,
        CompareResult::Less => ordering == Ordering::Less,
        CompareResult::NotEqual => ordering != Ordering::Equal,
    }
}

fn int_target(cmp: &proto::Compare) -> i64 {
    match cmp.target_union {
        Some(
            TargetUnion::Version(v)
            | TargetUnion::CreateRevision(v)
            | TargetUnion::ModRevision(v)
            | TargetUnion::Lease(v),
        ) => v,
        _ => 0,
    }
}
