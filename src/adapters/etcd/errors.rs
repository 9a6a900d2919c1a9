//! etcd adapter error mapping.
//!
//! Storage errors map to the gRPC codes etcd uses for the same conditions:
//! - compacted revision → OUT_OF_RANGE
//! - future revision → OUT_OF_RANGE
//! - missing lease or key → NOT_FOUND
//! - lock contention and pool exhaustion → UNAVAILABLE

use tonic::{Code, Status};

use crate::core::error::StorageError;

/// Map a storage error to the gRPC code etcd would return.
pub fn grpc_code(err: &StorageError) -> Code {
    match err {
        StorageError::Compacted { .. } | StorageError::FutureRevision { .. } => Code::OutOfRange,
        StorageError::LeaseNotFound { .. } | StorageError::KeyNotFound => Code::NotFound,
        StorageError::LeaseExists { .. } => Code::FailedPrecondition,
        StorageError::InvalidRequest { .. } => Code::InvalidArgument,
        e if e.is_retriable() => Code::Unavailable,
        _ => Code::Internal,
    }
}

/// Convert a storage error into a gRPC status carrying etcd's message.
pub fn to_status(err: StorageError) -> Status {
    let code = grpc_code(&err);
    if code == Code::Internal {
        tracing::warn!(error = %err, "storage request failed");
    }
    Status::new(code, err.to_string())
}
