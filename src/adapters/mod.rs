//! Protocol adapters.
//!
//! - [`etcd`] - etcd v3 gRPC API served by the embedded store

pub mod etcd;
