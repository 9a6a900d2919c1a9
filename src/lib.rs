//! kubelite - lightweight Kubernetes control plane for edge deployments.
//!
//! A single binary that prepares its data directory, starts a storage
//! backend and then the control-plane components against it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Components                              │
//! │  apiserver │ controller-manager │ scheduler │ kubelet │ proxy   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │  StorageEndpoint
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Storage backend                           │
//! │   single: embedded etcd API on unix://<data>/kine.sock          │
//! │   ha:     external etcd cluster                                 │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                SQLite MVCC log (<data>/db/state.db)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core::config`] - Configuration layers and validation
//! - [`core::server`] - Start and shutdown orchestration
//! - [`core::lifecycle`] - Lifecycle state machine
//! - [`core::version`] - Build information
//! - [`storage`] - Backend selection, SQLite log, compaction
//! - [`adapters::etcd`] - etcd v3 gRPC service over the SQLite log
//! - [`components`] - Control-plane component contract
//! - [`cli`] - Command-line interface

pub mod core;

pub mod storage;

pub mod adapters;

pub mod components;

pub mod cli;

pub use self::core::{config, error, lifecycle, server, time, version};
pub use adapters::etcd;
pub use server::Server;
