//! gRPC server implementation for the etcd v3 API.
//!
//! Each etcd service is a small tonic service wrapper that routes by method
//! path and hands the request to [`tonic::server::Grpc`] with a prost codec.
//! Unary handlers are synchronous store calls and run on the blocking pool.
//! Streaming handlers spawn their own task and answer through a channel.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::net::UnixListener;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, StreamingService, UnaryService};
use tonic::transport::Server;
use tonic::{Status, Streaming};

use super::{
    proto, run_blocking, to_status, KvService, LeaseService, MaintenanceService, SharedState,
    WatchHub, WatchService,
};
use crate::core::error::{StorageError, StorageResult};
use crate::storage::compaction::{run_compactor, CompactionPolicy};

type UnaryHandler<S, Req, Resp> = fn(&S, Req) -> StorageResult<Resp>;
type StreamHandler<S, Req, Resp> = fn(&S, Streaming<Req>) -> ReceiverStream<Result<Resp, Status>>;

/// Unary method backed by a synchronous service call.
struct BlockingUnary<S, Req, Resp> {
    service: S,
    handler: UnaryHandler<S, Req, Resp>,
}

impl<S, Req, Resp> UnaryService<Req> for BlockingUnary<S, Req, Resp>
where
    S: Clone + Send + Sync + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<tonic::Response<Resp>, Status>;

    fn call(&mut self, request: tonic::Request<Req>) -> Self::Future {
        let service = self.service.clone();
        let handler = self.handler;
        Box::pin(async move {
            let message = request.into_inner();
            run_blocking(move || handler(&service, message))
                .await
                .map(tonic::Response::new)
                .map_err(to_status)
        })
    }
}

/// Bidirectional streaming method.
struct BidiStream<S, Req, Resp> {
    service: S,
    handler: StreamHandler<S, Req, Resp>,
}

impl<S, Req, Resp> StreamingService<Req> for BidiStream<S, Req, Resp>
where
    S: Send + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type ResponseStream = ReceiverStream<Result<Resp, Status>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<Req>>) -> Self::Future {
        let stream = (self.handler)(&self.service, request.into_inner());
        Box::pin(async move { Ok(tonic::Response::new(stream)) })
    }
}

fn unary<S, Req, Resp, B>(
    service: S,
    req: http::Request<B>,
    handler: UnaryHandler<S, Req, Resp>,
) -> BoxFuture<http::Response<BoxBody>, Infallible>
where
    S: Clone + Send + Sync + 'static,
    Req: prost::Message + Default + Send + 'static,
    Resp: prost::Message + Send + 'static,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    Box::pin(async move {
        let mut grpc = Grpc::new(ProstCodec::<Resp, Req>::default());
        Ok(grpc.unary(BlockingUnary { service, handler }, req).await)
    })
}

fn streaming<S, Req, Resp, B>(
    service: S,
    req: http::Request<B>,
    handler: StreamHandler<S, Req, Resp>,
) -> BoxFuture<http::Response<BoxBody>, Infallible>
where
    S: Send + 'static,
    Req: prost::Message + Default + Send + 'static,
    Resp: prost::Message + Send + 'static,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    Box::pin(async move {
        let mut grpc = Grpc::new(ProstCodec::<Resp, Req>::default());
        Ok(grpc.streaming(BidiStream { service, handler }, req).await)
    })
}

fn unimplemented(path: &str) -> BoxFuture<http::Response<BoxBody>, Infallible> {
    tracing::debug!(path, "unimplemented etcd method");
    let status = Status::unimplemented(format!("unknown method {path}"));
    Box::pin(async move { Ok(status.into_http()) })
}

// ============================================================================
// Tonic Service Wrappers
// ============================================================================

macro_rules! grpc_service {
    ($server:ident, $inner:ty, $name:literal) => {
        #[derive(Clone)]
        pub struct $server {
            inner: $inner,
        }

        impl $server {
            pub fn new(inner: $inner) -> Self {
                Self { inner }
            }
        }

        impl NamedService for $server {
            const NAME: &'static str = $name;
        }
    };
}

grpc_service!(EtcdKvServer, KvService, "etcdserverpb.KV");
grpc_service!(EtcdWatchServer, WatchService, "etcdserverpb.Watch");
grpc_service!(EtcdLeaseServer, LeaseService, "etcdserverpb.Lease");
grpc_service!(EtcdMaintenanceServer, MaintenanceService, "etcdserverpb.Maintenance");

impl<B> Service<http::Request<B>> for EtcdKvServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.KV/Range" => unary(inner, req, KvService::range),
            "/etcdserverpb.KV/Put" => unary(inner, req, KvService::put),
            "/etcdserverpb.KV/DeleteRange" => unary(inner, req, KvService::delete_range),
            "/etcdserverpb.KV/Txn" => unary(inner, req, KvService::txn),
            "/etcdserverpb.KV/Compact" => unary(inner, req, KvService::compact),
            other => unimplemented(other),
        }
    }
}

impl<B> Service<http::Request<B>> for EtcdWatchServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Watch/Watch" => streaming(
                inner,
                req,
                WatchService::watch_stream::<Streaming<proto::WatchRequest>>,
            ),
            other => unimplemented(other),
        }
    }
}

impl<B> Service<http::Request<B>> for EtcdLeaseServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Lease/LeaseGrant" => unary(inner, req, LeaseService::grant),
            "/etcdserverpb.Lease/LeaseRevoke" => unary(inner, req, LeaseService::revoke),
            "/etcdserverpb.Lease/LeaseTimeToLive" => {
                unary(inner, req, LeaseService::time_to_live)
            }
            "/etcdserverpb.Lease/LeaseLeases" => unary(inner, req, LeaseService::leases),
            "/etcdserverpb.Lease/LeaseKeepAlive" => streaming(
                inner,
                req,
                LeaseService::keep_alive_stream::<Streaming<proto::LeaseKeepAliveRequest>>,
            ),
            other => unimplemented(other),
        }
    }
}

impl<B> Service<http::Request<B>> for EtcdMaintenanceServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/etcdserverpb.Maintenance/Status" => unary(inner, req, MaintenanceService::status),
            other => unimplemented(other),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Bind the endpoint socket, replacing a stale socket file.
pub fn bind_unix(socket_path: &Path) -> StorageResult<UnixListener> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => tracing::debug!(socket = %socket_path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StorageError::Io {
                path: socket_path.to_path_buf(),
                source,
            })
        }
    }
    UnixListener::bind(socket_path).map_err(|source| StorageError::Bind {
        path: socket_path.to_path_buf(),
        source,
    })
}

/// Serve the etcd API on `listener` until shutdown is signalled.
///
/// Runs the watch poller, the lease sweeper and the compactor alongside the
/// server, and removes the socket file on exit.
pub async fn serve_unix(
    state: SharedState,
    listener: UnixListener,
    socket_path: PathBuf,
) -> StorageResult<()> {
    let hub = WatchHub::new(state.clone())?;
    let background = [
        tokio::spawn(hub.run()),
        tokio::spawn(LeaseService::new(state.clone()).run_sweeper()),
        tokio::spawn(run_compactor(
            Arc::clone(&state.store),
            CompactionPolicy::from_config(&state.settings),
            state.shutdown_rx.clone(),
        )),
    ];

    tracing::info!(socket = %socket_path.display(), "embedded etcd endpoint listening");

    let signal_state = state.clone();
    let result = Server::builder()
        .add_service(EtcdKvServer::new(KvService::new(state.clone())))
        .add_service(EtcdWatchServer::new(WatchService::new(state.clone())))
        .add_service(EtcdLeaseServer::new(LeaseService::new(state.clone())))
        .add_service(EtcdMaintenanceServer::new(MaintenanceService::new(state)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            signal_state.shutdown_requested().await;
            tracing::info!("embedded etcd endpoint shutting down");
        })
        .await;

    if result.is_err() {
        for task in &background {
            task.abort();
        }
    }
    for task in background {
        let _ = task.await;
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(socket = %socket_path.display(), error = %e, "failed to remove socket");
        }
    }

    result.map_err(StorageError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kine.sock");
        std::fs::write(&path, b"stale").unwrap();
        let listener = bind_unix(&path).unwrap();
        drop(listener);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bind_reports_missing_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("kine.sock");
        assert!(matches!(
            bind_unix(&path),
            Err(StorageError::Bind { .. })
        ));
    }

    #[test]
    fn test_service_names() {
        assert_eq!(EtcdKvServer::NAME, "etcdserverpb.KV");
        assert_eq!(EtcdWatchServer::NAME, "etcdserverpb.Watch");
        assert_eq!(EtcdLeaseServer::NAME, "etcdserverpb.Lease");
        assert_eq!(EtcdMaintenanceServer::NAME, "etcdserverpb.Maintenance");
    }
}
