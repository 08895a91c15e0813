//! gRPC API for network and attachment management.
//!
//! The request [`Context`](crate::context::Context) travels as metadata so
//! the message types stay free of call-scoped fields.

pub mod convert;
pub mod server;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("mvirt.netns");
}

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::service::Service;
use proto::network_service_server::NetworkServiceServer;

pub use server::NetnsServiceImpl;

/// Namespace the call is scoped to.
pub const HEADER_NAMESPACE: &str = "mvirt-namespace";
/// Lease owning attachments created by the call.
pub const HEADER_LEASE: &str = "mvirt-lease";
/// Remaining caller deadline in milliseconds.
pub const HEADER_TIMEOUT_MS: &str = "mvirt-timeout-ms";

/// Serves `service` on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: Arc<dyn Service>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(NetworkServiceServer::new(NetnsServiceImpl::new(service)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}
