//! gRPC NetworkService implementation.

use std::sync::Arc;
use std::time::Duration;

use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use super::convert::{
    attachment_args_from_proto, attachment_info_to_proto, filter_from_proto,
    network_config_from_proto, network_info_to_proto,
};
use super::proto::network_service_server::NetworkService;
use super::proto::*;
use super::{HEADER_LEASE, HEADER_NAMESPACE, HEADER_TIMEOUT_MS};
use crate::context::Context;
use crate::error::Error;
use crate::service::Service;
use crate::types::NetworkOptions;

/// Serves a [`Service`] (normally the daemon's `Local`) over gRPC.
pub struct NetnsServiceImpl {
    service: Arc<dyn Service>,
}

impl NetnsServiceImpl {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self { service }
    }
}

fn header<'a>(metadata: &'a MetadataMap, key: &str) -> Result<Option<&'a str>, Status> {
    match metadata.get(key) {
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| Status::invalid_argument(format!("metadata {key} is not valid ascii"))),
        None => Ok(None),
    }
}

/// Rebuilds the caller's [`Context`] from request metadata.
fn context_from_metadata(metadata: &MetadataMap) -> Result<Context, Status> {
    let mut ctx = Context::new();
    if let Some(ns) = header(metadata, HEADER_NAMESPACE)? {
        ctx = Context::with_namespace(ns);
    }
    if let Some(lease) = header(metadata, HEADER_LEASE)? {
        ctx = ctx.lease(lease);
    }
    if let Some(ms) = header(metadata, HEADER_TIMEOUT_MS)? {
        let ms: u64 = ms
            .parse()
            .map_err(|_| Status::invalid_argument(format!("metadata {HEADER_TIMEOUT_MS} is not a number")))?;
        ctx = ctx.timeout(Duration::from_millis(ms));
    }
    Ok(ctx)
}

fn status(op: &str, e: Error) -> Status {
    if e.is_not_found() {
        debug!(op, error = %e, "request failed");
    } else {
        warn!(op, error = %e, "request failed");
    }
    e.into()
}

#[tonic::async_trait]
impl NetworkService for NetnsServiceImpl {
    async fn create_network(
        &self,
        request: Request<CreateNetworkRequest>,
    ) -> Result<Response<CreateNetworkResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let opts = NetworkOptions {
            config: network_config_from_proto(req.config).map_err(Status::from)?,
            labels: req.labels.into_iter().collect(),
        };

        let info = self
            .service
            .create_network(&ctx, &req.network_manager, &req.network_name, opts)
            .await
            .map_err(|e| status("create_network", e))?;

        Ok(Response::new(CreateNetworkResponse {
            network: Some(network_info_to_proto(&info)),
        }))
    }

    async fn delete_network(
        &self,
        request: Request<DeleteNetworkRequest>,
    ) -> Result<Response<DeleteNetworkResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        self.service
            .delete_network(&ctx, &req.network_manager, &req.network_name)
            .await
            .map_err(|e| status("delete_network", e))?;
        Ok(Response::new(DeleteNetworkResponse {}))
    }

    async fn get_network(
        &self,
        request: Request<GetNetworkRequest>,
    ) -> Result<Response<GetNetworkResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let info = self
            .service
            .get_network(&ctx, &req.network_manager, &req.network_name)
            .await
            .map_err(|e| status("get_network", e))?;
        Ok(Response::new(GetNetworkResponse {
            network: Some(network_info_to_proto(&info)),
        }))
    }

    async fn list_networks(
        &self,
        request: Request<ListNetworksRequest>,
    ) -> Result<Response<ListNetworksResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let networks = self
            .service
            .list_networks(&ctx, &req.network_manager)
            .await
            .map_err(|e| status("list_networks", e))?;
        Ok(Response::new(ListNetworksResponse {
            networks: networks.iter().map(network_info_to_proto).collect(),
        }))
    }

    async fn attach_network(
        &self,
        request: Request<AttachNetworkRequest>,
    ) -> Result<Response<AttachNetworkResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let manager = req.network_manager.clone();
        let network = req.network_name.clone();
        let args = attachment_args_from_proto(req).map_err(Status::from)?;

        let info = self
            .service
            .attach_network(&ctx, &manager, &network, args)
            .await
            .map_err(|e| status("attach_network", e))?;
        Ok(Response::new(AttachNetworkResponse {
            attachment: Some(attachment_info_to_proto(&info)),
        }))
    }

    async fn detach_network(
        &self,
        request: Request<DetachNetworkRequest>,
    ) -> Result<Response<DetachNetworkResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        self.service
            .detach_network(&ctx, &req.network_manager, &req.network_name, &req.attachment_id)
            .await
            .map_err(|e| status("detach_network", e))?;
        Ok(Response::new(DetachNetworkResponse {}))
    }

    async fn get_attachment(
        &self,
        request: Request<GetAttachmentRequest>,
    ) -> Result<Response<GetAttachmentResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let info = self
            .service
            .get_attachment(&ctx, &req.network_manager, &req.network_name, &req.attachment_id)
            .await
            .map_err(|e| status("get_attachment", e))?;
        Ok(Response::new(GetAttachmentResponse {
            attachment: Some(attachment_info_to_proto(&info)),
        }))
    }

    async fn check_attachment(
        &self,
        request: Request<CheckAttachmentRequest>,
    ) -> Result<Response<CheckAttachmentResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let ok = self
            .service
            .check_attachment(&ctx, &req.network_manager, &req.network_name, &req.attachment_id)
            .await
            .map_err(|e| status("check_attachment", e))?;
        Ok(Response::new(CheckAttachmentResponse { ok }))
    }

    async fn list_attachments(
        &self,
        request: Request<ListAttachmentsRequest>,
    ) -> Result<Response<ListAttachmentsResponse>, Status> {
        let ctx = context_from_metadata(request.metadata())?;
        let req = request.into_inner();
        let filter = filter_from_proto(&req);
        let attachments = self
            .service
            .list_attachments(&ctx, &req.network_manager, &req.network_name, &filter)
            .await
            .map_err(|e| status("list_attachments", e))?;
        Ok(Response::new(ListAttachmentsResponse {
            attachments: attachments.iter().map(attachment_info_to_proto).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn test_context_from_metadata() {
        let mut md = MetadataMap::new();
        md.insert(HEADER_NAMESPACE, MetadataValue::from_static("ns1"));
        md.insert(HEADER_LEASE, MetadataValue::from_static("lease-a"));
        md.insert(HEADER_TIMEOUT_MS, MetadataValue::from_static("5000"));

        let ctx = context_from_metadata(&md).unwrap();
        assert_eq!(ctx.namespace(), Some("ns1"));
        assert_eq!(ctx.lease_id(), Some("lease-a"));
        let left = ctx.remaining().unwrap();
        assert!(left <= Duration::from_secs(5) && left > Duration::from_secs(4));
    }

    #[test]
    fn test_missing_namespace_left_to_service() {
        let ctx = context_from_metadata(&MetadataMap::new()).unwrap();
        assert_eq!(ctx.namespace(), None);
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn test_bad_timeout_rejected() {
        let mut md = MetadataMap::new();
        md.insert(HEADER_TIMEOUT_MS, MetadataValue::from_static("soon"));
        let err = context_from_metadata(&md).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
