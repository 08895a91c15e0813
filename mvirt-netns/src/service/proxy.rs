//! Remote service adapter, forwarding every call over gRPC.

use async_trait::async_trait;
use tonic::Request;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;

use super::Service;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::grpc::convert::{
    attach_request, attachment_info_from_proto, network_config_to_proto, network_info_from_proto,
};
use crate::grpc::proto::{self, network_service_client::NetworkServiceClient};
use crate::grpc::{HEADER_LEASE, HEADER_NAMESPACE, HEADER_TIMEOUT_MS};
use crate::types::{AttachmentArgs, AttachmentFilter, AttachmentInfo, NetworkInfo, NetworkOptions};

/// [`Service`] backed by a remote `mvirt-netns` daemon.
#[derive(Clone)]
pub struct Proxy {
    client: NetworkServiceClient<Channel>,
}

impl Proxy {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: NetworkServiceClient::new(channel),
        }
    }

    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let client = NetworkServiceClient::connect(endpoint.clone())
            .await
            .map_err(|e| Error::Unknown(format!("cannot connect to {endpoint}: {e}")))?;
        Ok(Self { client })
    }

    fn client(&self) -> NetworkServiceClient<Channel> {
        self.client.clone()
    }
}

fn metadata_value(what: &str, s: &str) -> Result<AsciiMetadataValue> {
    s.parse()
        .map_err(|_| Error::InvalidArgument(format!("{what} {s:?} cannot be sent as metadata")))
}

/// Wraps `msg` with the context carried as metadata.
///
/// A malformed namespace or lease fails here, as it would in [`Local`].
/// An expired deadline is still sent, as `0`, so the server reports it
/// after its own manager check.
///
/// [`Local`]: super::Local
fn request<T>(ctx: &Context, msg: T) -> Result<Request<T>> {
    ctx.validate()?;
    let mut req = Request::new(msg);
    let md = req.metadata_mut();
    if let Some(ns) = ctx.namespace() {
        md.insert(HEADER_NAMESPACE, metadata_value("namespace", ns)?);
    }
    if let Some(lease) = ctx.lease_id() {
        md.insert(HEADER_LEASE, metadata_value("lease", lease)?);
    }
    if let Some(left) = ctx.remaining() {
        let ms = left.as_millis().to_string();
        md.insert(HEADER_TIMEOUT_MS, metadata_value("timeout", &ms)?);
        if !left.is_zero() {
            req.set_timeout(left);
        }
    }
    Ok(req)
}

fn missing(what: &str) -> Error {
    Error::Internal(format!("response is missing {what}"))
}

#[async_trait]
impl Service for Proxy {
    async fn create_network(
        &self,
        ctx: &Context,
        manager: &str,
        name: &str,
        opts: NetworkOptions,
    ) -> Result<NetworkInfo> {
        let req = request(
            ctx,
            proto::CreateNetworkRequest {
                network_manager: manager.to_string(),
                network_name: name.to_string(),
                config: Some(network_config_to_proto(&opts.config)),
                labels: opts.labels.into_iter().collect(),
            },
        )?;
        let resp = self.client().create_network(req).await?.into_inner();
        network_info_from_proto(resp.network.ok_or_else(|| missing("network"))?)
    }

    async fn delete_network(&self, ctx: &Context, manager: &str, name: &str) -> Result<()> {
        let req = request(
            ctx,
            proto::DeleteNetworkRequest {
                network_manager: manager.to_string(),
                network_name: name.to_string(),
            },
        )?;
        self.client().delete_network(req).await?;
        Ok(())
    }

    async fn get_network(&self, ctx: &Context, manager: &str, name: &str) -> Result<NetworkInfo> {
        let req = request(
            ctx,
            proto::GetNetworkRequest {
                network_manager: manager.to_string(),
                network_name: name.to_string(),
            },
        )?;
        let resp = self.client().get_network(req).await?.into_inner();
        network_info_from_proto(resp.network.ok_or_else(|| missing("network"))?)
    }

    async fn list_networks(&self, ctx: &Context, manager: &str) -> Result<Vec<NetworkInfo>> {
        let req = request(
            ctx,
            proto::ListNetworksRequest {
                network_manager: manager.to_string(),
            },
        )?;
        let resp = self.client().list_networks(req).await?.into_inner();
        resp.networks
            .into_iter()
            .map(network_info_from_proto)
            .collect()
    }

    async fn attach_network(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        args: AttachmentArgs,
    ) -> Result<AttachmentInfo> {
        let req = request(ctx, attach_request(manager, network, &args)?)?;
        let resp = self.client().attach_network(req).await?.into_inner();
        attachment_info_from_proto(resp.attachment.ok_or_else(|| missing("attachment"))?)
    }

    async fn detach_network(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<()> {
        let req = request(
            ctx,
            proto::DetachNetworkRequest {
                network_manager: manager.to_string(),
                network_name: network.to_string(),
                attachment_id: id.to_string(),
            },
        )?;
        self.client().detach_network(req).await?;
        Ok(())
    }

    async fn get_attachment(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<AttachmentInfo> {
        let req = request(
            ctx,
            proto::GetAttachmentRequest {
                network_manager: manager.to_string(),
                network_name: network.to_string(),
                attachment_id: id.to_string(),
            },
        )?;
        let resp = self.client().get_attachment(req).await?.into_inner();
        attachment_info_from_proto(resp.attachment.ok_or_else(|| missing("attachment"))?)
    }

    async fn check_attachment(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<bool> {
        let req = request(
            ctx,
            proto::CheckAttachmentRequest {
                network_manager: manager.to_string(),
                network_name: network.to_string(),
                attachment_id: id.to_string(),
            },
        )?;
        Ok(self.client().check_attachment(req).await?.into_inner().ok)
    }

    async fn list_attachments(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        filter: &AttachmentFilter,
    ) -> Result<Vec<AttachmentInfo>> {
        let req = request(
            ctx,
            proto::ListAttachmentsRequest {
                network_manager: manager.to_string(),
                network_name: network.to_string(),
                container: filter.container.clone().unwrap_or_default(),
                ifname: filter.ifname.clone().unwrap_or_default(),
            },
        )?;
        let resp = self.client().list_attachments(req).await?.into_inner();
        resp.attachments
            .into_iter()
            .map(attachment_info_from_proto)
            .collect()
    }
}
