//! In-process service adapter.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::Service;
use crate::audit::NetnsAuditLogger;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::types::{
    AttachmentArgs, AttachmentFilter, AttachmentInfo, AttachmentKey, NetworkInfo, NetworkOptions,
    attachment_id,
};

/// Dispatches service calls to the configured managers.
pub struct Local {
    managers: BTreeMap<String, Arc<dyn Manager>>,
    audit: Arc<NetnsAuditLogger>,
}

impl Local {
    pub fn new(
        managers: impl IntoIterator<Item = Arc<dyn Manager>>,
        audit: Arc<NetnsAuditLogger>,
    ) -> Self {
        let managers = managers
            .into_iter()
            .map(|m| (m.name().to_string(), m))
            .collect();
        Self { managers, audit }
    }

    /// Names of the configured managers.
    pub fn managers(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    /// Resolves the manager, then checks the context. Every call goes
    /// through here before touching the store or a plugin.
    fn manager(&self, ctx: &Context, name: &str) -> Result<&Arc<dyn Manager>> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "network manager name missing".to_string(),
            ));
        }
        let manager = self.managers.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!("network manager not configured: {name}"))
        })?;
        ctx.validate()?;
        ctx.check_deadline()?;
        Ok(manager)
    }
}

#[async_trait]
impl Service for Local {
    async fn create_network(
        &self,
        ctx: &Context,
        manager: &str,
        name: &str,
        opts: NetworkOptions,
    ) -> Result<NetworkInfo> {
        let m = self.manager(ctx, manager)?;
        let network = m.create(ctx, name, opts).await?;
        self.audit
            .network_created(ctx.namespace().unwrap_or_default(), manager, name);
        Ok(network.info().clone())
    }

    async fn delete_network(&self, ctx: &Context, manager: &str, name: &str) -> Result<()> {
        let m = self.manager(ctx, manager)?;
        m.delete(ctx, name).await?;
        self.audit
            .network_deleted(ctx.namespace().unwrap_or_default(), manager, name);
        Ok(())
    }

    async fn get_network(&self, ctx: &Context, manager: &str, name: &str) -> Result<NetworkInfo> {
        let m = self.manager(ctx, manager)?;
        let network = m.network(ctx, name).await?;
        Ok(network.info().clone())
    }

    async fn list_networks(&self, ctx: &Context, manager: &str) -> Result<Vec<NetworkInfo>> {
        let m = self.manager(ctx, manager)?;
        let mut networks = Vec::new();
        m.walk(ctx, &mut |n| {
            networks.push(n.info().clone());
            ControlFlow::Continue(())
        })
        .await?;
        debug!(manager, count = networks.len(), "listed networks");
        Ok(networks)
    }

    async fn attach_network(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        args: AttachmentArgs,
    ) -> Result<AttachmentInfo> {
        let m = self.manager(ctx, manager)?;
        let net = m.network(ctx, network).await?;
        let id = attachment_id(
            manager,
            network,
            ctx.namespace().unwrap_or_default(),
            &args.container,
            &args.ifname,
        );

        match net.attach(ctx, args).await {
            Ok(attachment) => {
                let info = attachment.info();
                info!(
                    manager,
                    network,
                    attachment = %info.id,
                    interfaces = info.interfaces.len(),
                    "attached container"
                );
                self.audit.attachment_added(&info.id, info.lease.as_deref());
                Ok(info)
            }
            Err(e) => {
                self.audit.attachment_failed(&id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn detach_network(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<()> {
        let m = self.manager(ctx, manager)?;
        let net = m.network(ctx, network).await?;
        let attachment = net.attachment(ctx, id).await?;
        attachment.remove(ctx).await?;
        self.audit.attachment_removed(id);
        Ok(())
    }

    async fn get_attachment(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<AttachmentInfo> {
        let m = self.manager(ctx, manager)?;
        let net = m.network(ctx, network).await?;
        Ok(net.attachment(ctx, id).await?.info())
    }

    async fn check_attachment(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<bool> {
        let m = self.manager(ctx, manager)?;
        let net = m.network(ctx, network).await?;
        let attachment = net.attachment(ctx, id).await?;
        match attachment.check(ctx).await {
            Ok(()) => Ok(true),
            Err(Error::Unhealthy(msg)) => {
                info!(attachment = id, %msg, "attachment check failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_attachments(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        filter: &AttachmentFilter,
    ) -> Result<Vec<AttachmentInfo>> {
        let m = self.manager(ctx, manager)?;
        let net = m.network(ctx, network).await?;
        let mut out = Vec::new();
        net.walk(ctx, &mut |a| {
            let keep = match AttachmentKey::parse(a.id()) {
                Ok(key) => filter.matches(&key.container, &key.ifname),
                Err(_) => false,
            };
            if keep {
                out.push(a.info());
            }
            ControlFlow::Continue(())
        })
        .await?;
        Ok(out)
    }
}
