//! Manager, network and attachment handles on top of any [`Service`].
//!
//! Lets a caller hold the same object traits whether the networks live in
//! this process or behind a [`super::Proxy`].

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;

use super::Service;
use crate::attachment::Attachment;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::{Manager, NetworkVisitor};
use crate::network::{AttachmentVisitor, Network};
use crate::types::{AttachmentArgs, AttachmentFilter, AttachmentInfo, NetworkInfo, NetworkOptions};

pub struct RemoteManager {
    name: String,
    service: Arc<dyn Service>,
}

impl RemoteManager {
    pub fn new(name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        Self {
            name: name.into(),
            service,
        }
    }

    fn wrap(&self, info: NetworkInfo) -> Arc<dyn Network> {
        Arc::new(RemoteNetwork {
            info,
            service: self.service.clone(),
        })
    }
}

#[async_trait]
impl Manager for RemoteManager {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(
        &self,
        ctx: &Context,
        name: &str,
        opts: NetworkOptions,
    ) -> Result<Arc<dyn Network>> {
        let info = self
            .service
            .create_network(ctx, &self.name, name, opts)
            .await?;
        Ok(self.wrap(info))
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.service.delete_network(ctx, &self.name, name).await
    }

    async fn network(&self, ctx: &Context, name: &str) -> Result<Arc<dyn Network>> {
        let info = self.service.get_network(ctx, &self.name, name).await?;
        Ok(self.wrap(info))
    }

    async fn walk(&self, ctx: &Context, f: &mut NetworkVisitor<'_>) -> Result<()> {
        for info in self.service.list_networks(ctx, &self.name).await? {
            if f(self.wrap(info)).is_break() {
                break;
            }
        }
        Ok(())
    }
}

pub struct RemoteNetwork {
    info: NetworkInfo,
    service: Arc<dyn Service>,
}

impl RemoteNetwork {
    fn wrap(&self, info: AttachmentInfo) -> Arc<dyn Attachment> {
        Arc::new(RemoteAttachment {
            info,
            service: self.service.clone(),
        })
    }
}

#[async_trait]
impl Network for RemoteNetwork {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn info(&self) -> &NetworkInfo {
        &self.info
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        self.service
            .delete_network(ctx, &self.info.manager, &self.info.name)
            .await
    }

    async fn attach(&self, ctx: &Context, args: AttachmentArgs) -> Result<Arc<dyn Attachment>> {
        let info = self
            .service
            .attach_network(ctx, &self.info.manager, &self.info.name, args)
            .await?;
        Ok(self.wrap(info))
    }

    async fn attachment(&self, ctx: &Context, id: &str) -> Result<Arc<dyn Attachment>> {
        let info = self
            .service
            .get_attachment(ctx, &self.info.manager, &self.info.name, id)
            .await?;
        Ok(self.wrap(info))
    }

    async fn walk(&self, ctx: &Context, f: &mut AttachmentVisitor<'_>) -> Result<()> {
        let attachments = self
            .service
            .list_attachments(
                ctx,
                &self.info.manager,
                &self.info.name,
                &AttachmentFilter::default(),
            )
            .await?;
        for info in attachments {
            if let ControlFlow::Break(()) = f(self.wrap(info)) {
                break;
            }
        }
        Ok(())
    }
}

pub struct RemoteAttachment {
    info: AttachmentInfo,
    service: Arc<dyn Service>,
}

#[async_trait]
impl Attachment for RemoteAttachment {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn info(&self) -> AttachmentInfo {
        self.info.clone()
    }

    async fn remove(&self, ctx: &Context) -> Result<()> {
        self.service
            .detach_network(ctx, &self.info.manager, &self.info.network, &self.info.id)
            .await
    }

    async fn check(&self, ctx: &Context) -> Result<()> {
        let healthy = self
            .service
            .check_attachment(ctx, &self.info.manager, &self.info.network, &self.info.id)
            .await?;
        if !healthy {
            return Err(Error::Unhealthy(format!(
                "attachment {} failed its check",
                self.info.id
            )));
        }
        Ok(())
    }
}
