//! Networks and the attach flow.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::attachment::{Attachment, LocalAttachment};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::ManagerInner;
use crate::store;
use crate::types::{
    AttachmentArgs, AttachmentRecord, AttachmentStatus, LABEL_LEASE, LABEL_NSPATH, NetworkInfo,
    attachment_id,
};

/// Upper bound for best-effort plugin cleanup after a failed attach.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback for [`Network::walk`].
pub type AttachmentVisitor<'a> =
    dyn FnMut(Arc<dyn Attachment>) -> ControlFlow<()> + Send + 'a;

#[async_trait]
pub trait Network: Send + Sync {
    fn name(&self) -> &str;

    fn info(&self) -> &NetworkInfo;

    /// Removes the network from its manager.
    async fn delete(&self, ctx: &Context) -> Result<()>;

    /// Attaches a container. Returns once the attachment is `Active`; on
    /// failure the record is left in `Error` (or removed), never `Pending`.
    async fn attach(&self, ctx: &Context, args: AttachmentArgs) -> Result<Arc<dyn Attachment>>;

    async fn attachment(&self, ctx: &Context, id: &str) -> Result<Arc<dyn Attachment>>;

    async fn walk(&self, ctx: &Context, f: &mut AttachmentVisitor<'_>) -> Result<()>;
}

/// A network registered with a local [`crate::manager::NetManager`].
pub struct LocalNetwork {
    namespace: String,
    info: NetworkInfo,
    manager: Weak<ManagerInner>,
}

impl LocalNetwork {
    pub(crate) fn new(namespace: String, info: NetworkInfo, manager: Weak<ManagerInner>) -> Self {
        Self {
            namespace,
            info,
            manager,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn manager(&self) -> Result<Arc<ManagerInner>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::Internal("network manager is gone".into()))
    }

    /// Networks are bound to the namespace they were created in.
    fn check_namespace<'a>(&self, ctx: &'a Context) -> Result<&'a str> {
        let ns = ctx.namespace_required()?;
        if ns != self.namespace {
            return Err(Error::NotFound(format!(
                "network {}/{} not found",
                self.info.manager, self.info.name
            )));
        }
        Ok(ns)
    }

    fn wrap(&self, manager: &Arc<ManagerInner>, record: AttachmentRecord) -> Arc<dyn Attachment> {
        Arc::new(LocalAttachment::new(
            self.namespace.clone(),
            self.info.clone(),
            record,
            Arc::downgrade(manager),
        ))
    }
}

#[async_trait]
impl Network for LocalNetwork {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn info(&self) -> &NetworkInfo {
        &self.info
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        self.check_namespace(ctx)?;
        self.manager()?.delete_network(ctx, &self.info.name).await
    }

    async fn attach(&self, ctx: &Context, args: AttachmentArgs) -> Result<Arc<dyn Attachment>> {
        let ns = self.check_namespace(ctx)?;
        ctx.validate()?;
        args.validate()?;
        let manager = self.manager()?;

        let id = attachment_id(
            &manager.name,
            &self.info.name,
            ns,
            &args.container,
            &args.ifname,
        );
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NSPATH.to_string(), args.netns.clone());
        if let Some(lease) = ctx.lease_id() {
            labels.insert(LABEL_LEASE.to_string(), lease.to_string());
        }

        let record = store::pending_record(id, args, labels);
        manager
            .store
            .create_attachment(ctx, None, &manager.name, &self.info.name, &record)?;
        debug!(attachment = %record.id, "attachment pending");

        // The plugin call and the status transition run on their own task so
        // a dropped caller cannot leave the record in Pending.
        let task = tokio::spawn(complete_attach(
            manager.clone(),
            ctx.clone(),
            self.info.clone(),
            record,
        ));
        let record = task.await??;

        Ok(self.wrap(&manager, record))
    }

    async fn attachment(&self, ctx: &Context, id: &str) -> Result<Arc<dyn Attachment>> {
        self.check_namespace(ctx)?;
        let manager = self.manager()?;
        let record = manager
            .store
            .get_attachment(ctx, None, &manager.name, &self.info.name, id)?;
        Ok(self.wrap(&manager, record))
    }

    async fn walk(&self, ctx: &Context, f: &mut AttachmentVisitor<'_>) -> Result<()> {
        self.check_namespace(ctx)?;
        let manager = self.manager()?;
        manager
            .store
            .walk_attachments(ctx, None, &manager.name, &self.info.name, |record| {
                f(self.wrap(&manager, record))
            })
    }
}

/// Runs the plugin add for a `Pending` record and moves it to `Active` or
/// `Error`.
async fn complete_attach(
    manager: Arc<ManagerInner>,
    ctx: Context,
    network: NetworkInfo,
    record: AttachmentRecord,
) -> Result<AttachmentRecord> {
    let args = &record.args;
    let added = ctx
        .bounded(
            "plugin add",
            manager
                .runtime
                .add(&network, &args.netns, &args.ifname, args),
        )
        .await;

    let result = match added {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(attachment = %record.id, error = %e, "plugin add failed");
            mark_failed(&manager, &ctx, &network.name, &record.id);
            return Err(e.into());
        }
        Err(e) => {
            warn!(attachment = %record.id, error = %e, "plugin add timed out");
            cleanup(&manager, &network, &record).await;
            mark_failed(&manager, &ctx, &network.name, &record.id);
            return Err(e);
        }
    };

    match manager.store.update_attachment(
        &ctx,
        None,
        &manager.name,
        &network.name,
        &record.id,
        AttachmentStatus::Active,
        Some(result),
    ) {
        Ok(active) => {
            info!(
                attachment = %active.id,
                lease = active.lease().unwrap_or_default(),
                "attachment active"
            );
            Ok(active)
        }
        Err(e) => {
            error!(attachment = %record.id, error = %e, "failed to persist active attachment");
            cleanup(&manager, &network, &record).await;
            mark_failed(&manager, &ctx, &network.name, &record.id);
            Err(e)
        }
    }
}

/// Best-effort plugin delete after a failed or abandoned add.
async fn cleanup(manager: &ManagerInner, network: &NetworkInfo, record: &AttachmentRecord) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, manager.plugin_delete(network, record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(attachment = %record.id, error = %e, "plugin cleanup failed"),
        Err(_) => warn!(attachment = %record.id, "plugin cleanup timed out"),
    }
}

/// Moves a record out of `Pending`: to `Error` if possible, otherwise
/// deletes it.
fn mark_failed(manager: &ManagerInner, ctx: &Context, network: &str, id: &str) {
    let marked = manager.store.update_attachment(
        ctx,
        None,
        &manager.name,
        network,
        id,
        AttachmentStatus::Error,
        None,
    );
    let Err(e) = marked else {
        return;
    };
    if e.is_not_found() {
        return;
    }

    warn!(attachment = id, error = %e, "marking attachment failed, removing record");
    if let Err(e) = manager
        .store
        .delete_attachment(ctx, None, &manager.name, network, id)
    {
        error!(attachment = id, error = %e, "attachment record left behind");
    }
}
