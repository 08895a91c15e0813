//! Attachments: one container interface on one network.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::info;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::ManagerInner;
use crate::types::{
    AttachmentInfo, AttachmentRecord, AttachmentStatus, LABEL_NSPATH, NetworkInfo,
};

#[async_trait]
pub trait Attachment: Send + Sync {
    fn id(&self) -> &str;

    /// Snapshot taken when this handle was obtained.
    fn info(&self) -> AttachmentInfo;

    /// Tears the interface down with the stored arguments, then deletes the
    /// record. Safe to retry: an interface that is already gone counts as
    /// removed.
    async fn remove(&self, ctx: &Context) -> Result<()>;

    /// Verifies the interface against the plugin runtime. Never mutates the
    /// record; drift surfaces as [`Error::Unhealthy`].
    async fn check(&self, ctx: &Context) -> Result<()>;
}

pub struct LocalAttachment {
    namespace: String,
    network: NetworkInfo,
    record: AttachmentRecord,
    manager: Weak<ManagerInner>,
}

impl LocalAttachment {
    pub(crate) fn new(
        namespace: String,
        network: NetworkInfo,
        record: AttachmentRecord,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            namespace,
            network,
            record,
            manager,
        }
    }

    fn manager(&self) -> Result<Arc<ManagerInner>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::Internal("network manager is gone".into()))
    }

    fn check_namespace(&self, ctx: &Context) -> Result<()> {
        if ctx.namespace_required()? != self.namespace {
            return Err(Error::NotFound(format!(
                "attachment {} not found",
                self.record.id
            )));
        }
        Ok(())
    }

    fn load(&self, manager: &ManagerInner, ctx: &Context) -> Result<AttachmentRecord> {
        manager
            .store
            .get_attachment(ctx, None, &manager.name, &self.network.name, &self.record.id)
    }
}

#[async_trait]
impl Attachment for LocalAttachment {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn info(&self) -> AttachmentInfo {
        AttachmentInfo::from_record(&self.network.manager, &self.network.name, &self.record)
    }

    async fn remove(&self, ctx: &Context) -> Result<()> {
        self.check_namespace(ctx)?;
        let manager = self.manager()?;
        let record = self.load(&manager, ctx)?;

        ctx.bounded("plugin delete", manager.plugin_delete(&self.network, &record))
            .await??;

        manager
            .store
            .delete_attachment(ctx, None, &manager.name, &self.network.name, &record.id)?;
        info!(
            attachment = %record.id,
            status = %record.status,
            "attachment removed"
        );
        Ok(())
    }

    async fn check(&self, ctx: &Context) -> Result<()> {
        self.check_namespace(ctx)?;
        let manager = self.manager()?;
        let record = self.load(&manager, ctx)?;

        if record.status != AttachmentStatus::Active {
            return Err(Error::Unhealthy(format!(
                "attachment {} is {}",
                record.id, record.status
            )));
        }

        let args = &record.args;
        let ns_path = record
            .labels
            .get(LABEL_NSPATH)
            .map(String::as_str)
            .unwrap_or(&args.netns);
        ctx.bounded(
            "plugin check",
            manager
                .runtime
                .check(&self.network, ns_path, &args.ifname, args),
        )
        .await?
        .map_err(|e| Error::Unhealthy(format!("attachment {}: {e}", record.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manager::{Manager, NetManager};
    use crate::network::Network;
    use crate::store::Store;
    use crate::test_util::FakeRuntime;
    use crate::types::{AttachmentArgs, NetworkOptions};

    async fn attached(
        runtime: Arc<FakeRuntime>,
        container: &str,
    ) -> (NetManager, Arc<dyn Network>, Arc<dyn Attachment>) {
        let store = Arc::new(Store::in_memory().unwrap());
        let m = NetManager::new("default", store, runtime).unwrap();
        let ctx = Context::with_namespace("ns1");
        let net = m.create(&ctx, "web", NetworkOptions::new()).await.unwrap();
        let args = AttachmentArgs::builder(container, "/var/run/netns/x", "eth0")
            .build()
            .unwrap();
        let att = net.attach(&ctx, args).await.unwrap();
        (m, net, att)
    }

    #[tokio::test]
    async fn test_check_and_remove() {
        let runtime = Arc::new(FakeRuntime::new());
        let (_m, net, att) = attached(runtime.clone(), "c1").await;
        let ctx = Context::with_namespace("ns1");

        att.check(&ctx).await.unwrap();
        att.remove(&ctx).await.unwrap();

        let err = net.attachment(&ctx, att.id()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(runtime.calls("check"), vec!["c1".to_string()]);
        assert_eq!(runtime.calls("delete"), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::new());
        let (_m, _net, att) = attached(runtime.clone(), "c1").await;
        let ctx = Context::with_namespace("ns1");

        att.remove(&ctx).await.unwrap();
        let err = att.remove(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(runtime.calls("delete").len(), 1);
    }

    #[tokio::test]
    async fn test_remove_tolerates_gone_interface() {
        let runtime = Arc::new(FakeRuntime::new());
        let (_m, net, att) = attached(runtime.clone(), "c1").await;
        runtime.gone_on_delete("c1");
        let ctx = Context::with_namespace("ns1");

        att.remove(&ctx).await.unwrap();
        assert!(net.attachment(&ctx, att.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_remove_retains_record() {
        let runtime = Arc::new(FakeRuntime::new());
        let (_m, net, att) = attached(runtime.clone(), "c1").await;
        runtime.fail_delete("c1");
        let ctx = Context::with_namespace("ns1");

        let err = att.remove(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        let again = net.attachment(&ctx, att.id()).await.unwrap();
        assert_eq!(again.info().status, AttachmentStatus::Active);

        runtime.clear_failures();
        att.remove(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_reports_drift_without_mutating() {
        let runtime = Arc::new(FakeRuntime::new());
        let (_m, net, att) = attached(runtime.clone(), "c1").await;
        runtime.fail_check("c1");
        let ctx = Context::with_namespace("ns1");

        let before = net.attachment(&ctx, att.id()).await.unwrap().info();
        let err = att.check(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Unhealthy(_)));
        let after = net.attachment(&ctx, att.id()).await.unwrap().info();
        assert_eq!(before, after);
    }
}
