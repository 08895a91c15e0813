//! Resource collector for network attachments.
//!
//! Attachments take part in the runtime's mark-and-sweep pass as resource
//! type [`RESOURCE_NETWORK`]. Liveness is lease membership only: an
//! attachment survives a pass iff the lease recorded on it is still held.
//! Attachments created without a lease are never collected.
//!
//! A node's key is the attachment ID (`manager/network/namespace/container/
//! ifname`) and its namespace the attachment's namespace. Both are checked
//! against each other before anything is torn down.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::audit::NetnsAuditLogger;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::{Manager, NetManager};
use crate::store::Store;
use crate::types::AttachmentKey;

/// Resource type tag used by the global collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType(pub u8);

pub const RESOURCE_NETWORK: ResourceType = ResourceType(0x11);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcNode {
    pub resource: ResourceType,
    pub namespace: String,
    pub key: String,
}

impl GcNode {
    pub fn attachment(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource: RESOURCE_NETWORK,
            namespace: namespace.into(),
            key: id.into(),
        }
    }
}

impl fmt::Display for GcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}:{}/{}", self.resource.0, self.namespace, self.key)
    }
}

/// Source of live leases, provided by the runtime's lease manager.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    /// Leases currently held in `namespace`.
    async fn live_leases(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    /// Attachment IDs whose interfaces and records were removed.
    pub removed: Vec<String>,
    /// Attachment IDs that could not be reclaimed; retried next pass.
    pub failed: Vec<String>,
}

pub struct ResourceCollector {
    store: Arc<Store>,
    managers: Arc<BTreeMap<String, NetManager>>,
    pass: Arc<Mutex<()>>,
    audit: Arc<NetnsAuditLogger>,
}

impl ResourceCollector {
    pub fn new(
        store: Arc<Store>,
        managers: impl IntoIterator<Item = NetManager>,
        audit: Arc<NetnsAuditLogger>,
    ) -> Self {
        let managers = managers
            .into_iter()
            .map(|m| (m.name().to_string(), m))
            .collect();
        Self {
            store,
            managers: Arc::new(managers),
            pass: Arc::new(Mutex::new(())),
            audit,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        RESOURCE_NETWORK
    }

    /// Starts a pass. Waits for a running pass to finish first.
    pub async fn start_collection(&self) -> CollectionContext {
        let guard = self.pass.clone().lock_owned().await;
        debug!("network collection started");
        CollectionContext {
            store: self.store.clone(),
            managers: self.managers.clone(),
            audit: self.audit.clone(),
            marked: BTreeSet::new(),
            candidates: BTreeSet::new(),
            _pass: guard,
        }
    }

    /// Runs one full pass: marks every attachment of a live lease and sweeps
    /// the other leased attachments. A failing lease source cancels the pass.
    pub async fn collect(&self, leases: &dyn LeaseSource) -> Result<CollectionReport> {
        let mut cc = self.start_collection().await;

        let refs = match self.store.lease_refs() {
            Ok(refs) => refs,
            Err(e) => {
                cc.cancel();
                return Err(e);
            }
        };
        let namespaces: BTreeSet<&str> = refs.iter().map(|r| r.namespace.as_str()).collect();

        for ns in namespaces {
            let live = match leases.live_leases(ns).await {
                Ok(live) => live,
                Err(e) => {
                    warn!(namespace = ns, error = %e, "lease enumeration failed, cancelling collection");
                    cc.cancel();
                    return Err(e);
                }
            };
            for lease in live {
                if let Err(e) = cc.leased(ns, &lease, |_| {}) {
                    cc.cancel();
                    return Err(e);
                }
            }
        }

        for r in refs {
            let node = GcNode::attachment(r.namespace, r.attachment);
            if !cc.is_marked(&node) {
                cc.remove(node);
            }
        }

        cc.finish().await
    }
}

/// State of one collection pass. Holds the pass lock until finished or
/// cancelled.
pub struct CollectionContext {
    store: Arc<Store>,
    managers: Arc<BTreeMap<String, NetManager>>,
    audit: Arc<NetnsAuditLogger>,
    marked: BTreeSet<GcNode>,
    candidates: BTreeSet<GcNode>,
    _pass: OwnedMutexGuard<()>,
}

impl CollectionContext {
    /// Network resources are reachable only through leases.
    pub fn all(&mut self, _f: impl FnMut(GcNode)) {}

    /// Network resources are reachable only through leases.
    pub fn active(&mut self, _namespace: &str, _f: impl FnMut(GcNode)) {}

    /// Reports every attachment held by `lease` in `namespace`.
    pub fn leased(
        &mut self,
        namespace: &str,
        lease: &str,
        mut f: impl FnMut(&GcNode),
    ) -> Result<()> {
        let ctx = Context::with_namespace(namespace);
        let marked = &mut self.marked;
        self.store.walk_leased(&ctx, lease, |id| {
            let node = GcNode::attachment(namespace, id);
            f(&node);
            marked.insert(node);
            ControlFlow::Continue(())
        })
    }

    pub fn is_marked(&self, node: &GcNode) -> bool {
        self.marked.contains(node)
    }

    /// Queues a node for removal. Nodes of other resource types are ignored.
    pub fn remove(&mut self, node: GcNode) {
        if node.resource == RESOURCE_NETWORK {
            self.candidates.insert(node);
        }
    }

    /// Drops the pass without touching anything.
    pub fn cancel(self) {
        debug!(
            candidates = self.candidates.len(),
            "network collection cancelled"
        );
    }

    /// Reclaims every queued node.
    ///
    /// Plugin teardown runs per node first; the records of all torn-down
    /// nodes are then deleted in one write transaction. A node that fails at
    /// either step is logged, reported in `failed` and skipped.
    pub async fn finish(self) -> Result<CollectionReport> {
        let mut report = CollectionReport::default();
        let mut torn_down = Vec::new();

        for node in &self.candidates {
            match self.teardown(node).await {
                Ok(key) => torn_down.push((node, key)),
                Err(e) => {
                    warn!(node = %node, error = %e, "failed to reclaim attachment");
                    report.failed.push(node.key.clone());
                }
            }
        }

        if !torn_down.is_empty() {
            let txn = self.store.begin_write()?;
            for (node, key) in torn_down {
                let ctx = Context::with_namespace(&node.namespace);
                let deleted = self.store.delete_attachment(
                    &ctx,
                    Some(&txn),
                    &key.manager,
                    &key.network,
                    &node.key,
                );
                match deleted {
                    Ok(()) => report.removed.push(node.key.clone()),
                    Err(e) if e.is_not_found() => {
                        // Record already gone; drop dangling lease entries.
                        match self.store.purge_lease_refs(&ctx, Some(&txn), &node.key) {
                            Ok(_) => report.removed.push(node.key.clone()),
                            Err(e) => {
                                warn!(node = %node, error = %e, "failed to purge lease index");
                                report.failed.push(node.key.clone());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(node = %node, error = %e, "failed to delete attachment record");
                        report.failed.push(node.key.clone());
                    }
                }
            }
            txn.commit()?;
        }

        for id in &report.removed {
            self.audit.attachment_reclaimed(id);
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "network collection finished"
        );
        Ok(report)
    }

    async fn teardown(&self, node: &GcNode) -> Result<AttachmentKey> {
        let key = AttachmentKey::parse(&node.key)?;
        if key.namespace != node.namespace {
            return Err(Error::InvalidArgument(format!(
                "node {node} does not belong to namespace {}",
                node.namespace
            )));
        }
        let manager = self.managers.get(&key.manager).ok_or_else(|| {
            Error::NotFound(format!("network manager not configured: {}", key.manager))
        })?;
        manager
            .reclaim(&node.namespace, &key.network, &node.key)
            .await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::test_util::{FakeRuntime, StaticLeases};
    use crate::types::{AttachmentArgs, NetworkOptions};

    struct Fixture {
        store: Arc<Store>,
        runtime: Arc<FakeRuntime>,
        network: Arc<dyn Network>,
        collector: ResourceCollector,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let runtime = Arc::new(FakeRuntime::new());
        let manager = NetManager::new("default", store.clone(), runtime.clone()).unwrap();
        let network = manager
            .create(&Context::with_namespace("ns1"), "web", NetworkOptions::new())
            .await
            .unwrap();
        let collector = ResourceCollector::new(
            store.clone(),
            [manager],
            Arc::new(NetnsAuditLogger::new_noop()),
        );
        Fixture {
            store,
            runtime,
            network,
            collector,
        }
    }

    async fn attach(f: &Fixture, container: &str, lease: Option<&str>) -> String {
        let mut ctx = Context::with_namespace("ns1");
        if let Some(lease) = lease {
            ctx = ctx.lease(lease);
        }
        let args = AttachmentArgs::builder(container, "/var/run/netns/x", "eth0")
            .build()
            .unwrap();
        f.network.attach(&ctx, args).await.unwrap().id().to_string()
    }

    #[tokio::test]
    async fn test_leased_marks_only_that_lease() {
        let f = fixture().await;
        let a = attach(&f, "c1", Some("l1")).await;
        attach(&f, "c2", Some("l2")).await;

        let mut cc = f.collector.start_collection().await;
        let mut seen = Vec::new();
        cc.leased("ns1", "l1", |n| seen.push(n.key.clone())).unwrap();
        assert_eq!(seen, vec![a.clone()]);
        assert!(cc.is_marked(&GcNode::attachment("ns1", a)));
        cc.cancel();
    }

    #[tokio::test]
    async fn test_cancel_leaves_storage_untouched() {
        let f = fixture().await;
        let id = attach(&f, "c1", Some("l1")).await;

        let mut cc = f.collector.start_collection().await;
        cc.remove(GcNode::attachment("ns1", id.clone()));
        cc.cancel();

        let ctx = Context::with_namespace("ns1");
        assert!(f.store.get_attachment(&ctx, None, "default", "web", &id).is_ok());
        assert!(f.runtime.calls("delete").is_empty());
    }

    #[tokio::test]
    async fn test_finish_isolates_failures() {
        let f = fixture().await;
        let ok = attach(&f, "c1", Some("l1")).await;
        let bad = attach(&f, "c2", Some("l1")).await;
        f.runtime.fail_delete("c2");

        let mut cc = f.collector.start_collection().await;
        cc.remove(GcNode::attachment("ns1", ok.clone()));
        cc.remove(GcNode::attachment("ns1", bad.clone()));
        cc.remove(GcNode::attachment("ns2", ok.clone()));
        cc.remove(GcNode::attachment("ns1", "not-an-id"));
        cc.remove(GcNode {
            resource: ResourceType(0x01),
            namespace: "ns1".into(),
            key: "sha256:abc".into(),
        });
        let report = cc.finish().await.unwrap();

        assert_eq!(report.removed, vec![ok.clone()]);
        assert_eq!(report.failed.len(), 3);
        assert!(report.failed.contains(&bad));

        let ctx = Context::with_namespace("ns1");
        assert!(f.store.get_attachment(&ctx, None, "default", "web", &ok).is_err());
        assert!(f.store.get_attachment(&ctx, None, "default", "web", &bad).is_ok());
    }

    #[tokio::test]
    async fn test_collect_sweeps_expired_leases() {
        let f = fixture().await;
        let live = attach(&f, "c1", Some("l1")).await;
        let expired = attach(&f, "c2", Some("l2")).await;
        let unleased = attach(&f, "c3", None).await;

        let leases = StaticLeases::new([("ns1", "l1")]);
        let report = f.collector.collect(&leases).await.unwrap();
        assert_eq!(report.removed, vec![expired]);
        assert!(report.failed.is_empty());

        let ctx = Context::with_namespace("ns1");
        for id in [&live, &unleased] {
            assert!(f.store.get_attachment(&ctx, None, "default", "web", id).is_ok());
        }

        // Nothing left to do on the next pass.
        let report = f.collector.collect(&leases).await.unwrap();
        assert_eq!(report, CollectionReport::default());
    }

    #[tokio::test]
    async fn test_collect_cancels_on_lease_source_failure() {
        let f = fixture().await;
        let id = attach(&f, "c1", Some("l1")).await;

        let leases = StaticLeases::failing();
        assert!(f.collector.collect(&leases).await.is_err());

        let ctx = Context::with_namespace("ns1");
        assert!(f.store.get_attachment(&ctx, None, "default", "web", &id).is_ok());

        // The pass lock was released.
        let cc = f.collector.start_collection().await;
        cc.cancel();
    }

    #[tokio::test]
    async fn test_finish_tolerates_removed_attachment() {
        let f = fixture().await;
        let id = attach(&f, "c1", Some("l1")).await;
        let ctx = Context::with_namespace("ns1");

        // Detached by its owner between mark and sweep.
        f.network
            .attachment(&ctx, &id)
            .await
            .unwrap()
            .remove(&ctx)
            .await
            .unwrap();

        let mut cc = f.collector.start_collection().await;
        cc.remove(GcNode::attachment("ns1", id.clone()));
        let report = cc.finish().await.unwrap();
        assert_eq!(report.removed, vec![id]);
        assert!(report.failed.is_empty());
        assert_eq!(f.runtime.calls("delete").len(), 1);
    }
}
