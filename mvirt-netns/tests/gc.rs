//! Collection passes over a fully assembled daemon.

use std::sync::Arc;

use mvirt_netns::audit::NetnsAuditLogger;
use mvirt_netns::daemon::Daemon;
use mvirt_netns::gc::{GcNode, RESOURCE_NETWORK, ResourceType};
use mvirt_netns::plugin::PluginRuntime;
use mvirt_netns::store::Store;
use mvirt_netns::test_util::{FakeRuntime, StaticLeases};
use mvirt_netns::types::{AttachmentArgs, AttachmentStatus, NetworkOptions};
use mvirt_netns::{Context, ErrorKind};

struct Fixture {
    runtime: Arc<FakeRuntime>,
    daemon: Daemon,
}

async fn fixture() -> Fixture {
    let runtime = Arc::new(FakeRuntime::new());
    let plugin: Arc<dyn PluginRuntime> = runtime.clone();
    let daemon = Daemon::new(
        Arc::new(Store::in_memory().unwrap()),
        [("default".to_string(), plugin)],
        Arc::new(NetnsAuditLogger::new_noop()),
    )
    .unwrap();
    for ns in ["ns1", "ns2"] {
        daemon
            .service()
            .create_network(
                &Context::with_namespace(ns),
                "default",
                "web",
                NetworkOptions::new(),
            )
            .await
            .unwrap();
    }
    Fixture { runtime, daemon }
}

async fn attach(f: &Fixture, ns: &str, container: &str, lease: Option<&str>) -> String {
    let mut ctx = Context::with_namespace(ns);
    if let Some(lease) = lease {
        ctx = ctx.lease(lease);
    }
    let args = AttachmentArgs::builder(container, format!("/var/run/netns/{container}"), "eth0")
        .build()
        .unwrap();
    let info = f
        .daemon
        .service()
        .attach_network(&ctx, "default", "web", args)
        .await
        .unwrap();
    assert_eq!(info.lease.as_deref(), lease);
    info.id
}

async fn exists(f: &Fixture, ns: &str, id: &str) -> bool {
    match f
        .daemon
        .service()
        .get_attachment(&Context::with_namespace(ns), "default", "web", id)
        .await
    {
        Ok(info) => {
            assert_eq!(info.status, AttachmentStatus::Active);
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[tokio::test]
async fn test_expired_lease_reclaimed_with_one_failure() {
    let f = fixture().await;
    let mut ids = Vec::new();
    for c in ["c1", "c2", "c3", "c4"] {
        ids.push(attach(&f, "ns1", c, Some("expired")).await);
    }
    f.runtime.fail_delete("c3");

    let report = f
        .daemon
        .collector()
        .collect(&StaticLeases::new([]))
        .await
        .unwrap();

    assert_eq!(report.removed.len(), 3);
    assert_eq!(report.failed, vec!["default/web/ns1/c3/eth0".to_string()]);
    for id in &ids {
        let should_exist = id.ends_with("/c3/eth0");
        assert_eq!(exists(&f, "ns1", id).await, should_exist, "{id}");
    }

    // The failed node is retried by the next pass.
    f.runtime.clear_failures();
    let report = f
        .daemon
        .collector()
        .collect(&StaticLeases::new([]))
        .await
        .unwrap();
    assert_eq!(report.removed, vec!["default/web/ns1/c3/eth0".to_string()]);
    assert!(report.failed.is_empty());
    assert!(f.daemon.store().lease_refs().unwrap().is_empty());
}

#[tokio::test]
async fn test_live_and_unleased_attachments_retained() {
    let f = fixture().await;
    let live = attach(&f, "ns1", "c1", Some("held")).await;
    let unleased = attach(&f, "ns1", "c2", None).await;
    let expired = attach(&f, "ns1", "c3", Some("gone")).await;
    // Same lease name in another namespace is a different lease.
    let other_ns = attach(&f, "ns2", "c1", Some("held")).await;

    let report = f
        .daemon
        .collector()
        .collect(&StaticLeases::new([("ns1", "held")]))
        .await
        .unwrap();

    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(removed, vec![expired.clone(), other_ns.clone()]);
    assert!(exists(&f, "ns1", &live).await);
    assert!(exists(&f, "ns1", &unleased).await);
    assert!(!exists(&f, "ns1", &expired).await);
    assert!(!exists(&f, "ns2", &other_ns).await);
    assert_eq!(f.runtime.calls("delete"), vec!["c3", "c1"]);
}

#[tokio::test]
async fn test_unreachable_lease_source_cancels_pass() {
    let f = fixture().await;
    let id = attach(&f, "ns1", "c1", Some("expired")).await;

    let err = f
        .daemon
        .collector()
        .collect(&StaticLeases::failing())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(exists(&f, "ns1", &id).await);
    assert!(f.runtime.calls("delete").is_empty());

    // The pass lock was released by the cancel.
    let report = f
        .daemon
        .collector()
        .collect(&StaticLeases::new([]))
        .await
        .unwrap();
    assert_eq!(report.removed, vec![id]);
}

#[tokio::test]
async fn test_manual_pass_ignores_foreign_resources() {
    let f = fixture().await;
    let id = attach(&f, "ns1", "c1", Some("expired")).await;
    let collector = f.daemon.collector();
    assert_eq!(collector.resource_type(), RESOURCE_NETWORK);

    let mut cc = collector.start_collection().await;
    cc.remove(GcNode {
        resource: ResourceType(0x01),
        namespace: "ns1".into(),
        key: id.clone(),
    });
    let report = cc.finish().await.unwrap();
    assert!(report.removed.is_empty());
    assert!(exists(&f, "ns1", &id).await);

    let mut cc = collector.start_collection().await;
    cc.remove(GcNode::attachment("ns1", id.clone()));
    let report = cc.finish().await.unwrap();
    assert_eq!(report.removed, vec![id.clone()]);
    assert!(!exists(&f, "ns1", &id).await);
}

#[tokio::test]
async fn test_concurrent_passes_are_serialized() {
    let f = fixture().await;
    for c in ["c1", "c2", "c3"] {
        attach(&f, "ns1", c, Some("expired")).await;
    }

    let collector = f.daemon.collector();
    let leases = StaticLeases::new([]);
    let (a, b) = tokio::join!(collector.collect(&leases), collector.collect(&leases));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.removed.len() + b.removed.len(), 3);
    assert!(a.failed.is_empty() && b.failed.is_empty());
    assert_eq!(f.runtime.calls("delete").len(), 3);
}
