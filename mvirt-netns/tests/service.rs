//! End-to-end service behavior, in-process and over gRPC.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mvirt_netns::audit::NetnsAuditLogger;
use mvirt_netns::daemon::Daemon;
use mvirt_netns::plugin::PluginRuntime;
use mvirt_netns::store::Store;
use mvirt_netns::test_util::FakeRuntime;
use mvirt_netns::types::{AttachmentArgs, AttachmentFilter, AttachmentStatus, NetworkOptions};
use mvirt_netns::{Context, ErrorKind, Proxy, Service, grpc};

fn daemon(runtime: Arc<FakeRuntime>) -> Daemon {
    let runtime: Arc<dyn PluginRuntime> = runtime;
    Daemon::new(
        Arc::new(Store::in_memory().unwrap()),
        [("default".to_string(), runtime)],
        Arc::new(NetnsAuditLogger::new_noop()),
    )
    .unwrap()
}

/// Serves `service` on a loopback port and returns a connected Proxy.
async fn proxy_for(service: Arc<dyn Service>) -> (Proxy, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(grpc::serve(listener, service, async move {
        let _ = stop_rx.await;
    }));
    let proxy = Proxy::connect(format!("http://{addr}")).await.unwrap();
    (proxy, stop_tx)
}

fn args(container: &str, ifname: &str) -> AttachmentArgs {
    AttachmentArgs::builder(container, format!("/var/run/netns/{container}"), ifname)
        .build()
        .unwrap()
}

async fn concrete_scenario(svc: &dyn Service) {
    let ctx = Context::with_namespace("ns1");

    svc.create_network(&ctx, "default", "web", NetworkOptions::new())
        .await
        .unwrap();
    let info = svc.get_network(&ctx, "default", "web").await.unwrap();
    assert_eq!(info.manager, "default");
    assert_eq!(info.name, "web");

    let att = svc
        .attach_network(&ctx, "default", "web", args("c1", "eth0"))
        .await
        .unwrap();
    assert_eq!(att.id, "default/web/ns1/c1/eth0");
    assert_eq!(att.status, AttachmentStatus::Active);
    assert_eq!(att.interfaces[0].name, "eth0");

    assert!(svc.check_attachment(&ctx, "default", "web", &att.id).await.unwrap());

    svc.detach_network(&ctx, "default", "web", &att.id)
        .await
        .unwrap();
    let err = svc
        .get_attachment(&ctx, "default", "web", &att.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_concrete_scenario_local() {
    let d = daemon(Arc::new(FakeRuntime::new()));
    concrete_scenario(d.service().as_ref()).await;
}

#[tokio::test]
async fn test_concrete_scenario_proxy() {
    let d = daemon(Arc::new(FakeRuntime::new()));
    let (proxy, _stop) = proxy_for(d.service()).await;
    concrete_scenario(&proxy).await;
}

/// Runs a fixed call sequence and records each outcome as `Ok` or the error
/// kind.
async fn outcomes(
    svc: &dyn Service,
    runtime: &FakeRuntime,
) -> Vec<(&'static str, Result<(), ErrorKind>)> {
    let ctx = Context::with_namespace("ns1").lease("lease-a");
    let kind = |r: Result<(), mvirt_netns::Error>| r.map_err(|e| e.kind());
    let mut out = Vec::new();

    out.push((
        "get without manager",
        kind(svc.get_network(&ctx, "", "web").await.map(drop)),
    ));
    out.push((
        "create on unknown manager",
        kind(
            svc.create_network(&ctx, "calico", "web", NetworkOptions::new())
                .await
                .map(drop),
        ),
    ));
    out.push((
        "create without namespace",
        kind(
            svc.create_network(&Context::new(), "default", "web", NetworkOptions::new())
                .await
                .map(drop),
        ),
    ));
    out.push((
        "create",
        kind(
            svc.create_network(&ctx, "default", "web", NetworkOptions::new())
                .await
                .map(drop),
        ),
    ));
    out.push((
        "create duplicate",
        kind(
            svc.create_network(&ctx, "default", "web", NetworkOptions::new())
                .await
                .map(drop),
        ),
    ));
    out.push((
        "get missing network",
        kind(svc.get_network(&ctx, "default", "db").await.map(drop)),
    ));
    out.push((
        "attach",
        kind(
            svc.attach_network(&ctx, "default", "web", args("c1", "eth0"))
                .await
                .map(drop),
        ),
    ));
    out.push((
        "attach duplicate",
        kind(
            svc.attach_network(&ctx, "default", "web", args("c1", "eth0"))
                .await
                .map(drop),
        ),
    ));
    out.push((
        "attach bad ifname",
        kind(
            svc.attach_network(
                &ctx,
                "default",
                "web",
                AttachmentArgs {
                    ifname: "this-name-is-too-long".into(),
                    ..args("c9", "eth0")
                },
            )
            .await
            .map(drop),
        ),
    ));
    let expired = ctx.clone().deadline(Instant::now());
    out.push((
        "get with expired deadline",
        kind(svc.get_network(&expired, "default", "web").await.map(drop)),
    ));
    out.push((
        "expired deadline on unknown manager",
        kind(svc.get_network(&expired, "calico", "web").await.map(drop)),
    ));
    out.push((
        "attach with empty lease",
        kind(
            svc.attach_network(
                &Context::with_namespace("ns1").lease(""),
                "default",
                "web",
                args("c3", "eth0"),
            )
            .await
            .map(drop),
        ),
    ));
    out.push((
        "attach with non-ascii lease",
        kind(
            svc.attach_network(
                &Context::with_namespace("ns1").lease("lé"),
                "default",
                "web",
                args("c3", "eth0"),
            )
            .await
            .map(drop),
        ),
    ));
    out.push((
        "get in malformed namespace",
        kind(
            svc.get_network(&Context::with_namespace("a/b"), "default", "web")
                .await
                .map(drop),
        ),
    ));
    out.push((
        "get in non-ascii namespace",
        kind(
            svc.get_network(&Context::with_namespace("nämespace"), "default", "web")
                .await
                .map(drop),
        ),
    ));

    runtime.fail_add("c2");
    out.push((
        "attach failing plugin",
        kind(
            svc.attach_network(&ctx, "default", "web", args("c2", "eth0"))
                .await
                .map(drop),
        ),
    ));
    out.push((
        "other namespace",
        kind(
            svc.get_attachment(
                &Context::with_namespace("ns2"),
                "default",
                "web",
                "default/web/ns1/c1/eth0",
            )
            .await
            .map(drop),
        ),
    ));
    out.push((
        "check",
        kind(
            svc.check_attachment(&ctx, "default", "web", "default/web/ns1/c1/eth0")
                .await
                .map(|ok| assert!(ok)),
        ),
    ));
    out.push((
        "detach",
        kind(
            svc.detach_network(&ctx, "default", "web", "default/web/ns1/c1/eth0")
                .await,
        ),
    ));
    out.push((
        "detach again",
        kind(
            svc.detach_network(&ctx, "default", "web", "default/web/ns1/c1/eth0")
                .await,
        ),
    ));
    out.push(("delete network", kind(svc.delete_network(&ctx, "default", "web").await)));
    out.push((
        "delete network again",
        kind(svc.delete_network(&ctx, "default", "web").await),
    ));
    out
}

#[tokio::test]
async fn test_local_and_proxy_agree() {
    let local_runtime = Arc::new(FakeRuntime::new());
    let local = daemon(local_runtime.clone());
    let local_outcomes = outcomes(local.service().as_ref(), &local_runtime).await;

    let remote_runtime = Arc::new(FakeRuntime::new());
    let remote = daemon(remote_runtime.clone());
    let (proxy, _stop) = proxy_for(remote.service()).await;
    let proxy_outcomes = outcomes(&proxy, &remote_runtime).await;

    assert_eq!(local_outcomes, proxy_outcomes);

    let expected = [
        ("get without manager", Err(ErrorKind::InvalidArgument)),
        ("create on unknown manager", Err(ErrorKind::InvalidArgument)),
        ("create without namespace", Err(ErrorKind::InvalidArgument)),
        ("create", Ok(())),
        ("create duplicate", Err(ErrorKind::AlreadyExists)),
        ("get missing network", Err(ErrorKind::NotFound)),
        ("attach", Ok(())),
        ("attach duplicate", Err(ErrorKind::AlreadyExists)),
        ("attach bad ifname", Err(ErrorKind::InvalidArgument)),
        ("get with expired deadline", Err(ErrorKind::DeadlineExceeded)),
        ("expired deadline on unknown manager", Err(ErrorKind::InvalidArgument)),
        ("attach with empty lease", Err(ErrorKind::InvalidArgument)),
        ("attach with non-ascii lease", Err(ErrorKind::InvalidArgument)),
        ("get in malformed namespace", Err(ErrorKind::InvalidArgument)),
        ("get in non-ascii namespace", Err(ErrorKind::InvalidArgument)),
        ("attach failing plugin", Err(ErrorKind::Unknown)),
        ("other namespace", Err(ErrorKind::NotFound)),
        ("check", Ok(())),
        ("detach", Ok(())),
        ("detach again", Err(ErrorKind::NotFound)),
        ("delete network", Ok(())),
        ("delete network again", Err(ErrorKind::NotFound)),
    ];
    assert_eq!(local_outcomes, expected);
}

#[tokio::test]
async fn test_failed_attach_leaves_no_pending_record() {
    let runtime = Arc::new(FakeRuntime::new());
    let d = daemon(runtime.clone());
    let svc = d.service();
    let ctx = Context::with_namespace("ns1");
    svc.create_network(&ctx, "default", "web", NetworkOptions::new())
        .await
        .unwrap();

    runtime.fail_add("c1");
    svc.attach_network(&ctx, "default", "web", args("c1", "eth0"))
        .await
        .unwrap_err();

    let all = svc
        .list_attachments(&ctx, "default", "web", &AttachmentFilter::default())
        .await
        .unwrap();
    assert!(all.iter().all(|a| a.status != AttachmentStatus::Pending));
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, AttachmentStatus::Error);
    assert!(
        !svc.check_attachment(&ctx, "default", "web", &all[0].id)
            .await
            .unwrap()
    );

    // The failed record is removable, after which the key is free again.
    svc.detach_network(&ctx, "default", "web", &all[0].id)
        .await
        .unwrap();
    runtime.clear_failures();
    let att = svc
        .attach_network(&ctx, "default", "web", args("c1", "eth0"))
        .await
        .unwrap();
    assert_eq!(att.status, AttachmentStatus::Active);
}

#[tokio::test]
async fn test_attach_deadline_over_proxy() {
    let runtime = Arc::new(FakeRuntime::new());
    let d = daemon(runtime.clone());
    let (proxy, _stop) = proxy_for(d.service()).await;
    let ctx = Context::with_namespace("ns1");
    proxy
        .create_network(&ctx, "default", "web", NetworkOptions::new())
        .await
        .unwrap();

    runtime.delay_add(Duration::from_secs(2));
    let err = proxy
        .attach_network(
            &ctx.clone().timeout(Duration::from_millis(100)),
            "default",
            "web",
            args("c1", "eth0"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let d = daemon(Arc::new(FakeRuntime::new()));
    let svc = d.service();
    let a = Context::with_namespace("tenant-a");
    let b = Context::with_namespace("tenant-b");

    svc.create_network(&a, "default", "web", NetworkOptions::new())
        .await
        .unwrap();
    svc.create_network(&b, "default", "web", NetworkOptions::new())
        .await
        .unwrap();
    svc.create_network(&b, "default", "db", NetworkOptions::new())
        .await
        .unwrap();

    let names = |nets: Vec<mvirt_netns::types::NetworkInfo>| {
        nets.into_iter().map(|n| n.name).collect::<Vec<_>>()
    };
    assert_eq!(names(svc.list_networks(&a, "default").await.unwrap()), ["web"]);
    assert_eq!(
        names(svc.list_networks(&b, "default").await.unwrap()),
        ["db", "web"]
    );

    let att = svc
        .attach_network(&a, "default", "web", args("c1", "eth0"))
        .await
        .unwrap();
    assert_eq!(att.id, "default/web/tenant-a/c1/eth0");
    let other = svc
        .attach_network(&b, "default", "web", args("c1", "eth0"))
        .await
        .unwrap();
    assert_eq!(other.id, "default/web/tenant-b/c1/eth0");

    svc.delete_network(&a, "default", "web").await.unwrap();
    svc.get_network(&b, "default", "web").await.unwrap();
}
