//! Explicit daemon assembly: store, managers, collector, local service.

use std::sync::Arc;

use tracing::info;

use crate::audit::NetnsAuditLogger;
use crate::cni::CniRuntime;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::gc::ResourceCollector;
use crate::manager::{Manager, NetManager};
use crate::plugin::PluginRuntime;
use crate::service::{Local, Service};
use crate::store::Store;

/// Everything a running daemon owns.
pub struct Daemon {
    store: Arc<Store>,
    managers: Vec<NetManager>,
    collector: Arc<ResourceCollector>,
    local: Arc<Local>,
}

impl Daemon {
    /// Assembles a daemon with one manager per `(name, runtime)` pair.
    pub fn new(
        store: Arc<Store>,
        runtimes: impl IntoIterator<Item = (String, Arc<dyn PluginRuntime>)>,
        audit: Arc<NetnsAuditLogger>,
    ) -> Result<Self> {
        let managers = runtimes
            .into_iter()
            .map(|(name, runtime)| NetManager::new(name, store.clone(), runtime))
            .collect::<Result<Vec<_>>>()?;

        let collector = Arc::new(ResourceCollector::new(
            store.clone(),
            managers.iter().cloned(),
            audit.clone(),
        ));
        let local = Arc::new(Local::new(
            managers
                .iter()
                .map(|m| Arc::new(m.clone()) as Arc<dyn Manager>),
            audit,
        ));

        info!(managers = managers.len(), "daemon assembled");
        Ok(Self {
            store,
            managers,
            collector,
            local,
        })
    }

    /// Assembles a daemon running CNI plugins for every configured manager.
    pub fn with_cni(config: &ServiceConfig, store: Arc<Store>) -> Result<Self> {
        if !config.managers.contains_key(&config.default_manager) {
            return Err(Error::InvalidArgument(format!(
                "default network manager {} is not configured",
                config.default_manager
            )));
        }
        info!(default_manager = %config.default_manager, "configuring network managers");

        let runtimes = config.managers.iter().map(|(name, mc)| {
            let cni = CniRuntime::new(mc.bin_dir.clone(), mc.conf_dir.clone());
            info!(
                manager = %name,
                bin_dir = %cni.bin_dir().display(),
                conf_dir = %cni.conf_dir().display(),
                "configuring network manager"
            );
            let runtime: Arc<dyn PluginRuntime> = Arc::new(cni);
            (name.clone(), runtime)
        });
        Self::new(store, runtimes, Arc::new(NetnsAuditLogger::new()))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn managers(&self) -> &[NetManager] {
        &self.managers
    }

    /// The collector reclaiming attachments of expired leases.
    ///
    /// Nothing runs it on its own: whoever embeds the daemon and knows the
    /// live leases drives passes through [`ResourceCollector::collect`] or
    /// [`ResourceCollector::start_collection`].
    pub fn collector(&self) -> Arc<ResourceCollector> {
        self.collector.clone()
    }

    pub fn local(&self) -> Arc<Local> {
        self.local.clone()
    }

    /// The local service as served over gRPC.
    pub fn service(&self) -> Arc<dyn Service> {
        self.local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagerConfig, ManagerSpec};
    use crate::context::Context;
    use crate::test_util::FakeRuntime;
    use crate::types::NetworkOptions;

    #[tokio::test]
    async fn test_with_cni_registers_configured_managers() {
        let spec: ManagerSpec = "calico=/opt/calico/bin:/etc/calico/net.d".parse().unwrap();
        let mut config = ServiceConfig::default();
        config.managers.insert(spec.name, spec.config);

        let daemon = Daemon::with_cni(&config, Arc::new(Store::in_memory().unwrap())).unwrap();
        let local = daemon.local();
        let names: Vec<&str> = local.managers().collect();
        assert_eq!(names, vec!["calico", "default"]);
        assert_eq!(daemon.managers().len(), 2);
        assert_eq!(config.managers["default"], ManagerConfig::default());
    }

    #[test]
    fn test_with_cni_rejects_unconfigured_default() {
        let mut config = ServiceConfig::default();
        config.default_manager = "calico".to_string();
        let err = Daemon::with_cni(&config, Arc::new(Store::in_memory().unwrap()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_networks_survive_reassembly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("networks.redb");
        let ctx = Context::with_namespace("ns1");

        {
            let store = Arc::new(Store::open(&path).unwrap());
            let runtime: Arc<dyn PluginRuntime> = Arc::new(FakeRuntime::new());
            let daemon = Daemon::new(
                store,
                [("default".to_string(), runtime)],
                Arc::new(NetnsAuditLogger::new_noop()),
            )
            .unwrap();
            daemon
                .service()
                .create_network(&ctx, "default", "web", NetworkOptions::new())
                .await
                .unwrap();
        }

        let store = Arc::new(Store::open(&path).unwrap());
        let runtime: Arc<dyn PluginRuntime> = Arc::new(FakeRuntime::new());
        let daemon = Daemon::new(
            store,
            [("default".to_string(), runtime)],
            Arc::new(NetnsAuditLogger::new_noop()),
        )
        .unwrap();
        let info = daemon
            .service()
            .get_network(&ctx, "default", "web")
            .await
            .unwrap();
        assert_eq!(info.name, "web");
    }
}
