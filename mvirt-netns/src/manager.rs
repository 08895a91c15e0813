//! Network managers.
//!
//! A manager is the registry of networks for one plugin environment (one
//! plugin bin dir and conf dir). The registry is keyed by
//! `(namespace, network)` and guarded by a single read/write lock; the store
//! stays authoritative for uniqueness.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cni;
use crate::context::{Context, validate_identifier};
use crate::error::{Error, Result};
use crate::network::{LocalNetwork, Network};
use crate::plugin::{PluginError, PluginRuntime};
use crate::store::Store;
use crate::types::{AttachmentRecord, LABEL_NSPATH, NetworkConfig, NetworkInfo, NetworkOptions};

/// Callback for [`Manager::walk`].
pub type NetworkVisitor<'a> = dyn FnMut(Arc<dyn Network>) -> ControlFlow<()> + Send + 'a;

#[async_trait]
pub trait Manager: Send + Sync {
    fn name(&self) -> &str;

    /// Creates a network in the context namespace.
    async fn create(
        &self,
        ctx: &Context,
        name: &str,
        opts: NetworkOptions,
    ) -> Result<Arc<dyn Network>>;

    /// Removes a network. Its attachments are left to the collector.
    async fn delete(&self, ctx: &Context, name: &str) -> Result<()>;

    async fn network(&self, ctx: &Context, name: &str) -> Result<Arc<dyn Network>>;

    /// Visits the networks of the context namespace in name order.
    async fn walk(&self, ctx: &Context, f: &mut NetworkVisitor<'_>) -> Result<()>;
}

type Registry = BTreeMap<(String, String), Arc<LocalNetwork>>;

pub(crate) struct ManagerInner {
    pub(crate) name: String,
    pub(crate) store: Arc<Store>,
    pub(crate) runtime: Arc<dyn PluginRuntime>,
    networks: RwLock<Registry>,
}

/// Manager backed by the local store and a plugin runtime.
#[derive(Clone)]
pub struct NetManager {
    inner: Arc<ManagerInner>,
}

impl NetManager {
    /// Creates the manager and reloads its networks from the store.
    pub fn new(
        name: impl Into<String>,
        store: Arc<Store>,
        runtime: Arc<dyn PluginRuntime>,
    ) -> Result<Self> {
        let name = name.into();
        validate_identifier("network manager", &name)?;

        let records = store.networks_of_manager(&name)?;
        let count = records.len();
        let inner = Arc::new_cyclic(|weak| {
            let networks: Registry = records
                .into_iter()
                .map(|(ns, record)| {
                    let key = (ns.clone(), record.name.clone());
                    (key, Arc::new(LocalNetwork::new(ns, record.info(), weak.clone())))
                })
                .collect();
            ManagerInner {
                name,
                store,
                runtime,
                networks: RwLock::new(networks),
            }
        });

        info!(manager = %inner.name, networks = count, "network manager ready");
        Ok(Self { inner })
    }

    /// Tears down the kernel side of an attachment without touching its
    /// record. An attachment whose record or interface is already gone
    /// counts as reclaimed.
    pub(crate) async fn reclaim(&self, namespace: &str, network: &str, id: &str) -> Result<()> {
        let ctx = Context::with_namespace(namespace);
        let record = match self.inner.store.get_attachment(&ctx, None, &self.inner.name, network, id)
        {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let info = self.inner.network_info(namespace, network).await;
        self.inner.plugin_delete(&info, &record).await
    }
}

impl ManagerInner {
    /// Registered network info, or an unconfigured stand-in so the plugin
    /// runtime can still resolve the config from its conf dir.
    pub(crate) async fn network_info(&self, namespace: &str, network: &str) -> NetworkInfo {
        let networks = self.networks.read().await;
        match networks.get(&(namespace.to_string(), network.to_string())) {
            Some(n) => n.info().clone(),
            None => NetworkInfo {
                manager: self.name.clone(),
                name: network.to_string(),
                config: NetworkConfig::Invalid,
                labels: BTreeMap::new(),
            },
        }
    }

    /// Runs the plugin delete with the stored arguments. Already-gone is
    /// success.
    pub(crate) async fn plugin_delete(
        &self,
        network: &NetworkInfo,
        record: &AttachmentRecord,
    ) -> Result<()> {
        let args = &record.args;
        let ns_path = record
            .labels
            .get(LABEL_NSPATH)
            .map(String::as_str)
            .unwrap_or(&args.netns);
        match self
            .runtime
            .delete(network, ns_path, &args.ifname, args)
            .await
        {
            Ok(()) => Ok(()),
            Err(PluginError::NotFound(msg)) => {
                debug!(attachment = %record.id, %msg, "interface already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn delete_network(&self, ctx: &Context, name: &str) -> Result<()> {
        let ns = ctx.namespace_required()?;
        let key = (ns.to_string(), name.to_string());

        let mut networks = self.networks.write().await;
        if !networks.contains_key(&key) {
            return Err(Error::NotFound(format!(
                "network {}/{name} not found",
                self.name
            )));
        }
        match self.store.delete_network(ctx, None, &self.name, name) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        networks.remove(&key);

        info!(namespace = ns, manager = %self.name, network = name, "network deleted");
        Ok(())
    }
}

#[async_trait]
impl Manager for NetManager {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn create(
        &self,
        ctx: &Context,
        name: &str,
        opts: NetworkOptions,
    ) -> Result<Arc<dyn Network>> {
        let ns = ctx.namespace_required()?;
        validate_identifier("network name", name)?;
        cni::validate_config(name, &opts.config)?;

        let info = NetworkInfo {
            manager: self.inner.name.clone(),
            name: name.to_string(),
            config: opts.config,
            labels: opts.labels,
        };

        let mut networks = self.inner.networks.write().await;
        let record = self.inner.store.create_network(ctx, None, &info)?;
        let network = Arc::new(LocalNetwork::new(
            ns.to_string(),
            record.info(),
            Arc::downgrade(&self.inner),
        ));
        networks.insert((ns.to_string(), name.to_string()), network.clone());

        info!(
            namespace = ns,
            manager = %self.inner.name,
            network = name,
            config = info.config.as_str(),
            "network created"
        );
        Ok(network)
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.inner.delete_network(ctx, name).await
    }

    async fn network(&self, ctx: &Context, name: &str) -> Result<Arc<dyn Network>> {
        let ns = ctx.namespace_required()?;
        let networks = self.inner.networks.read().await;
        networks
            .get(&(ns.to_string(), name.to_string()))
            .map(|n| n.clone() as Arc<dyn Network>)
            .ok_or_else(|| Error::NotFound(format!("network {}/{name} not found", self.inner.name)))
    }

    async fn walk(&self, ctx: &Context, f: &mut NetworkVisitor<'_>) -> Result<()> {
        let ns = ctx.namespace_required()?;
        let networks = self.inner.networks.read().await;
        for ((_, _), network) in networks.range((ns.to_string(), String::new())..) {
            if network.namespace() != ns {
                break;
            }
            if f(network.clone()).is_break() {
                break;
            }
        }
        Ok(())
    }
}
