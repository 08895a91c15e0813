//! Test utilities.
//!
//! [`FakeRuntime`] stands in for the CNI runtime: it records every call and
//! lets a test script failures per container.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};

use crate::error::{Error, Result};
use crate::gc::LeaseSource;
use crate::plugin::{PluginError, PluginRuntime};
use crate::types::{AttachmentArgs, Dns, Interface, IpConfig, NetworkInfo, PluginResult, Route};

#[derive(Default)]
struct Script {
    fail_add: HashSet<String>,
    fail_delete: HashSet<String>,
    gone_on_delete: HashSet<String>,
    fail_check: HashSet<String>,
    add_delay: Option<Duration>,
    calls: Vec<(&'static str, String)>,
}

#[derive(Default)]
pub struct FakeRuntime {
    script: Mutex<Script>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }

    pub fn fail_add(&self, container: &str) {
        self.with_script(|s| s.fail_add.insert(container.to_string()));
    }

    pub fn fail_delete(&self, container: &str) {
        self.with_script(|s| s.fail_delete.insert(container.to_string()));
    }

    /// Delete reports the container as already gone.
    pub fn gone_on_delete(&self, container: &str) {
        self.with_script(|s| s.gone_on_delete.insert(container.to_string()));
    }

    pub fn fail_check(&self, container: &str) {
        self.with_script(|s| s.fail_check.insert(container.to_string()));
    }

    pub fn delay_add(&self, delay: Duration) {
        self.with_script(|s| s.add_delay = Some(delay));
    }

    pub fn clear_failures(&self) {
        self.with_script(|s| {
            s.fail_add.clear();
            s.fail_delete.clear();
            s.gone_on_delete.clear();
            s.fail_check.clear();
        });
    }

    /// Containers passed to `op` ("add", "delete" or "check"), in call order.
    pub fn calls(&self, op: &str) -> Vec<String> {
        self.with_script(|s| {
            s.calls
                .iter()
                .filter(|(o, _)| *o == op)
                .map(|(_, c)| c.clone())
                .collect()
        })
    }

    fn record(&self, op: &'static str, container: &str) {
        self.with_script(|s| s.calls.push((op, container.to_string())));
    }
}

fn failed(op: &str, container: &str) -> PluginError {
    PluginError::Failed {
        plugin: "fake".into(),
        code: 999,
        msg: format!("scripted {op} failure for {container}"),
    }
}

#[async_trait]
impl PluginRuntime for FakeRuntime {
    async fn add(
        &self,
        _network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> std::result::Result<PluginResult, PluginError> {
        self.record("add", &args.container);
        if let Some(delay) = self.with_script(|s| s.add_delay) {
            tokio::time::sleep(delay).await;
        }
        if self.with_script(|s| s.fail_add.contains(&args.container)) {
            return Err(failed("add", &args.container));
        }

        Ok(PluginResult {
            interfaces: vec![Interface {
                name: if_name.to_string(),
                mac: "02:00:00:00:00:01".into(),
                sandbox: ns_path.to_string(),
                ips: vec![IpConfig {
                    address: IpNet::V4(
                        Ipv4Net::new(Ipv4Addr::new(10, 88, 0, 2), 16).unwrap_or_default(),
                    ),
                    gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 88, 0, 1))),
                }],
            }],
            routes: vec![Route {
                dst: IpNet::V4(Ipv4Net::default()),
                gw: Some(IpAddr::V4(Ipv4Addr::new(10, 88, 0, 1))),
            }],
            dns: Dns {
                servers: vec!["10.88.0.1".into()],
                ..Default::default()
            },
        })
    }

    async fn delete(
        &self,
        _network: &NetworkInfo,
        _ns_path: &str,
        _if_name: &str,
        args: &AttachmentArgs,
    ) -> std::result::Result<(), PluginError> {
        self.record("delete", &args.container);
        self.with_script(|s| {
            if s.gone_on_delete.contains(&args.container) {
                Err(PluginError::NotFound(format!("{} is gone", args.container)))
            } else if s.fail_delete.contains(&args.container) {
                Err(failed("delete", &args.container))
            } else {
                Ok(())
            }
        })
    }

    async fn check(
        &self,
        _network: &NetworkInfo,
        _ns_path: &str,
        _if_name: &str,
        args: &AttachmentArgs,
    ) -> std::result::Result<(), PluginError> {
        self.record("check", &args.container);
        if self.with_script(|s| s.fail_check.contains(&args.container)) {
            return Err(failed("check", &args.container));
        }
        Ok(())
    }
}

/// Fixed set of live `(namespace, lease)` pairs.
pub struct StaticLeases {
    leases: Vec<(String, String)>,
    fail: bool,
}

impl StaticLeases {
    pub fn new<'a>(leases: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            leases: leases
                .into_iter()
                .map(|(ns, l)| (ns.to_string(), l.to_string()))
                .collect(),
            fail: false,
        }
    }

    /// A lease source that cannot be reached.
    pub fn failing() -> Self {
        Self {
            leases: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl LeaseSource for StaticLeases {
    async fn live_leases(&self, namespace: &str) -> Result<Vec<String>> {
        if self.fail {
            return Err(Error::Unknown("lease service unavailable".into()));
        }
        Ok(self
            .leases
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, l)| l.clone())
            .collect())
    }
}
