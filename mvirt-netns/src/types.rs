//! Domain types: network definitions, attachment arguments and records.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Label holding the lease an attachment belongs to.
pub const LABEL_LEASE: &str = "lease";
/// Label holding the network namespace path of an attachment.
pub const LABEL_NSPATH: &str = "nspath";

/// Maximum Linux interface name length (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Capability names a plugin may declare.
pub const KNOWN_CAPABILITIES: &[&str] = &[
    "portMappings",
    "ipRanges",
    "bandwidth",
    "dns",
    "mac",
    "ips",
    "infinibandGUID",
    "deviceID",
    "aliases",
    "cgroupPath",
];

// ============================================================================
// Networks
// ============================================================================

/// Raw plugin configuration of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NetworkConfig {
    /// No configuration stored; resolved by the plugin runtime at call time.
    #[default]
    Invalid,
    /// A CNI network configuration list.
    ConfList(Vec<u8>),
    /// A single CNI network configuration.
    Conf(Vec<u8>),
}

impl NetworkConfig {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkConfig::Invalid => "invalid",
            NetworkConfig::ConfList(_) => "conflist",
            NetworkConfig::Conf(_) => "conf",
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            NetworkConfig::Invalid => &[],
            NetworkConfig::ConfList(b) | NetworkConfig::Conf(b) => b,
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, NetworkConfig::Invalid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub manager: String,
    pub name: String,
    #[serde(default)]
    pub config: NetworkConfig,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Options for creating a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub config: NetworkConfig,
    pub labels: BTreeMap<String, String>,
}

impl NetworkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Capability arguments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    pub subnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// Traffic shaping in bits per second.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandWidth {
    pub ingress_rate: u64,
    pub ingress_burst: u64,
    pub egress_rate: u64,
    pub egress_burst: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.searches.is_empty() && self.options.is_empty()
    }
}

// ============================================================================
// Attachment arguments
// ============================================================================

/// Arguments of one attachment, stored with the record and replayed verbatim
/// on delete and check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentArgs {
    pub container: String,
    pub netns: String,
    pub ifname: String,
    #[serde(default)]
    pub capability_args: BTreeMap<String, Value>,
    #[serde(default)]
    pub plugin_args: BTreeMap<String, String>,
}

impl AttachmentArgs {
    pub fn builder(
        container: impl Into<String>,
        netns: impl Into<String>,
        ifname: impl Into<String>,
    ) -> AttachmentArgsBuilder {
        AttachmentArgsBuilder {
            container: container.into(),
            netns: netns.into(),
            ifname: ifname.into(),
            port_mappings: Vec::new(),
            ip_ranges: Vec::new(),
            bandwidth: None,
            dns: None,
            mac: None,
            ips: Vec::new(),
            capability_args: BTreeMap::new(),
            plugin_args: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.container.is_empty() {
            return Err(Error::InvalidArgument("container id is required".into()));
        }
        if self.container.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "container id {:?} must not contain '/'",
                self.container
            )));
        }
        if self.netns.is_empty() {
            return Err(Error::InvalidArgument("netns path is required".into()));
        }
        validate_ifname(&self.ifname)?;

        for name in self.capability_args.keys() {
            if !KNOWN_CAPABILITIES.contains(&name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "unknown capability argument {name:?}"
                )));
            }
        }
        for (key, value) in &self.plugin_args {
            if key.is_empty() || key.contains(['=', ';']) {
                return Err(Error::InvalidArgument(format!(
                    "invalid plugin argument key {key:?}"
                )));
            }
            if value.contains(';') {
                return Err(Error::InvalidArgument(format!(
                    "plugin argument {key} must not contain ';'"
                )));
            }
        }
        Ok(())
    }

    /// Plugin arguments in `K=V;K=V` form.
    pub fn cni_args(&self) -> String {
        self.plugin_args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

fn validate_ifname(ifname: &str) -> Result<()> {
    let bad = ifname.is_empty()
        || ifname.len() > MAX_IFNAME_LEN
        || ifname == "."
        || ifname == ".."
        || ifname.contains(|c: char| c == '/' || c.is_whitespace());
    if bad {
        return Err(Error::InvalidArgument(format!(
            "invalid interface name {ifname:?}"
        )));
    }
    Ok(())
}

/// Builder for [`AttachmentArgs`] with the recognized capability fields.
#[derive(Debug, Clone)]
pub struct AttachmentArgsBuilder {
    container: String,
    netns: String,
    ifname: String,
    port_mappings: Vec<PortMapping>,
    ip_ranges: Vec<Vec<IpRange>>,
    bandwidth: Option<BandWidth>,
    dns: Option<Dns>,
    mac: Option<String>,
    ips: Vec<IpNet>,
    capability_args: BTreeMap<String, Value>,
    plugin_args: BTreeMap<String, String>,
}

impl AttachmentArgsBuilder {
    pub fn port_mapping(mut self, mapping: PortMapping) -> Self {
        self.port_mappings.push(mapping);
        self
    }

    /// Adds one range set (all ranges of one set share an address family).
    pub fn ip_range_set(mut self, ranges: Vec<IpRange>) -> Self {
        self.ip_ranges.push(ranges);
        self
    }

    pub fn bandwidth(mut self, bandwidth: BandWidth) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn dns(mut self, dns: Dns) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn ip(mut self, ip: IpNet) -> Self {
        self.ips.push(ip);
        self
    }

    /// Raw capability argument; `build` rejects names that are not known
    /// capabilities.
    pub fn capability_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.capability_args.insert(name.into(), value);
        self
    }

    pub fn plugin_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.plugin_args.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<AttachmentArgs> {
        let mut caps = self.capability_args;
        if !self.port_mappings.is_empty() {
            caps.insert("portMappings".into(), serde_json::to_value(&self.port_mappings)?);
        }
        if !self.ip_ranges.is_empty() {
            caps.insert("ipRanges".into(), serde_json::to_value(&self.ip_ranges)?);
        }
        if let Some(bw) = &self.bandwidth {
            caps.insert("bandwidth".into(), serde_json::to_value(bw)?);
        }
        if let Some(dns) = &self.dns {
            caps.insert("dns".into(), serde_json::to_value(dns)?);
        }
        if let Some(mac) = self.mac {
            caps.insert("mac".into(), Value::String(mac));
        }
        if !self.ips.is_empty() {
            caps.insert("ips".into(), serde_json::to_value(&self.ips)?);
        }

        let args = AttachmentArgs {
            container: self.container,
            netns: self.netns,
            ifname: self.ifname,
            capability_args: caps,
            plugin_args: self.plugin_args,
        };
        args.validate()?;
        Ok(args)
    }
}

/// Selects attachments by container and/or interface name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentFilter {
    pub container: Option<String>,
    pub ifname: Option<String>,
}

impl AttachmentFilter {
    pub fn matches(&self, container: &str, ifname: &str) -> bool {
        self.container.as_deref().is_none_or(|c| c == container)
            && self.ifname.as_deref().is_none_or(|i| i == ifname)
    }
}

// ============================================================================
// Attachment identity
// ============================================================================

/// Deterministic attachment ID: `manager/network/namespace/container/ifname`.
pub fn attachment_id(
    manager: &str,
    network: &str,
    namespace: &str,
    container: &str,
    ifname: &str,
) -> String {
    format!("{manager}/{network}/{namespace}/{container}/{ifname}")
}

/// Components of an attachment ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentKey {
    pub manager: String,
    pub network: String,
    pub namespace: String,
    pub container: String,
    pub ifname: String,
}

impl AttachmentKey {
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('/').collect();
        match parts.as_slice() {
            [manager, network, namespace, container, ifname]
                if parts.iter().all(|p| !p.is_empty()) =>
            {
                Ok(Self {
                    manager: manager.to_string(),
                    network: network.to_string(),
                    namespace: namespace.to_string(),
                    container: container.to_string(),
                    ifname: ifname.to_string(),
                })
            }
            _ => Err(Error::InvalidArgument(format!(
                "malformed attachment id {id:?}"
            ))),
        }
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&attachment_id(
            &self.manager,
            &self.network,
            &self.namespace,
            &self.container,
            &self.ifname,
        ))
    }
}

// ============================================================================
// Attachment records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Pending,
    Active,
    Error,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "pending",
            AttachmentStatus::Active => "active",
            AttachmentStatus::Error => "error",
        }
    }

    /// Status only moves forward out of `Pending`.
    pub fn can_transition_to(self, next: AttachmentStatus) -> bool {
        matches!(
            (self, next),
            (AttachmentStatus::Pending, AttachmentStatus::Active)
                | (AttachmentStatus::Pending, AttachmentStatus::Error)
        )
    }
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub sandbox: String,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// What the plugin runtime reports after a successful add.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResult {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: Dns,
}

/// Persisted attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub args: AttachmentArgs,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: AttachmentStatus,
    #[serde(default)]
    pub result: Option<PluginResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttachmentRecord {
    pub fn lease(&self) -> Option<&str> {
        self.labels.get(LABEL_LEASE).map(String::as_str)
    }
}

/// Attachment as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub id: String,
    pub manager: String,
    pub network: String,
    pub lease: Option<String>,
    pub status: AttachmentStatus,
    pub interfaces: Vec<Interface>,
    pub routes: Vec<Route>,
    pub dns: Dns,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttachmentInfo {
    pub fn from_record(manager: &str, network: &str, record: &AttachmentRecord) -> Self {
        let result = record.result.clone().unwrap_or_default();
        Self {
            id: record.id.clone(),
            manager: manager.to_string(),
            network: network.to_string(),
            lease: record.lease().map(str::to_string),
            status: record.status,
            interfaces: result.interfaces,
            routes: result.routes,
            dns: result.dns,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
