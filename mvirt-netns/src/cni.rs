//! CNI plugin runtime.
//!
//! Executes plugin binaries from a bin directory following the CNI exec
//! protocol: the command and container coordinates go into `CNI_*`
//! environment variables, the plugin configuration goes to stdin and the
//! result (or an error object) comes back on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::IpAddr;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::plugin::{PluginError, PluginRuntime};
use crate::types::{
    AttachmentArgs, Dns, Interface, IpConfig, NetworkConfig, NetworkInfo, PluginResult, Route,
};

/// CNI version assumed when a config does not declare one.
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// CNI error code for "unknown container".
const CNI_ERR_UNKNOWN_CONTAINER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CniCommand {
    Add,
    Del,
    Check,
}

impl CniCommand {
    fn as_str(&self) -> &'static str {
        match self {
            CniCommand::Add => "ADD",
            CniCommand::Del => "DEL",
            CniCommand::Check => "CHECK",
        }
    }
}

/// A normalized network configuration: a single `.conf` becomes a list
/// with one plugin.
#[derive(Debug, Clone, PartialEq)]
struct ConfList {
    name: String,
    cni_version: String,
    plugins: Vec<Map<String, Value>>,
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, PluginError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(PluginError::InvalidConfig("config is not a JSON object".into())),
        Err(e) => Err(PluginError::InvalidConfig(format!("config is not JSON: {e}"))),
    }
}

fn string_field(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn plugin_type(plugin: &Map<String, Value>) -> Result<&str, PluginError> {
    plugin
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty() && !t.contains('/'))
        .ok_or_else(|| PluginError::InvalidConfig("plugin config without a valid \"type\"".into()))
}

fn parse_conf(bytes: &[u8]) -> Result<ConfList, PluginError> {
    let obj = parse_object(bytes)?;
    plugin_type(&obj)?;
    let name = string_field(&obj, "name")
        .ok_or_else(|| PluginError::InvalidConfig("config without \"name\"".into()))?;
    let cni_version =
        string_field(&obj, "cniVersion").unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string());
    Ok(ConfList {
        name,
        cni_version,
        plugins: vec![obj],
    })
}

fn parse_conflist(bytes: &[u8]) -> Result<ConfList, PluginError> {
    let obj = parse_object(bytes)?;
    let name = string_field(&obj, "name")
        .ok_or_else(|| PluginError::InvalidConfig("config list without \"name\"".into()))?;
    let cni_version =
        string_field(&obj, "cniVersion").unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string());

    let plugins = match obj.get("plugins") {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|p| match p {
                Value::Object(p) => {
                    plugin_type(p)?;
                    Ok(p.clone())
                }
                _ => Err(PluginError::InvalidConfig(
                    "plugin entry is not a JSON object".into(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(PluginError::InvalidConfig(
                "config list needs a non-empty \"plugins\" array".into(),
            ));
        }
    };

    Ok(ConfList {
        name,
        cni_version,
        plugins,
    })
}

fn parse_network_config(config: &NetworkConfig) -> Result<Option<ConfList>, PluginError> {
    match config {
        NetworkConfig::Invalid => Ok(None),
        NetworkConfig::Conf(b) => parse_conf(b).map(Some),
        NetworkConfig::ConfList(b) => parse_conflist(b).map(Some),
    }
}

/// Checks a config supplied at network creation.
///
/// `Invalid` is accepted and means "unconfigured"; anything else must parse
/// and carry the network's name.
pub fn validate_config(network: &str, config: &NetworkConfig) -> Result<(), PluginError> {
    if let Some(list) = parse_network_config(config)? {
        if list.name != network {
            return Err(PluginError::InvalidConfig(format!(
                "config name {:?} does not match network {network:?}",
                list.name
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Deserialize)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    dns: CniDns,
}

#[derive(Debug, Deserialize)]
struct CniInterface {
    name: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    sandbox: String,
}

#[derive(Debug, Deserialize)]
struct CniIp {
    address: IpNet,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    interface: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CniDns {
    #[serde(default)]
    nameservers: Vec<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    search: Vec<String>,
    #[serde(default)]
    options: Vec<String>,
}

impl From<CniResult> for PluginResult {
    fn from(r: CniResult) -> Self {
        let mut interfaces: Vec<Interface> = r
            .interfaces
            .into_iter()
            .map(|i| Interface {
                name: i.name,
                mac: i.mac,
                sandbox: i.sandbox,
                ips: Vec::new(),
            })
            .collect();

        for ip in r.ips {
            // IPs not bound to a reported interface are dropped.
            if let Some(iface) = ip.interface.and_then(|idx| interfaces.get_mut(idx)) {
                iface.ips.push(IpConfig {
                    address: ip.address,
                    gateway: ip.gateway,
                });
            }
        }

        let mut searches = r.dns.search;
        if let Some(domain) = r.dns.domain.filter(|d| !searches.contains(d)) {
            searches.insert(0, domain);
        }

        PluginResult {
            interfaces,
            routes: r.routes,
            dns: Dns {
                servers: r.dns.nameservers,
                searches,
                options: r.dns.options,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CniErrorBody {
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

// ============================================================================
// Runtime
// ============================================================================

/// Runs CNI plugins for one plugin environment.
#[derive(Debug, Clone)]
pub struct CniRuntime {
    bin_dir: PathBuf,
    conf_dir: PathBuf,
}

impl CniRuntime {
    pub fn new(bin_dir: impl Into<PathBuf>, conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            conf_dir: conf_dir.into(),
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    async fn resolve(&self, network: &NetworkInfo) -> Result<ConfList, PluginError> {
        match parse_network_config(&network.config)? {
            Some(list) => Ok(list),
            None => self.load_from_conf_dir(&network.name).await,
        }
    }

    /// Finds the config named `name` in the conf dir. Files are tried in
    /// lexical order; malformed files are skipped.
    async fn load_from_conf_dir(&self, name: &str) -> Result<ConfList, PluginError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.conf_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if matches!(ext, "conflist" | "conf" | "json") {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let data = tokio::fs::read(&path).await?;
            let parsed = if path.extension().is_some_and(|e| e == "conflist") {
                parse_conflist(&data)
            } else {
                parse_conf(&data)
            };
            match parsed {
                Ok(list) if list.name == name => {
                    debug!(path = %path.display(), network = name, "using network config");
                    return Ok(list);
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping network config"),
            }
        }

        Err(PluginError::InvalidConfig(format!(
            "no config for network {name} in {}",
            self.conf_dir.display()
        )))
    }

    async fn exec(
        &self,
        command: CniCommand,
        plugin: &str,
        stdin: &[u8],
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<Vec<u8>, PluginError> {
        let binary = self.bin_dir.join(plugin);
        if !binary.is_file() {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("plugin {plugin} not found in {}", self.bin_dir.display()),
            )));
        }

        debug!(
            command = command.as_str(),
            plugin,
            container = %args.container,
            ifname = if_name,
            "exec cni plugin"
        );

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", &args.container)
            .env("CNI_NETNS", ns_path)
            .env("CNI_IFNAME", if_name)
            .env("CNI_ARGS", args.cni_args())
            .env("CNI_PATH", &self.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut input) = child.stdin.take() {
            if let Err(e) = input.write_all(stdin).await {
                // The plugin may exit without reading its config.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        match serde_json::from_slice::<CniErrorBody>(&output.stdout) {
            Ok(body) if body.code == CNI_ERR_UNKNOWN_CONTAINER => {
                Err(PluginError::NotFound(body.msg))
            }
            Ok(body) => Err(PluginError::Failed {
                plugin: plugin.to_string(),
                code: body.code,
                msg: if body.details.is_empty() {
                    body.msg
                } else {
                    format!("{}: {}", body.msg, body.details)
                },
            }),
            Err(_) => Err(PluginError::Failed {
                plugin: plugin.to_string(),
                code: output.status.code().map(|c| c as u32).unwrap_or_default(),
                msg: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

/// Builds the stdin config for one plugin of a list.
fn plugin_stdin(
    list: &ConfList,
    plugin: &Map<String, Value>,
    args: &AttachmentArgs,
    prev: Option<&Value>,
) -> Map<String, Value> {
    let mut conf = plugin.clone();
    conf.insert("name".into(), Value::String(list.name.clone()));
    conf.insert("cniVersion".into(), Value::String(list.cni_version.clone()));

    if let Some(Value::Object(caps)) = plugin.get("capabilities") {
        let runtime: Map<String, Value> = caps
            .iter()
            .filter(|(_, enabled)| enabled.as_bool() == Some(true))
            .filter_map(|(name, _)| {
                args.capability_args
                    .get(name)
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();
        if !runtime.is_empty() {
            conf.insert("runtimeConfig".into(), Value::Object(runtime));
        }
    }

    if let Some(prev) = prev {
        conf.insert("prevResult".into(), prev.clone());
    }
    conf
}

#[async_trait]
impl PluginRuntime for CniRuntime {
    async fn add(
        &self,
        network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<PluginResult, PluginError> {
        let list = self.resolve(network).await?;
        let mut prev: Option<Value> = None;

        for plugin in &list.plugins {
            let stdin = serde_json::to_vec(&plugin_stdin(&list, plugin, args, prev.as_ref()))?;
            let out = self
                .exec(CniCommand::Add, plugin_type(plugin)?, &stdin, ns_path, if_name, args)
                .await?;
            // Some chained plugins print nothing and pass the result through.
            if !out.iter().all(u8::is_ascii_whitespace) {
                prev = Some(serde_json::from_slice(&out)?);
            }
        }

        match prev {
            Some(v) => Ok(serde_json::from_value::<CniResult>(v)?.into()),
            None => Ok(PluginResult::default()),
        }
    }

    async fn delete(
        &self,
        network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<(), PluginError> {
        let list = self.resolve(network).await?;

        for plugin in list.plugins.iter().rev() {
            let stdin = serde_json::to_vec(&plugin_stdin(&list, plugin, args, None))?;
            let kind = plugin_type(plugin)?;
            match self
                .exec(CniCommand::Del, kind, &stdin, ns_path, if_name, args)
                .await
            {
                Ok(_) => {}
                Err(PluginError::NotFound(msg)) => {
                    debug!(plugin = kind, container = %args.container, %msg, "already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn check(
        &self,
        network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<(), PluginError> {
        let list = self.resolve(network).await?;

        for plugin in &list.plugins {
            let stdin = serde_json::to_vec(&plugin_stdin(&list, plugin, args, None))?;
            self.exec(
                CniCommand::Check,
                plugin_type(plugin)?,
                &stdin,
                ns_path,
                if_name,
                args,
            )
            .await?;
        }
        Ok(())
    }
}
