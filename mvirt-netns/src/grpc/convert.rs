//! Conversions between protobuf messages and domain types.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;

use super::proto;
use crate::error::{Error, Result};
use crate::types::{
    AttachmentArgs, AttachmentFilter, AttachmentInfo, AttachmentStatus, Dns, Interface, IpConfig,
    NetworkConfig, NetworkInfo, Route,
};

fn malformed(what: &str, e: impl std::fmt::Display) -> Error {
    Error::InvalidArgument(format!("malformed {what}: {e}"))
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

// ============================================================================
// Networks
// ============================================================================

pub fn network_config_to_proto(config: &NetworkConfig) -> proto::NetworkConfig {
    let kind = match config {
        NetworkConfig::Invalid => proto::NetworkConfigKind::Invalid,
        NetworkConfig::ConfList(_) => proto::NetworkConfigKind::Conflist,
        NetworkConfig::Conf(_) => proto::NetworkConfigKind::Conf,
    };
    proto::NetworkConfig {
        kind: kind as i32,
        data: config.data().to_vec(),
    }
}

/// A missing config decodes to [`NetworkConfig::Invalid`].
pub fn network_config_from_proto(config: Option<proto::NetworkConfig>) -> Result<NetworkConfig> {
    let Some(config) = config else {
        return Ok(NetworkConfig::Invalid);
    };
    let kind = proto::NetworkConfigKind::try_from(config.kind)
        .map_err(|e| malformed("network config kind", e))?;
    Ok(match kind {
        proto::NetworkConfigKind::Invalid => NetworkConfig::Invalid,
        proto::NetworkConfigKind::Conflist => NetworkConfig::ConfList(config.data),
        proto::NetworkConfigKind::Conf => NetworkConfig::Conf(config.data),
    })
}

pub fn network_info_to_proto(info: &NetworkInfo) -> proto::NetworkInfo {
    proto::NetworkInfo {
        network_manager: info.manager.clone(),
        name: info.name.clone(),
        config: Some(network_config_to_proto(&info.config)),
        labels: info
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

pub fn network_info_from_proto(info: proto::NetworkInfo) -> Result<NetworkInfo> {
    Ok(NetworkInfo {
        manager: info.network_manager,
        name: info.name,
        config: network_config_from_proto(info.config)?,
        labels: info.labels.into_iter().collect(),
    })
}

// ============================================================================
// Attachments
// ============================================================================

pub fn attach_request(
    manager: &str,
    network: &str,
    args: &AttachmentArgs,
) -> Result<proto::AttachNetworkRequest> {
    let capability_args = args
        .capability_args
        .iter()
        .map(|(k, v)| Ok((k.clone(), serde_json::to_vec(v)?)))
        .collect::<Result<HashMap<_, _>>>()?;

    Ok(proto::AttachNetworkRequest {
        network_manager: manager.to_string(),
        network_name: network.to_string(),
        container: args.container.clone(),
        netns: args.netns.clone(),
        ifname: args.ifname.clone(),
        capability_args,
        plugin_args: args
            .plugin_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })
}

pub fn attachment_args_from_proto(req: proto::AttachNetworkRequest) -> Result<AttachmentArgs> {
    let mut capability_args = BTreeMap::new();
    for (name, raw) in req.capability_args {
        let value = serde_json::from_slice(&raw)
            .map_err(|e| malformed(&format!("capability argument {name:?}"), e))?;
        capability_args.insert(name, value);
    }

    Ok(AttachmentArgs {
        container: req.container,
        netns: req.netns,
        ifname: req.ifname,
        capability_args,
        plugin_args: req.plugin_args.into_iter().collect(),
    })
}

pub fn filter_from_proto(req: &proto::ListAttachmentsRequest) -> AttachmentFilter {
    AttachmentFilter {
        container: non_empty(req.container.clone()),
        ifname: non_empty(req.ifname.clone()),
    }
}

fn status_to_proto(status: AttachmentStatus) -> proto::AttachmentStatus {
    match status {
        AttachmentStatus::Pending => proto::AttachmentStatus::Pending,
        AttachmentStatus::Active => proto::AttachmentStatus::Active,
        AttachmentStatus::Error => proto::AttachmentStatus::Error,
    }
}

fn status_from_proto(status: i32) -> Result<AttachmentStatus> {
    match proto::AttachmentStatus::try_from(status) {
        Ok(proto::AttachmentStatus::Pending) => Ok(AttachmentStatus::Pending),
        Ok(proto::AttachmentStatus::Active) => Ok(AttachmentStatus::Active),
        Ok(proto::AttachmentStatus::Error) => Ok(AttachmentStatus::Error),
        Ok(proto::AttachmentStatus::Unspecified) | Err(_) => {
            Err(malformed("attachment status", status))
        }
    }
}

fn parse_net(what: &str, s: &str) -> Result<IpNet> {
    s.parse().map_err(|e| malformed(what, e))
}

fn parse_addr(what: &str, s: &str) -> Result<Option<IpAddr>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse().map(Some).map_err(|e| malformed(what, e))
}

fn parse_time(what: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(what, e))
}

fn addr_string(addr: Option<IpAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

pub fn attachment_info_to_proto(info: &AttachmentInfo) -> proto::AttachmentInfo {
    proto::AttachmentInfo {
        id: info.id.clone(),
        network_manager: info.manager.clone(),
        network_name: info.network.clone(),
        lease: info.lease.clone().unwrap_or_default(),
        status: status_to_proto(info.status) as i32,
        interfaces: info
            .interfaces
            .iter()
            .map(|iface| proto::Interface {
                name: iface.name.clone(),
                mac: iface.mac.clone(),
                sandbox: iface.sandbox.clone(),
                ips: iface
                    .ips
                    .iter()
                    .map(|ip| proto::IpConfig {
                        address: ip.address.to_string(),
                        gateway: addr_string(ip.gateway),
                    })
                    .collect(),
            })
            .collect(),
        routes: info
            .routes
            .iter()
            .map(|r| proto::Route {
                dst: r.dst.to_string(),
                gw: addr_string(r.gw),
            })
            .collect(),
        dns: Some(proto::Dns {
            servers: info.dns.servers.clone(),
            searches: info.dns.searches.clone(),
            options: info.dns.options.clone(),
        }),
        created_at: info.created_at.to_rfc3339(),
        updated_at: info.updated_at.to_rfc3339(),
    }
}

pub fn attachment_info_from_proto(info: proto::AttachmentInfo) -> Result<AttachmentInfo> {
    let interfaces = info
        .interfaces
        .into_iter()
        .map(|iface| {
            let ips = iface
                .ips
                .iter()
                .map(|ip| {
                    Ok(IpConfig {
                        address: parse_net("interface address", &ip.address)?,
                        gateway: parse_addr("interface gateway", &ip.gateway)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Interface {
                name: iface.name,
                mac: iface.mac,
                sandbox: iface.sandbox,
                ips,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let routes = info
        .routes
        .iter()
        .map(|r| {
            Ok(Route {
                dst: parse_net("route destination", &r.dst)?,
                gw: parse_addr("route gateway", &r.gw)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let dns = info
        .dns
        .map(|d| Dns {
            servers: d.servers,
            searches: d.searches,
            options: d.options,
        })
        .unwrap_or_default();

    Ok(AttachmentInfo {
        status: status_from_proto(info.status)?,
        created_at: parse_time("created_at", &info.created_at)?,
        updated_at: parse_time("updated_at", &info.updated_at)?,
        id: info.id,
        manager: info.network_manager,
        network: info.network_name,
        lease: non_empty(info.lease),
        interfaces,
        routes,
        dns,
    })
}
