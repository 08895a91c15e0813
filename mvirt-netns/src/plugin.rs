//! Plugin runtime abstraction.
//!
//! The runtime performs the actual namespace and interface setup. The
//! lifecycle code only ever talks to it through [`PluginRuntime`].

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AttachmentArgs, NetworkInfo, PluginResult};

#[derive(Debug, Error)]
pub enum PluginError {
    /// The container or interface is already gone.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("plugin {plugin} failed (code {code}): {msg}")]
    Failed { plugin: String, code: u32, msg: String },

    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed plugin output: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Add/delete/check against one network.
///
/// `ns_path` is the network namespace path, `if_name` the interface name
/// inside it. Implementations must treat `delete` of something already
/// gone as `PluginError::NotFound` so callers can retry removal.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn add(
        &self,
        network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<PluginResult, PluginError>;

    async fn delete(
        &self,
        network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<(), PluginError>;

    async fn check(
        &self,
        network: &NetworkInfo,
        ns_path: &str,
        if_name: &str,
        args: &AttachmentArgs,
    ) -> Result<(), PluginError>;
}
