//! Service façade.
//!
//! [`Service`] is implemented by [`Local`], which dispatches straight into
//! the configured managers, and by [`Proxy`], which forwards every call to a
//! remote daemon. Both report the same error kinds for the same inputs.

pub mod local;
pub mod proxy;
pub mod remote;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::types::{AttachmentArgs, AttachmentFilter, AttachmentInfo, NetworkInfo, NetworkOptions};

pub use local::Local;
pub use proxy::Proxy;
pub use remote::{RemoteAttachment, RemoteManager, RemoteNetwork};

#[async_trait]
pub trait Service: Send + Sync {
    async fn create_network(
        &self,
        ctx: &Context,
        manager: &str,
        name: &str,
        opts: NetworkOptions,
    ) -> Result<NetworkInfo>;

    async fn delete_network(&self, ctx: &Context, manager: &str, name: &str) -> Result<()>;

    async fn get_network(&self, ctx: &Context, manager: &str, name: &str) -> Result<NetworkInfo>;

    /// Networks of `manager` in the context namespace, ordered by name.
    async fn list_networks(&self, ctx: &Context, manager: &str) -> Result<Vec<NetworkInfo>>;

    async fn attach_network(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        args: AttachmentArgs,
    ) -> Result<AttachmentInfo>;

    async fn detach_network(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<()>;

    async fn get_attachment(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<AttachmentInfo>;

    /// `Ok(false)` when the attachment exists but is unhealthy.
    async fn check_attachment(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<bool>;

    async fn list_attachments(
        &self,
        ctx: &Context,
        manager: &str,
        network: &str,
        filter: &AttachmentFilter,
    ) -> Result<Vec<AttachmentInfo>>;
}
