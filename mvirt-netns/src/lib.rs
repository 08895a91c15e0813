pub mod attachment;
pub mod audit;
pub mod cni;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod gc;
pub mod grpc;
pub mod manager;
pub mod network;
pub mod plugin;
pub mod service;
pub mod store;
pub mod test_util;
pub mod types;

pub use attachment::Attachment;
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use manager::{Manager, NetManager};
pub use network::Network;
pub use service::{Local, Proxy, Service};

// Re-export tonic for external tests that need matching versions
pub use tonic;
