use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mvirt_netns::config::{DEFAULT_MANAGER, ManagerSpec, ServiceConfig};
use mvirt_netns::daemon::Daemon;
use mvirt_netns::store::Store;
use mvirt_netns::types::{
    AttachmentArgs, AttachmentFilter, AttachmentInfo, NetworkConfig, NetworkInfo, NetworkOptions,
};
use mvirt_netns::{Context, Proxy, Service, grpc};

/// Default gRPC listen address.
const LISTEN_ADDR: &str = "[::1]:50056";

/// Default database path.
const DB_PATH: &str = "/var/lib/mvirt/netns/networks.redb";

#[derive(Parser)]
#[command(name = "mvirt-netns")]
#[command(about = "Network attachment manager for mvirt containers", long_about = None)]
struct Cli {
    /// gRPC server address (client commands)
    #[arg(short, long, default_value = "http://[::1]:50056")]
    server: String,

    /// Namespace the call is scoped to
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Network manager to use
    #[arg(short = 'm', long, default_value = DEFAULT_MANAGER)]
    network_manager: String,

    /// Lease owning created attachments
    #[arg(long)]
    lease: Option<String>,

    /// Call timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Serve {
        /// Listen address
        #[arg(long, default_value = LISTEN_ADDR)]
        listen: SocketAddr,

        /// Database path
        #[arg(long, default_value = DB_PATH)]
        db: PathBuf,

        /// Network manager as NAME=BIN_DIR:CONF_DIR (repeatable)
        #[arg(long = "manager")]
        managers: Vec<ManagerSpec>,
    },

    /// Create a network
    Create {
        /// Network name
        name: String,

        /// Path to a CNI network configuration list
        #[arg(long, conflicts_with = "conf")]
        conflist: Option<PathBuf>,

        /// Path to a single CNI network configuration
        #[arg(long)]
        conf: Option<PathBuf>,

        /// Label as KEY=VALUE (repeatable)
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,
    },

    /// Delete a network
    Delete {
        /// Network name
        name: String,
    },

    /// List networks
    Ls,

    /// Attach a container to a network
    Attach {
        /// Network name
        network: String,

        /// Container ID
        container: String,

        /// Path of the container's network namespace
        #[arg(long)]
        netns: String,

        /// Interface name inside the container
        #[arg(long, default_value = "eth0")]
        ifname: String,

        /// Plugin argument as KEY=VALUE (repeatable)
        #[arg(long = "arg", value_parser = parse_key_value)]
        plugin_args: Vec<(String, String)>,
    },

    /// Detach an attachment
    Detach {
        /// Network name
        network: String,

        /// Attachment ID
        id: String,
    },

    /// Check an attachment
    Check {
        /// Network name
        network: String,

        /// Attachment ID
        id: String,
    },

    /// List attachments of a network
    Attachments {
        /// Network name
        network: String,

        /// Only attachments of this container
        #[arg(long)]
        container: Option<String>,

        /// Only attachments with this interface name
        #[arg(long)]
        ifname: Option<String>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    Ok((k.to_string(), v.to_string()))
}

#[derive(Tabled)]
struct NetworkRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CONFIG")]
    config: String,
    #[tabled(rename = "LABELS")]
    labels: String,
}

impl From<NetworkInfo> for NetworkRow {
    fn from(info: NetworkInfo) -> Self {
        let labels = info
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            name: info.name,
            config: info.config.as_str().to_string(),
            labels: if labels.is_empty() { "-".into() } else { labels },
        }
    }
}

#[derive(Tabled)]
struct AttachmentRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "LEASE")]
    lease: String,
    #[tabled(rename = "ADDRESSES")]
    addresses: String,
}

impl From<AttachmentInfo> for AttachmentRow {
    fn from(info: AttachmentInfo) -> Self {
        let addresses = info
            .interfaces
            .iter()
            .flat_map(|i| i.ips.iter().map(|ip| ip.address.to_string()))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            id: info.id,
            status: info.status.to_string(),
            lease: info.lease.unwrap_or_else(|| "-".into()),
            addresses: if addresses.is_empty() { "-".into() } else { addresses },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mvirt_netns=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Serve {
            listen,
            db,
            managers,
        } => return serve(listen, db, managers).await,
        command => command,
    };

    let mut ctx = Context::with_namespace(&cli.namespace);
    if let Some(lease) = &cli.lease {
        ctx = ctx.lease(lease);
    }
    if let Some(secs) = cli.timeout {
        ctx = ctx.timeout(Duration::from_secs(secs));
    }

    let proxy = Proxy::connect(cli.server.clone())
        .await
        .with_context(|| format!("Cannot connect to mvirt-netns daemon at {}", cli.server))?;

    run_client(&proxy, &ctx, &cli.network_manager, command).await
}

async fn serve(listen: SocketAddr, db: PathBuf, managers: Vec<ManagerSpec>) -> Result<()> {
    info!("Starting mvirt-netns");

    let config = ServiceConfig::from_specs(managers)?;
    let store = Store::open(&db)
        .with_context(|| format!("Failed to open database {}", db.display()))?;
    let daemon = Daemon::with_cni(&config, Arc::new(store))?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!(addr = %listen, db = %db.display(), "Starting gRPC server");

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    grpc::serve(listener, daemon.service(), async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    })
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn run_client(
    service: &dyn Service,
    ctx: &Context,
    manager: &str,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Serve { .. } => bail!("serve is not a client command"),

        Commands::Create {
            name,
            conflist,
            conf,
            labels,
        } => {
            let config = match (conflist, conf) {
                (Some(path), _) => NetworkConfig::ConfList(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                (None, Some(path)) => NetworkConfig::Conf(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                (None, None) => NetworkConfig::Invalid,
            };
            let mut opts = NetworkOptions::new().config(config);
            for (k, v) in labels {
                opts = opts.label(k, v);
            }
            let info = service.create_network(ctx, manager, &name, opts).await?;
            println!("Created network {}/{}", info.manager, info.name);
        }

        Commands::Delete { name } => {
            service.delete_network(ctx, manager, &name).await?;
            println!("Deleted network {manager}/{name}");
        }

        Commands::Ls => {
            let networks = service.list_networks(ctx, manager).await?;
            if networks.is_empty() {
                println!("No networks found");
            } else {
                let rows: Vec<NetworkRow> = networks.into_iter().map(Into::into).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Attach {
            network,
            container,
            netns,
            ifname,
            plugin_args,
        } => {
            let mut builder = AttachmentArgs::builder(container, netns, ifname);
            for (k, v) in plugin_args {
                builder = builder.plugin_arg(k, v);
            }
            let info = service
                .attach_network(ctx, manager, &network, builder.build()?)
                .await?;
            println!("{}", Table::new([AttachmentRow::from(info)]));
        }

        Commands::Detach { network, id } => {
            service.detach_network(ctx, manager, &network, &id).await?;
            println!("Detached {id}");
        }

        Commands::Check { network, id } => {
            if !service.check_attachment(ctx, manager, &network, &id).await? {
                bail!("attachment {id} is unhealthy");
            }
            println!("Attachment {id} is healthy");
        }

        Commands::Attachments {
            network,
            container,
            ifname,
        } => {
            let filter = AttachmentFilter { container, ifname };
            let attachments = service
                .list_attachments(ctx, manager, &network, &filter)
                .await?;
            if attachments.is_empty() {
                println!("No attachments found");
            } else {
                let rows: Vec<AttachmentRow> = attachments.into_iter().map(Into::into).collect();
                println!("{}", Table::new(rows));
            }
        }
    }
    Ok(())
}
