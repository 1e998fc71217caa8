mod config;

use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn_cluster::{
    ClusterMessage, ClusteringAgent, DynTransport, GroupEventListener, MemberId,
    MembershipSchemeConfig, MulticastOptions, UdpTransport,
};
use clap::Parser;
use tracing::{info, warn};

use crate::config::NodeConfig;

/// How often the node logs the group it sees.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "cairn-server", about = "cairn cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CAIRN_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// UDP address to listen on
    #[arg(long, env = "CAIRN_BIND")]
    bind: Option<String>,

    /// member id. generated when unset
    #[arg(long, env = "CAIRN_NODE_ID")]
    node_id: Option<String>,

    /// cluster domain; nodes only talk to nodes of the same domain
    #[arg(long, env = "CAIRN_DOMAIN")]
    domain: Option<String>,

    /// well-known member address (host:port). repeat for several.
    /// selects the wka membership scheme
    #[arg(long = "wka", value_name = "HOST:PORT")]
    wka: Vec<String>,

    /// discover peers on this multicast group (ip:port)
    #[arg(long, value_name = "GROUP", conflicts_with = "wka")]
    multicast: Option<SocketAddrV4>,

    /// group size required before the node reports ready
    #[arg(long, env = "CAIRN_MIN_MEMBERS")]
    min_members: Option<usize>,
}

/// Applies CLI overrides. Only values given on the command line take
/// effect, so the order is defaults, then the file, then flags.
fn apply_args(cfg: &mut NodeConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(ref id) = args.node_id {
        cfg.cluster.node_id = id.clone();
    }
    if let Some(ref domain) = args.domain {
        cfg.cluster.domain = domain.clone();
    }
    if !args.wka.is_empty() {
        cfg.cluster.membership_scheme = MembershipSchemeConfig::wka(args.wka.iter().cloned());
    }
    if let Some(group) = args.multicast {
        cfg.cluster.membership_scheme = MembershipSchemeConfig::multicast(group);
    }
    if let Some(n) = args.min_members {
        cfg.cluster.minimum_members_required = n;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Logs group events.
struct EventLog;

impl GroupEventListener for EventLog {
    fn on_leader_change(&self, new_leader: &MemberId) {
        info!("coordinator changed to {}", new_leader);
    }

    fn on_member_arrival(&self, member: &MemberId) {
        info!("member {} arrived", member);
    }

    fn on_member_departure(&self, member: &MemberId) {
        info!("member {} departed", member);
    }

    fn on_group_message(&self, sender: &MemberId, payload: &Bytes) {
        info!("{} bytes from {}", payload.len(), sender);
    }

    fn on_delivery_failure(&self, target: &MemberId, message: &ClusterMessage) {
        warn!(
            "message {} could not be delivered to {}",
            message.sequence_number, target
        );
    }
}

async fn bind_transport(addr: SocketAddr, scheme: &MembershipSchemeConfig) -> DynTransport {
    let multicast = match scheme {
        MembershipSchemeConfig::Multicast {
            group,
            interface,
            ttl,
            ..
        } => Some(MulticastOptions {
            group: *group,
            interface: *interface,
            ttl: *ttl,
        }),
        MembershipSchemeConfig::Wka { .. } => None,
    };
    match UdpTransport::bind_with(addr, multicast).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => exit_err(format!("failed to bind {addr}: {e}")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cairn=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match NodeConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => NodeConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => NodeConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let addr = cfg.bind_addr().unwrap_or_else(|e| exit_err(e));
    let transport = bind_transport(addr, &cfg.cluster.membership_scheme).await;

    let agent = match ClusteringAgent::new(cfg.cluster, transport) {
        Ok(agent) => Arc::new(agent),
        Err(e) => exit_err(format!("error: {e}")),
    };
    agent.add_membership_listener(Arc::new(EventLog));

    if let Err(e) = agent.init().await {
        exit_err(format!("error: {e}"));
    }

    let status = {
        let agent = agent.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let members: Vec<String> = agent
                    .members()
                    .iter()
                    .map(|m| m.id().to_string())
                    .collect();
                let view = agent.coordinator_view();
                info!(
                    "group [{}], coordinator {}, epoch {}, dropped frames {}",
                    members.join(", "),
                    view.coordinator_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "none".into()),
                    view.epoch,
                    agent.dropped_events()
                );
            }
        })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
    }
    info!("shutdown signal received, leaving the group...");
    status.abort();
    if let Err(e) = agent.shutdown().await {
        exit_err(format!("error during shutdown: {e}"));
    }
}
