use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use blackhole_dnsd::{Daemon, DaemonConfig};

#[derive(Parser)]
#[command(name = "blackhole-dnsd")]
#[command(about = "DNS forwarder that blackholes ad and tracker domains", long_about = None)]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    address: Option<IpAddr>,

    /// UDP listen port, 0 disables UDP
    #[arg(long)]
    udp_port: Option<u16>,

    /// TCP listen port, 0 disables TCP
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Resolver that UDP queries are forwarded to (ip:port)
    #[arg(long)]
    udp_forwarder: Option<SocketAddr>,

    /// Resolver that TCP queries are forwarded to (ip:port)
    #[arg(long)]
    tcp_forwarder: Option<SocketAddr>,

    /// Queries an IP may send within each 10 second window
    #[arg(long)]
    per_ip_limit: Option<u32>,

    /// Allow clients whose address starts with this prefix (repeatable)
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.udp_port {
            config.udp_port = port;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if self.udp_forwarder.is_some() {
            config.udp_forwarder = self.udp_forwarder;
        }
        if self.tcp_forwarder.is_some() {
            config.tcp_forwarder = self.tcp_forwarder;
        }
        if let Some(limit) = self.per_ip_limit {
            config.per_ip_limit = limit;
        }
        if !self.allow.is_empty() {
            config.allow_query_ip_prefixes = self.allow;
        }

        Ok(config)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = args.into_config()?;
    let daemon = Arc::new(
        Daemon::initialise(config)
            .await
            .context("failed to initialise DNS daemon")?,
    );

    let on_signal = daemon.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutting down DNS daemon...");
            on_signal.stop();
        }
    });

    daemon.start_and_block().await?;
    Ok(())
}
