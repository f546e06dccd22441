//! DNS daemon orchestration.
//!
//! Validates configuration, wires the gates together, binds the transports
//! and runs them along with the periodic tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::try_join;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::allowlist::{AllowList, PublicIpLookup};
use crate::config::DaemonConfig;
use crate::dispatch::Shards;
use crate::error::{Error, Result};
use crate::filter::Blacklist;
use crate::http;
use crate::ratelimit::RateLimit;
use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::UdpForwarder;

/// How often statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Bound but not yet running listeners.
pub struct Listeners {
    udp: Option<UdpTransport>,
    tcp: Option<TcpTransport>,
}

impl Listeners {
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|t| t.local_addr().ok())
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|t| t.local_addr().ok())
    }
}

/// A DNS forwarder that refuses to resolve ad and tracker domains.
pub struct Daemon {
    config: DaemonConfig,
    resolver: Arc<Resolver>,
    blacklist: Arc<Blacklist>,
    stats: Arc<Stats>,
    /// One per forward shard, handed to the workers when serving starts.
    udp_forwarders: Mutex<Vec<UdpForwarder>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl Daemon {
    /// Check the configuration and set up internal state.
    ///
    /// Starts the rate limiter, allows this host's public IP and dials one
    /// forwarder socket per shard. Fails on bad configuration or an
    /// unreachable forwarder.
    pub async fn initialise(config: DaemonConfig) -> Result<Self> {
        config.validate()?;

        let client = http::client()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let rate_limit = Arc::new(RateLimit::new(
            config.rate_limit_window(),
            config.per_ip_limit,
        ));
        rate_limit.initialise(shutdown_tx.subscribe());

        let lookup = config.public_ip_url.clone().map(|url| PublicIpLookup {
            client: client.clone(),
            url,
            interval: config.public_ip_refresh(),
        });
        let allow_list = Arc::new(AllowList::new(
            config.allow_query_ip_prefixes.clone(),
            lookup,
        ));
        // Always allow the host to query itself through its public IP.
        allow_list.refresh_if_due().await;

        let blacklist = Arc::new(Blacklist::new(client, config.blacklist_sources.clone()));
        let stats = Arc::new(Stats::new());

        let mut udp_forwarders = Vec::new();
        if let (Some(_), Some(addr)) = (config.udp_bind_addr(), config.udp_forwarder) {
            for _ in 0..config.shard_count() {
                let forwarder = UdpForwarder::dial(addr, config.io_timeout())
                    .await
                    .map_err(|source| Error::Forwarder { addr, source })?;
                udp_forwarders.push(forwarder);
            }
        }

        let resolver = Arc::new(Resolver::new(
            allow_list,
            rate_limit,
            blacklist.clone(),
            stats.clone(),
        ));

        Ok(Self {
            config,
            resolver,
            blacklist,
            stats,
            udp_forwarders: Mutex::new(udp_forwarders),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Bind the configured listeners. Nothing is read until [`serve`].
    ///
    /// [`serve`]: Daemon::serve
    pub async fn bind(&self) -> Result<Listeners> {
        let udp = match self.config.udp_bind_addr() {
            Some(addr) => Some(UdpTransport::bind(addr).await?),
            None => None,
        };
        let tcp = match self.config.tcp_bind_addr() {
            Some(addr) => Some(TcpTransport::bind(addr).await?),
            None => None,
        };

        Ok(Listeners { udp, tcp })
    }

    /// Load the blacklist, then serve queries until [`stop`] is called or a
    /// listener fails.
    ///
    /// If either listener fails, all listeners are closed and the error is
    /// returned.
    ///
    /// [`stop`]: Daemon::stop
    pub async fn serve(&self, listeners: Listeners) -> Result<()> {
        // Subscribe before the first await so a stop() during the initial
        // refresh reaches every task started below.
        let udp_shutdown = self.shutdown_tx.subscribe();
        let tcp_shutdown = self.shutdown_tx.subscribe();
        let updater_shutdown = self.shutdown_tx.subscribe();
        let stats_shutdown = self.shutdown_tx.subscribe();
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let forwarders = match self.udp_forwarders.lock() {
            Ok(mut forwarders) => std::mem::take(&mut *forwarders),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if listeners.udp.is_some() && forwarders.is_empty() {
            return Err(Error::Config("daemon has already been started".into()));
        }

        if let Err(e) = self.blacklist.refresh().await {
            warn!(error = %e, "starting without an ad-blacklist");
        }
        if self.stopped.load(Ordering::SeqCst) {
            info!("stopped while loading the ad-blacklist");
            return Ok(());
        }
        self.blacklist
            .spawn_updater(self.config.blacklist_refresh(), updater_shutdown);
        self.spawn_stats_reporter(stats_shutdown);

        info!(
            udp = ?listeners.udp_addr(),
            tcp = ?listeners.tcp_addr(),
            shards = forwarders.len(),
            blocked = self.resolver.blocked_count(),
            "DNS daemon listening"
        );

        let udp = async {
            let Some(transport) = listeners.udp else {
                return Ok(());
            };
            let shards = Shards::spawn(
                forwarders,
                transport.socket(),
                self.stats.clone(),
                &self.shutdown_tx,
            );
            transport
                .run(self.resolver.clone(), shards, udp_shutdown)
                .await
        };
        let tcp = async {
            let (Some(transport), Some(forwarder)) = (listeners.tcp, self.config.tcp_forwarder)
            else {
                return Ok(());
            };
            transport
                .run(
                    self.resolver.clone(),
                    forwarder,
                    self.config.io_timeout(),
                    tcp_shutdown,
                )
                .await
        };

        if let Err(e) = try_join(udp, tcp).await {
            error!(error = %e, "listener failed, shutting down");
            self.stop();
            return Err(e.into());
        }
        Ok(())
    }

    /// Bind and serve; blocks until stopped or a listener fails.
    pub async fn start_and_block(&self) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Close the listeners and stop every periodic task.
    ///
    /// Queued queries are still answered; workers exit once drained.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Fails only when nothing is subscribed, i.e. nothing is running.
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_stats_reporter(&self, mut shutdown: broadcast::Receiver<()>) {
        let stats = self.stats.clone();
        let resolver = self.resolver.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        let stats = stats.snapshot_and_reset();
                        info!(
                            uptime_secs = stats.uptime_secs,
                            blacklist = resolver.blocked_count(),
                            requests = stats.requests,
                            forwarded = stats.forwarded,
                            blackholed = stats.blackholed,
                            unauthorized = stats.unauthorized,
                            rate_limited = stats.rate_limited,
                            dropped = stats.dropped,
                            avg_response_ms = format_args!("{:.2}", stats.avg_response_ms),
                            "stats"
                        );
                    }
                }
            }
        });
    }
}
