//! Sharded dispatch of UDP queries.
//!
//! There are as many forward shards as blackhole shards. Each shard is a
//! bounded queue drained by one worker; forward workers own one connected
//! socket to the forwarder. A client always lands on the same shard, so one
//! busy client can only back up its own lane, and a full queue drops the
//! query instead of stalling the listener.

use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHasher;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::{BLACKHOLE_QUEUE_DEPTH, FORWARD_QUEUE_DEPTH};
use crate::dns::build_blackhole_answer;
use crate::stats::Stats;
use crate::transport::{Protocol, QueryLogger, elapsed_ms};
use crate::upstream::UdpForwarder;

/// A UDP query waiting for a worker.
#[derive(Debug)]
pub struct UdpQuery {
    pub client: SocketAddr,
    pub packet: Vec<u8>,
    pub domain: String,
    pub received: Instant,
}

/// Shard selected for a client key. Stable across calls and processes.
pub fn shard_index(key: &str, shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Senders of every shard queue. Dropping this stops the workers once their
/// queues are drained.
pub struct Shards {
    forward: Vec<mpsc::Sender<UdpQuery>>,
    blackhole: Vec<mpsc::Sender<UdpQuery>>,
    stats: Arc<Stats>,
}

impl Shards {
    /// Spawn one forward worker per forwarder and as many blackhole workers.
    ///
    /// Answers are sent to clients through `server`, the listening socket.
    /// A forward worker stuck redialing its forwarder gives up once
    /// `shutdown` fires.
    pub fn spawn(
        forwarders: Vec<UdpForwarder>,
        server: Arc<UdpSocket>,
        stats: Arc<Stats>,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let mut forward = Vec::with_capacity(forwarders.len());
        let mut blackhole = Vec::with_capacity(forwarders.len());

        for (shard, upstream) in forwarders.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(FORWARD_QUEUE_DEPTH);
            tokio::spawn(forward_worker(
                shard,
                rx,
                upstream,
                server.clone(),
                stats.clone(),
                shutdown.subscribe(),
            ));
            forward.push(tx);

            let (tx, rx) = mpsc::channel(BLACKHOLE_QUEUE_DEPTH);
            tokio::spawn(blackhole_worker(rx, server.clone(), stats.clone()));
            blackhole.push(tx);
        }

        Self {
            forward,
            blackhole,
            stats,
        }
    }

    /// Queue a query for forwarding. Returns false if it was dropped.
    pub fn forward(&self, key: &str, query: UdpQuery) -> bool {
        self.enqueue(&self.forward, key, query)
    }

    /// Queue a query for a blackhole answer. Returns false if it was dropped.
    pub fn blackhole(&self, key: &str, query: UdpQuery) -> bool {
        self.enqueue(&self.blackhole, key, query)
    }

    fn enqueue(&self, queues: &[mpsc::Sender<UdpQuery>], key: &str, query: UdpQuery) -> bool {
        if queues.is_empty() {
            self.stats.record_dropped();
            return false;
        }
        let shard = shard_index(key, queues.len());
        match queues[shard].try_send(query) {
            Ok(()) => true,
            Err(e) => {
                debug!(shard, client = %key, error = %e, "dropping query");
                self.stats.record_dropped();
                false
            }
        }
    }
}

/// Relay queries to the forwarder and replies back to clients.
async fn forward_worker(
    shard: usize,
    mut queue: mpsc::Receiver<UdpQuery>,
    mut upstream: UdpForwarder,
    server: Arc<UdpSocket>,
    stats: Arc<Stats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let logger = QueryLogger::new(Protocol::Udp);

    while let Some(query) = queue.recv().await {
        let upstream_start = Instant::now();
        match upstream.exchange(&query.packet).await {
            Ok(reply) => {
                if let Err(e) = server.send_to(&reply, query.client).await {
                    warn!(client = %query.client, error = %e, "UDP response error");
                    continue;
                }
                let total = elapsed_ms(query.received);
                stats.record_forwarded(total);
                logger.forwarded(&query.domain, query.client, total, elapsed_ms(upstream_start));
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(shard, forwarder = %upstream.addr(), "forwarder did not answer in time");
                stats.record_dropped();
            }
            Err(e) => {
                warn!(shard, forwarder = %upstream.addr(), error = %e, "UDP forward error");
                stats.record_dropped();
                if !upstream.reconnect(&mut shutdown).await {
                    debug!(shard, "shutdown while reconnecting, abandoning queue");
                    return;
                }
            }
        }
    }
    debug!(shard, "forward worker stopped");
}

/// Answer queries for blacklisted names with 0.0.0.0.
async fn blackhole_worker(mut queue: mpsc::Receiver<UdpQuery>, server: Arc<UdpSocket>, stats: Arc<Stats>) {
    let logger = QueryLogger::new(Protocol::Udp);

    while let Some(query) = queue.recv().await {
        let answer = build_blackhole_answer(&query.packet);
        if answer.is_empty() {
            stats.record_dropped();
            continue;
        }
        if let Err(e) = server.send_to(&answer, query.client).await {
            warn!(client = %query.client, error = %e, "UDP response error");
            continue;
        }
        let total = elapsed_ms(query.received);
        stats.record_blackholed(total);
        logger.blocked(&query.domain, query.client, total);
    }
}
