//! Transport layer for the DNS daemon.
//!
//! Provides the UDP and TCP listeners that receive queries from clients and
//! answer them, either by relaying the forwarder's reply or with a blackhole
//! answer.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet accepted from clients or forwarders.
pub const MAX_DNS_PACKET_SIZE: usize = 9038;

use std::net::SocketAddr;

use tracing::debug;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Logger for answered DNS queries, emitted at debug level.
#[derive(Debug, Clone, Copy)]
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn blocked(&self, domain: &str, client: SocketAddr, elapsed_ms: f64) {
        debug!(
            protocol = self.protocol.as_str(),
            %client,
            domain,
            total_ms = format_args!("{elapsed_ms:.3}"),
            "BLOCKED"
        );
    }

    pub fn forwarded(&self, domain: &str, client: SocketAddr, total_ms: f64, upstream_ms: f64) {
        debug!(
            protocol = self.protocol.as_str(),
            %client,
            domain,
            total_ms = format_args!("{total_ms:.3}"),
            upstream_ms = format_args!("{upstream_ms:.3}"),
            "FORWARDED"
        );
    }
}

/// Milliseconds elapsed since `start`.
pub(crate) fn elapsed_ms(start: std::time::Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
