//! DNS query admission and classification.
//!
//! Every query passes the same gates, in order:
//! 1. Size check (malformed queries are dropped)
//! 2. Allow-list (unknown clients are dropped)
//! 3. Rate limit (clients over their limit are dropped)
//! 4. Blacklist (blocked names are blackholed, everything else forwarded)
//!
//! Dropped queries get no response at all, so a client outside the policy
//! cannot tell filtering apart from packet loss. Transports handle the actual
//! I/O, the resolver only decides.

use std::net::IpAddr;
use std::sync::Arc;

use crate::allowlist::AllowList;
use crate::dns::MIN_QUERY_LEN;
use crate::filter::{Blacklist, Verdict, filter_query};
use crate::ratelimit::RateLimit;
use crate::stats::Stats;

/// Why a query was dropped without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Unauthorized,
    RateLimited,
}

/// Action to take for a DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAction {
    /// Send nothing back.
    Drop(DropReason),
    /// Answer with 0.0.0.0.
    Blackhole { domain: String },
    /// Relay to the forwarder.
    Forward { domain: String },
}

/// Shared gate logic for all transports.
pub struct Resolver {
    allow_list: Arc<AllowList>,
    rate_limit: Arc<RateLimit>,
    blacklist: Arc<Blacklist>,
    stats: Arc<Stats>,
}

impl Resolver {
    pub fn new(
        allow_list: Arc<AllowList>,
        rate_limit: Arc<RateLimit>,
        blacklist: Arc<Blacklist>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            allow_list,
            rate_limit,
            blacklist,
            stats,
        }
    }

    /// Run `query` from `client_ip` through the gates and decide what to do.
    ///
    /// Call with the raw DNS message, without the TCP length prefix.
    pub async fn process_query(&self, client_ip: IpAddr, query: &[u8]) -> QueryAction {
        self.stats.record_request();

        if query.len() < MIN_QUERY_LEN {
            self.stats.record_dropped();
            return QueryAction::Drop(DropReason::Malformed);
        }

        let client = client_key(client_ip);
        if !self.allow_list.is_authorized(&client).await {
            self.stats.record_unauthorized();
            return QueryAction::Drop(DropReason::Unauthorized);
        }
        if !self.rate_limit.add(&client) {
            self.stats.record_rate_limited();
            return QueryAction::Drop(DropReason::RateLimited);
        }

        match filter_query(&self.blacklist, query) {
            Verdict::Blocked { domain } => QueryAction::Blackhole { domain },
            Verdict::Allowed { domain } => QueryAction::Forward { domain },
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the number of domains in the blacklist.
    pub fn blocked_count(&self) -> usize {
        self.blacklist.len()
    }
}

/// Actor key of a client: its address as text, with IPv4-mapped IPv6
/// addresses unwrapped so IPv4 prefixes apply on dual-stack sockets.
pub fn client_key(client_ip: IpAddr) -> String {
    client_ip.to_canonical().to_string()
}
