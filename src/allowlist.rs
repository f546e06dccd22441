//! Client IP allow-list.
//!
//! Clients are authorized by literal string prefix, so `192.168.` admits the
//! whole 192.168/16 range and `10.0.0.1` also admits `10.0.0.10`. The host's
//! own public IP is looked up periodically and appended so the daemon can
//! always be queried from itself.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::http::fetch_text;

/// Timeout for the public IP lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how often to look up the host's public IP.
#[derive(Clone)]
pub struct PublicIpLookup {
    pub client: Client,
    pub url: String,
    pub interval: Duration,
}

/// Set of allowed client IP prefixes.
pub struct AllowList {
    prefixes: RwLock<Arc<Vec<String>>>,
    /// Time of the last lookup attempt. Held for the whole lookup so only one
    /// refresh is ever in flight.
    last_refresh: Mutex<Option<Instant>>,
    lookup: Option<PublicIpLookup>,
}

impl AllowList {
    pub fn new(prefixes: Vec<String>, lookup: Option<PublicIpLookup>) -> Self {
        Self {
            prefixes: RwLock::new(Arc::new(prefixes)),
            last_refresh: Mutex::new(None),
            lookup,
        }
    }

    /// Return true if `client_ip` starts with any allowed prefix.
    ///
    /// Refreshes the host's public IP first if the refresh interval elapsed.
    pub async fn is_authorized(&self, client_ip: &str) -> bool {
        self.refresh_if_due().await;
        self.matches(client_ip)
    }

    /// Prefix test against the current snapshot, without refreshing.
    pub fn matches(&self, client_ip: &str) -> bool {
        self.snapshot()
            .iter()
            .any(|prefix| client_ip.starts_with(prefix.as_str()))
    }

    /// Current list of prefixes.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        match self.prefixes.read() {
            Ok(prefixes) => prefixes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Look up the public IP if no attempt was made within the interval.
    ///
    /// A failed lookup still counts as an attempt, so an unreachable service
    /// is retried once per interval rather than on every query. Callers that
    /// find a refresh already in flight return immediately.
    pub async fn refresh_if_due(&self) {
        let Some(lookup) = &self.lookup else {
            return;
        };
        let Ok(mut last_refresh) = self.last_refresh.try_lock() else {
            return;
        };
        if last_refresh.is_some_and(|at| at.elapsed() <= lookup.interval) {
            return;
        }

        match public_ip(lookup).await {
            Ok(ip) => self.allow(ip.to_string()),
            Err(e) => warn!(
                error = %e,
                "unable to determine public IP address, the host cannot query itself"
            ),
        }
        *last_refresh = Some(Instant::now());
    }

    /// Append `prefix` unless it is already present.
    fn allow(&self, prefix: String) {
        let current = self.snapshot();
        if current.contains(&prefix) {
            return;
        }
        let mut updated = Vec::with_capacity(current.len() + 1);
        updated.extend(current.iter().cloned());
        updated.push(prefix.clone());

        let mut prefixes = match self.prefixes.write() {
            Ok(prefixes) => prefixes,
            Err(poisoned) => poisoned.into_inner(),
        };
        *prefixes = Arc::new(updated);
        info!(ip = %prefix, "public IP address of this host is now allowed to query");
    }
}

async fn public_ip(lookup: &PublicIpLookup) -> Result<IpAddr> {
    let body = fetch_text(&lookup.client, &lookup.url, LOOKUP_TIMEOUT).await?;
    let body = body.trim();
    body.parse()
        .map_err(|_| Error::InvalidPublicIp(body.to_string()))
}
