//! Blacklist of ad/tracking domains.
//!
//! The domain set is an immutable snapshot. A refresh downloads every source,
//! builds the replacement set off-lock and swaps it in, so lookups only ever
//! see a complete list and never wait on a download.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use rustc_hash::FxHashSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::sources::BlacklistSource;
use crate::error::{Error, Result};

/// Result of a refresh where at least one source succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Number of domains in the new snapshot.
    pub entries: usize,
    /// Names of sources that failed and contributed nothing.
    pub failed_sources: Vec<String>,
}

/// A set of blocked domains.
pub struct Blacklist {
    domains: RwLock<Arc<FxHashSet<String>>>,
    sources: Vec<BlacklistSource>,
    client: Client,
}

impl Blacklist {
    /// Create an empty blacklist that refreshes from `sources`.
    pub fn new(client: Client, sources: Vec<BlacklistSource>) -> Self {
        Self {
            domains: RwLock::new(Arc::new(FxHashSet::default())),
            sources,
            client,
        }
    }

    /// Return true if any of `names` is blacklisted.
    pub fn contains<S: AsRef<str>>(&self, names: &[S]) -> bool {
        let domains = self.snapshot();
        names.iter().any(|name| domains.contains(name.as_ref()))
    }

    /// Returns the number of domains in the blacklist.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Replace the whole set.
    pub fn replace<I: IntoIterator<Item = String>>(&self, names: I) {
        let domains: FxHashSet<String> = names.into_iter().collect();
        self.swap(domains);
    }

    /// Download every source and swap in the union of those that succeeded.
    ///
    /// Fails without touching the current snapshot if no source succeeded.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let results = join_all(self.sources.iter().map(|s| s.fetch(&self.client))).await;

        let mut domains = FxHashSet::default();
        let mut failed_sources = Vec::new();
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(names) => {
                    info!(
                        source = %source.name,
                        entries = names.len(),
                        "retrieved ad-blacklist"
                    );
                    if let Some(license) = &source.license {
                        info!(
                            source = %source.name,
                            "please comply with the license of {}: {}", source.url, license
                        );
                    }
                    domains.extend(names);
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "failed to update ad-blacklist");
                    failed_sources.push(source.name.clone());
                }
            }
        }

        if failed_sources.len() == self.sources.len() {
            return Err(Error::BlacklistUnavailable(self.sources.len()));
        }

        let entries = domains.len();
        self.swap(domains);
        info!(entries, "ad-blacklist updated");
        Ok(RefreshOutcome {
            entries,
            failed_sources,
        })
    }

    /// Refresh every `period` until `shutdown` fires.
    ///
    /// Ticks run on a fixed schedule; a refresh that overruns its slot skips
    /// the missed ticks instead of firing them back to back.
    pub fn spawn_updater(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let blacklist = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = blacklist.refresh().await {
                            warn!(error = %e, "keeping previous ad-blacklist");
                        }
                    }
                }
            }
            debug!("blacklist updater stopped");
        })
    }

    fn snapshot(&self) -> Arc<FxHashSet<String>> {
        match self.domains.read() {
            Ok(domains) => domains.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, domains: FxHashSet<String>) {
        let domains = Arc::new(domains);
        match self.domains.write() {
            Ok(mut current) => *current = domains,
            Err(poisoned) => *poisoned.into_inner() = domains,
        }
    }
}
