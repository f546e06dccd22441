//! Query statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters for query outcomes.
pub struct Stats {
    started: Instant,
    requests: AtomicU64,
    forwarded: AtomicU64,
    blackholed: AtomicU64,
    unauthorized: AtomicU64,
    rate_limited: AtomicU64,
    dropped: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            blackholed: AtomicU64::new(0),
            unauthorized: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, response_time_ms: f64) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_blackholed(&self, response_time_ms: f64) {
        self.blackholed.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_unauthorized(&self) {
        self.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed queries, full queues and failed upstream exchanges.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_response_time(&self, response_time_ms: f64) {
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let blackholed = self.blackholed.swap(0, Ordering::Relaxed);
        let unauthorized = self.unauthorized.swap(0, Ordering::Relaxed);
        let rate_limited = self.rate_limited.swap(0, Ordering::Relaxed);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let answered = forwarded + blackholed;
        let avg_response_ms = if answered > 0 {
            (total_us as f64 / answered as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            forwarded,
            blackholed,
            unauthorized,
            rate_limited,
            dropped,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub forwarded: u64,
    pub blackholed: u64,
    pub unauthorized: u64,
    pub rate_limited: u64,
    pub dropped: u64,
    pub avg_response_ms: f64,
}
