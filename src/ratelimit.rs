//! Fixed-window admission limiter.
//!
//! Every actor gets a counter that is bumped on each event. All counters are
//! cleared together once per window by a background task, so bursts are
//! window-aligned rather than smoothed per key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Per-actor event counter reset at a fixed interval.
pub struct RateLimit {
    window: Duration,
    max_per_window: u32,
    counts: Mutex<FxHashMap<String, u32>>,
}

impl RateLimit {
    /// Create a limiter allowing `max_per_window` events per actor per `window`.
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            counts: Mutex::new(FxHashMap::default()),
        }
    }

    /// Start the background task that clears all counters every window.
    ///
    /// Clears the counters immediately, then on every tick until `shutdown`
    /// fires or the limiter is dropped.
    pub fn initialise(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.reset();
        let limiter = Arc::downgrade(self);
        let window = self.window;

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + window;
            let mut interval = tokio::time::interval_at(start, window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        let Some(limiter) = limiter.upgrade() else {
                            break;
                        };
                        limiter.reset();
                    }
                }
            }
            debug!("rate limit reset task stopped");
        })
    }

    /// Count one event for `key` and return whether it is within the limit.
    pub fn add(&self, key: &str) -> bool {
        let Ok(mut counts) = self.counts.lock() else {
            return false;
        };
        let count = match counts.get_mut(key) {
            Some(count) => {
                *count = count.saturating_add(1);
                *count
            }
            None => {
                counts.insert(key.to_string(), 1);
                1
            }
        };
        if count == self.max_per_window.saturating_add(1) {
            warn!(actor = key, limit = self.max_per_window, "rate limit exceeded");
        }
        count <= self.max_per_window
    }

    /// Number of actors seen in the current window.
    pub fn tracked_actors(&self) -> usize {
        self.counts.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn reset(&self) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(window_secs: u64, max: u32) -> (Arc<RateLimit>, broadcast::Sender<()>) {
        let limiter = Arc::new(RateLimit::new(Duration::from_secs(window_secs), max));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        limiter.initialise(shutdown_rx);
        (limiter, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn add_allows_exactly_max_per_window_under_contention() {
        let (limiter, _shutdown) = start(3, 4);

        let handles: Vec<_> = (0..3)
            .map(|actor| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let key = actor.to_string();
                    (0..100).filter(|_| limiter.add(&key)).count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 4);
        }
        assert_eq!(limiter.tracked_actors(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_reset_every_window() {
        let (limiter, _shutdown) = start(3, 4);

        for _ in 0..4 {
            assert!(limiter.add("192.0.2.1"));
        }
        assert!(!limiter.add("192.0.2.1"));

        tokio::time::sleep(Duration::from_millis(3100)).await;

        assert!(limiter.add("192.0.2.1"));
        assert_eq!(limiter.tracked_actors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evenly_spaced_calls_converge_to_the_window_rate() {
        let (limiter, _shutdown) = start(3, 4);

        let tasks: Vec<_> = (0..3)
            .map(|actor| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let key = actor.to_string();
                    let mut success = 0;
                    // 25 calls spaced 0.6s apart span 15 seconds.
                    for _ in 0..25 {
                        if limiter.add(&key) {
                            success += 1;
                        }
                        tokio::time::sleep(Duration::from_millis(600)).await;
                    }
                    success
                })
            })
            .collect();

        for task in tasks {
            let success = task.await.unwrap();
            assert!((20..=22).contains(&success), "got {success} successes");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_task_stops_on_shutdown() {
        let limiter = Arc::new(RateLimit::new(Duration::from_secs(1), 10));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = limiter.initialise(shutdown_rx);

        shutdown_tx.send(()).unwrap();

        task.await.unwrap();
    }
}
