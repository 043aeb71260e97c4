//! Configuration for the sync core.
//!
//! Plain tunables with sensible defaults; the hosting process constructs one
//! and hands it to [`crate::service::SyncService`].

use std::time::Duration;

/// Configuration for the sync core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on a single authoritative write (default: 12s).
    /// A write that does not resolve within this window is treated as failed
    /// and triggers rollback.
    pub write_timeout: Duration,

    /// First reconnect delay after the live subscription drops (default: 1s)
    pub backoff_base: Duration,

    /// Ceiling for the reconnect delay (default: 30s)
    pub backoff_cap: Duration,

    /// Random jitter added on top of each reconnect delay, as a fraction of
    /// the delay (default: 0.25)
    pub backoff_jitter: f64,

    /// Age past which a restored snapshot is served as stale and refreshed in
    /// the background (default: 10 minutes)
    pub staleness_threshold: Duration,

    /// How long a tab must stay hidden before it counts as backgrounded;
    /// shorter blips are treated as focus flicker (default: 4s)
    pub background_debounce: Duration,

    /// Capacity of each per-record change channel (default: 64)
    pub watch_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(12),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            backoff_jitter: 0.25,
            staleness_threshold: Duration::from_secs(10 * 60),
            background_debounce: Duration::from_secs(4),
            watch_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Set the authoritative write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the reconnect backoff base and cap
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Set the snapshot staleness threshold
    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Set the background debounce window
    pub fn with_background_debounce(mut self, debounce: Duration) -> Self {
        self.background_debounce = debounce;
        self
    }

    /// Reconnect delay for the given attempt number (0-based), jittered.
    ///
    /// Exponential growth from `backoff_base`, capped at `backoff_cap`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = attempt.min(16);
        let base = self
            .backoff_base
            .saturating_mul(1u32 << exp.min(31))
            .min(self.backoff_cap);
        if self.backoff_jitter <= 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.backoff_jitter);
        base.mul_f64(1.0 + jitter)
    }
}
