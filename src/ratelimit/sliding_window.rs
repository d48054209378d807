//! Sliding log counting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::clock::Clock;
use super::decision::Decision;
use super::store::{Expiring, StoreSettings, WindowStore};
use super::strategy::CountingStrategy;

/// Request timestamps for one key, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampLog {
    stamps: VecDeque<u64>,
}

impl TimestampLog {
    /// Drop every timestamp that has left the window ending at `now_ms`.
    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        self.stamps.retain(|&t| t.saturating_add(window_ms) > now_ms);
    }

    /// Number of timestamps held.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// The earliest timestamp held.
    pub fn oldest(&self) -> Option<u64> {
        self.stamps.iter().copied().min()
    }
}

impl Expiring for TimestampLog {
    fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        self.stamps
            .iter()
            .all(|&t| t.saturating_add(window_ms) <= now_ms)
    }

    fn last_seen_ms(&self) -> u64 {
        self.stamps.iter().copied().max().unwrap_or(0)
    }
}

/// A rate limiter that keeps a log of request times per key and counts those
/// inside the trailing window.
///
/// Work and memory per key grow with the number of requests in the window.
pub struct SlidingWindowLimiter {
    store: WindowStore<TimestampLog>,
    window: Duration,
    max_requests: u64,
}

impl SlidingWindowLimiter {
    /// Create a limiter. Call [`start_sweep`] to enable background expiry.
    ///
    /// [`start_sweep`]: SlidingWindowLimiter::start_sweep
    pub fn new(
        name: &str,
        window: Duration,
        max_requests: u64,
        settings: StoreSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: WindowStore::new(name, window.as_millis() as u64, settings.max_keys, clock),
            window,
            max_requests,
        }
    }

    /// Spawn the background sweep on the current runtime.
    pub fn start_sweep(&self, interval: Duration) -> bool {
        self.store.start_sweep(interval)
    }

    /// The backing store.
    pub fn store(&self) -> &WindowStore<TimestampLog> {
        &self.store
    }
}

impl CountingStrategy for SlidingWindowLimiter {
    fn check_with_limit(&self, key: &str, max_requests: u64) -> Decision {
        let now_ms = self.store.clock().now_ms();
        let window_ms = self.window.as_millis() as u64;

        let (count, oldest) = self.store.update(key, TimestampLog::default, |log| {
            log.prune(now_ms, window_ms);
            log.stamps.push_back(now_ms);
            (log.len() as u64, log.oldest().unwrap_or(now_ms))
        });

        trace!(
            key = %key,
            count = count,
            limit = max_requests,
            "Sliding window check"
        );

        // The quota frees up when the oldest tracked request ages out.
        let frees_at_ms = oldest.saturating_add(window_ms);
        let decision = Decision::from_count(count, max_requests, now_ms, frees_at_ms, frees_at_ms);
        if !decision.allowed {
            debug!(key = %key, count = count, limit = max_requests, "Rate limit exceeded");
        }
        decision
    }

    fn max_requests(&self) -> u64 {
        self.max_requests
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn destroy(&self) {
        self.store.destroy();
    }
}
