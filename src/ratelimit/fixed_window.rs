//! Fixed window counting.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::clock::Clock;
use super::decision::Decision;
use super::store::{Expiring, StoreSettings, WindowStore};
use super::strategy::CountingStrategy;

/// Counter state for one key in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Attempts seen in the current window, admitted or not
    pub count: u64,
    /// When the current window ends, in Unix milliseconds
    pub reset_at_ms: u64,
    last_seen_ms: u64,
}

impl WindowEntry {
    fn fresh(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            reset_at_ms: now_ms.saturating_add(window_ms),
            last_seen_ms: now_ms,
        }
    }
}

impl Expiring for WindowEntry {
    fn is_expired(&self, now_ms: u64, _window_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }

    fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }
}

/// A rate limiter that counts requests per key in fixed windows.
///
/// The window for a key starts at its first request and restarts on the
/// first request after it ends. A burst straddling the boundary can admit up
/// to twice the quota in a short span.
pub struct FixedWindowLimiter {
    store: WindowStore<WindowEntry>,
    window: Duration,
    max_requests: u64,
}

impl FixedWindowLimiter {
    /// Create a limiter. Call [`start_sweep`] to enable background expiry.
    ///
    /// [`start_sweep`]: FixedWindowLimiter::start_sweep
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
    pub fn store(&self) -> &WindowStore<WindowEntry> {
        &self.store
    }
}

impl CountingStrategy for FixedWindowLimiter {
    fn check_with_limit(&self, key: &str, max_requests: u64) -> Decision {
        let now_ms = self.store.clock().now_ms();
        let window_ms = self.window.as_millis() as u64;

        let entry = self.store.update(
            key,
            || WindowEntry::fresh(now_ms, window_ms),
            |entry| {
                if now_ms >= entry.reset_at_ms {
                    *entry = WindowEntry::fresh(now_ms, window_ms);
                }
                entry.count += 1;
                entry.last_seen_ms = now_ms;
                *entry
            },
        );

        trace!(
            key = %key,
            count = entry.count,
            limit = max_requests,
            "Fixed window check"
        );

        let decision = Decision::from_count(
            entry.count,
            max_requests,
            now_ms,
            entry.reset_at_ms,
            entry.reset_at_ms,
        );
        if !decision.allowed {
            debug!(key = %key, count = entry.count, limit = max_requests, "Rate limit exceeded");
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
