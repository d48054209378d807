//! The seam between counting strategies and the layers that wrap them.

use std::time::Duration;

use super::decision::Decision;

/// A counting strategy: fixed window, sliding log, or a wrapper around one.
///
/// The quota is an explicit argument to [`check_with_limit`] so wrappers such
/// as the adaptive limiter can evaluate a request against a reduced quota
/// without touching shared configuration.
///
/// [`check_with_limit`]: CountingStrategy::check_with_limit
pub trait CountingStrategy: Send + Sync {
    /// Record a request for `key` and judge it against `max_requests`.
    fn check_with_limit(&self, key: &str, max_requests: u64) -> Decision;

    /// The configured quota.
    fn max_requests(&self) -> u64;

    /// The window length.
    fn window(&self) -> Duration;

    /// Number of keys currently tracked.
    fn tracked_keys(&self) -> usize;

    /// Cancel background work and drop all state. Idempotent.
    fn destroy(&self);

    /// Record a request for `key` against the configured quota.
    fn check_limit(&self, key: &str) -> Decision {
        self.check_with_limit(key, self.max_requests())
    }
}

impl<S: CountingStrategy + ?Sized> CountingStrategy for Box<S> {
    fn check_with_limit(&self, key: &str, max_requests: u64) -> Decision {
        (**self).check_with_limit(key, max_requests)
    }

    fn max_requests(&self) -> u64 {
        (**self).max_requests()
    }

    fn window(&self) -> Duration {
        (**self).window()
    }

    fn tracked_keys(&self) -> usize {
        (**self).tracked_keys()
    }

    fn destroy(&self) {
        (**self).destroy()
    }
}

/// Which counting algorithm a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// One counter per key per window; O(1), admits up to twice the quota
    /// across a window boundary.
    Fixed,
    /// A timestamp log per key; exact rolling window.
    Sliding,
}
