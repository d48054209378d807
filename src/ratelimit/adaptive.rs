//! Load-adaptive quota scaling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::decision::Decision;
use super::strategy::CountingStrategy;

/// Default load above which quotas shrink.
pub const DEFAULT_LOAD_THRESHOLD: f64 = 0.8;
/// Default multiplier applied to quotas under high load.
pub const DEFAULT_SCALE_FACTOR: f64 = 0.5;

/// The most recent system load reading, in `[0.0, 1.0]`.
///
/// Shared between the monitoring side that reports load and any number of
/// adaptive limiters that read it.
#[derive(Debug, Default)]
pub struct SystemLoad {
    bits: AtomicU64,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new reading. Values outside `[0, 1]` are clamped; NaN is
    /// ignored.
    pub fn set(&self, load: f64) {
        if load.is_nan() {
            warn!("Ignoring NaN system load reading");
            return;
        }
        if !(0.0..=1.0).contains(&load) {
            warn!(load = load, "System load out of range, clamping");
        }
        let clamped = load.clamp(0.0, 1.0);
        self.bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// The latest reading.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Tuning for [`AdaptiveLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSettings {
    /// Load strictly above which the quota is scaled
    pub load_threshold: f64,
    /// Multiplier applied to the quota under high load
    pub scale_factor: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            load_threshold: DEFAULT_LOAD_THRESHOLD,
            scale_factor: DEFAULT_SCALE_FACTOR,
        }
    }
}

/// Wraps a counting strategy and shrinks its quota while the system is
/// under load.
///
/// The reduced quota is passed to the inner strategy per call; the inner
/// strategy's configuration is never modified, so concurrent checks always
/// see the quota that matches the load they read.
pub struct AdaptiveLimiter<S> {
    inner: S,
    load: Arc<SystemLoad>,
    settings: AdaptiveSettings,
}

impl<S: CountingStrategy> AdaptiveLimiter<S> {
    /// Wrap `inner` with its own load reading.
    pub fn new(inner: S, settings: AdaptiveSettings) -> Self {
        Self::with_load(inner, settings, Arc::new(SystemLoad::new()))
    }

    /// Wrap `inner`, reading load from a shared source.
    pub fn with_load(inner: S, settings: AdaptiveSettings, load: Arc<SystemLoad>) -> Self {
        Self {
            inner,
            load,
            settings,
        }
    }

    /// Report the current system load.
    pub fn update_system_load(&self, load: f64) {
        self.load.set(load);
    }

    /// The current system load.
    pub fn system_load(&self) -> f64 {
        self.load.get()
    }

    /// The wrapped strategy.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The quota in force for a base quota at the current load.
    pub fn effective_limit(&self, base: u64) -> u64 {
        if self.load.get() > self.settings.load_threshold {
            (base as f64 * self.settings.scale_factor).floor() as u64
        } else {
            base
        }
    }
}

impl<S: CountingStrategy> CountingStrategy for AdaptiveLimiter<S> {
    fn check_with_limit(&self, key: &str, max_requests: u64) -> Decision {
        let effective = self.effective_limit(max_requests);
        if effective != max_requests {
            debug!(
                key = %key,
                load = self.load.get(),
                base = max_requests,
                effective = effective,
                "Quota reduced under load"
            );
        }
        self.inner.check_with_limit(key, effective)
    }

    fn max_requests(&self) -> u64 {
        self.inner.max_requests()
    }

    fn window(&self) -> Duration {
        self.inner.window()
    }

    fn tracked_keys(&self) -> usize {
        self.inner.tracked_keys()
    }

    fn destroy(&self) {
        self.inner.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::fixed_window::FixedWindowLimiter;
    use crate::ratelimit::store::StoreSettings;

    fn adaptive(max: u64) -> AdaptiveLimiter<FixedWindowLimiter> {
        let inner = FixedWindowLimiter::new(
            "test",
            Duration::from_secs(60),
            max,
            StoreSettings::default(),
            Arc::new(ManualClock::new(0)),
        );
        AdaptiveLimiter::new(inner, AdaptiveSettings::default())
    }

    #[test]
    fn test_full_quota_under_normal_load() {
        let limiter = adaptive(10);
        limiter.update_system_load(0.5);

        for _ in 0..10 {
            assert!(limiter.check_limit("k").allowed);
        }
        assert!(!limiter.check_limit("k").allowed);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let limiter = adaptive(10);
        limiter.update_system_load(0.8);

        assert_eq!(limiter.effective_limit(10), 10);
    }

    #[test]
    fn test_quota_halved_under_high_load() {
        let limiter = adaptive(10);
        limiter.update_system_load(0.95);

        for _ in 0..5 {
            let decision = limiter.check_limit("k");
            assert!(decision.allowed);
            assert_eq!(decision.limit, 5);
        }
        assert!(!limiter.check_limit("k").allowed);
    }

    #[test]
    fn test_reduced_quota_rounds_down() {
        let limiter = adaptive(5);
        limiter.update_system_load(1.0);

        assert_eq!(limiter.effective_limit(5), 2);
    }

    #[test]
    fn test_base_configuration_is_never_mutated() {
        let limiter = adaptive(10);
        limiter.update_system_load(0.9);

        limiter.check_limit("k");

        assert_eq!(limiter.max_requests(), 10);
        assert_eq!(limiter.inner().max_requests(), 10);
    }

    #[test]
    fn test_load_drop_restores_quota() {
        let limiter = adaptive(4);
        limiter.update_system_load(0.9);
        limiter.check_limit("k");
        limiter.check_limit("k");
        assert!(!limiter.check_limit("k").allowed);

        // Counts carry over; only the quota changes.
        limiter.update_system_load(0.1);
        let decision = limiter.check_limit("k");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_load_is_clamped_and_nan_ignored() {
        let limiter = adaptive(10);

        limiter.update_system_load(3.0);
        assert_eq!(limiter.system_load(), 1.0);

        limiter.update_system_load(-1.0);
        assert_eq!(limiter.system_load(), 0.0);

        limiter.update_system_load(0.4);
        limiter.update_system_load(f64::NAN);
        assert_eq!(limiter.system_load(), 0.4);
    }

    #[test]
    fn test_shared_load_source() {
        let load = Arc::new(SystemLoad::new());
        let make = || {
            FixedWindowLimiter::new(
                "shared",
                Duration::from_secs(60),
                10,
                StoreSettings::default(),
                Arc::new(ManualClock::new(0)),
            )
        };
        let a = AdaptiveLimiter::with_load(make(), AdaptiveSettings::default(), load.clone());
        let b = AdaptiveLimiter::with_load(make(), AdaptiveSettings::default(), load.clone());

        load.set(0.99);
        assert_eq!(a.effective_limit(10), 5);
        assert_eq!(b.effective_limit(10), 5);
    }

    #[test]
    fn test_concurrent_checks_under_changing_load() {
        // Each thread sees either the full or the halved quota, never a quota
        // left behind by another thread.
        let limiter = adaptive(1_000);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    limiter.update_system_load(if i % 2 == 0 { 0.9 } else { 0.1 });
                }
            });
            for t in 0..4 {
                let limiter = &limiter;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let decision = limiter.check_limit(&format!("k{}", t));
                        assert!(decision.limit == 1_000 || decision.limit == 500);
                    }
                });
            }
        });

        assert_eq!(limiter.max_requests(), 1_000);
    }
}
