//! Keyed accounting state with background expiry.
//!
//! A [`WindowStore`] maps counter keys to per-key state. Every mutation goes
//! through [`WindowStore::update`], which holds the DashMap shard lock for the
//! key while the closure runs, so concurrent checks on the same key are
//! serialized and never observe each other's half-applied updates.
//!
//! Expiry is advisory. The limiters re-validate staleness on every read, so
//! the sweep only reclaims memory; a late or missed sweep never changes a
//! decision.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::clock::Clock;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default cap on tracked keys before least-recently-seen eviction.
///
/// The cap is strict: new keys are admitted under a lock, so the store never
/// holds more than `max_keys` entries.
pub const DEFAULT_MAX_KEYS: usize = 100_000;

/// Per-key state that knows when it has aged out.
pub trait Expiring: Send + Sync + 'static {
    /// Whether this entry carries no live accounting at `now_ms`.
    fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool;

    /// The most recent time this entry was touched.
    fn last_seen_ms(&self) -> u64;
}

/// Settings shared by every store a limiter creates.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// How often the background sweep runs
    pub sweep_interval: Duration,
    /// Maximum number of keys held before eviction kicks in
    pub max_keys: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

/// A concurrent key -> state map with a periodic expiry sweep.
pub struct WindowStore<E: Expiring> {
    /// Label used in log lines
    name: String,
    entries: Arc<DashMap<String, E>>,
    clock: Arc<dyn Clock>,
    window_ms: u64,
    max_keys: usize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    /// Serializes insertion of new keys
    admission: Mutex<()>,
    eviction_runs: AtomicU64,
    destroyed: AtomicBool,
}

impl<E: Expiring> WindowStore<E> {
    /// Create an empty store. No sweep runs until [`start_sweep`] is called.
    ///
    /// [`start_sweep`]: WindowStore::start_sweep
    pub fn new(
        name: impl Into<String>,
        window_ms: u64,
        max_keys: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(DashMap::new()),
            clock,
            window_ms,
            max_keys: max_keys.max(1),
            sweeper: Mutex::new(None),
            admission: Mutex::new(()),
            eviction_runs: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Get a copy of the entry for `key`.
    pub fn get(&self, key: &str) -> Option<E>
    where
        E: Clone,
    {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or replace the entry for `key`.
    pub fn set(&self, key: &str, entry: E) {
        if let Some(mut existing) = self.entries.get_mut(key) {
            *existing = entry;
            return;
        }
        let _admission = self.admission.lock();
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(key.to_string(), entry);
    }

    /// Remove the entry for `key`, returning it if present.
    pub fn delete(&self, key: &str) -> Option<E> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Atomically read-modify-write the entry for `key`.
    ///
    /// `init` creates the entry when the key is absent. The shard lock is held
    /// for the duration of `f`.
    pub fn update<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> E,
        f: impl FnOnce(&mut E) -> R,
    ) -> R {
        if let Some(mut entry) = self.entries.get_mut(key) {
            return f(entry.value_mut());
        }

        let mut entry = {
            // New keys are admitted one at a time so the cap holds under
            // concurrent inserts.
            let _admission = self.admission.lock();
            if !self.entries.contains_key(key) {
                self.make_room();
            }
            self.entries.entry(key.to_string()).or_insert_with(init)
        };
        f(entry.value_mut())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The clock this store reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Spawn the periodic sweep on the current tokio runtime.
    ///
    /// Returns `false` without spawning when no runtime is available, or when
    /// a sweep is already running. Stores without a sweep remain correct;
    /// expired keys are simply reclaimed later, on their next access.
    pub fn start_sweep(&self, interval: Duration) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(store = %self.name, "No tokio runtime, expiry sweep disabled");
                return false;
            }
        };

        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);
        let window_ms = self.window_ms;
        let name = self.name.clone();

        *sweeper = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now_ms = clock.now_ms();
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    sweep_entries(&entries, now_ms, window_ms)
                }));
                match result {
                    Ok(0) => trace!(store = %name, "Sweep found nothing to evict"),
                    Ok(removed) => debug!(
                        store = %name,
                        removed = removed,
                        remaining = entries.len(),
                        "Swept expired entries"
                    ),
                    Err(_) => warn!(store = %name, "Sweep panicked, retrying on next tick"),
                }
            }
        }));
        true
    }

    /// Whether a background sweep is currently scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Run one sweep synchronously. Returns how many entries were removed.
    pub fn sweep_now(&self) -> usize {
        sweep_entries(&self.entries, self.clock.now_ms(), self.window_ms)
    }

    /// Cancel the sweep and drop every entry.
    ///
    /// Safe to call any number of times.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.entries.clear();

        if !self.destroyed.swap(true, Ordering::SeqCst) {
            debug!(store = %self.name, "Window store destroyed");
        }
    }

    /// Number of capacity evictions performed so far.
    pub fn eviction_runs(&self) -> u64 {
        self.eviction_runs.load(Ordering::Relaxed)
    }

    /// Free space for one new key. Caller holds the admission lock.
    ///
    /// A full store is cut down to `max_keys - batch` in one pass: expired
    /// entries go first, then the least recently seen. The scan is paid once
    /// per `batch` inserts instead of once per insert.
    fn make_room(&self) {
        if self.entries.len() < self.max_keys {
            return;
        }

        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
        let target = self.max_keys - eviction_batch(self.max_keys);

        let now_ms = self.clock.now_ms();
        let expired = sweep_entries(&self.entries, now_ms, self.window_ms);

        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            debug!(
                store = %self.name,
                expired = expired,
                "Store at capacity, dropped expired keys"
            );
            return;
        }

        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().last_seen_ms(), entry.key().clone()))
            .collect();
        let excess = excess.min(by_age.len());
        if excess < by_age.len() {
            by_age.select_nth_unstable_by_key(excess, |(seen, _)| *seen);
        }
        for (_, key) in by_age.iter().take(excess) {
            self.entries.remove(key);
        }

        warn!(
            store = %self.name,
            max_keys = self.max_keys,
            expired = expired,
            evicted = excess,
            "Store at capacity, evicted least recently seen keys"
        );
    }
}

/// How many slots a capacity eviction frees: 2% of the cap, at least one.
fn eviction_batch(max_keys: usize) -> usize {
    (max_keys / 50).clamp(1, max_keys)
}

impl<E: Expiring> Drop for WindowStore<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn sweep_entries<E: Expiring>(entries: &DashMap<String, E>, now_ms: u64, window_ms: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now_ms, window_ms));
    before.saturating_sub(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    #[derive(Debug, Clone, PartialEq)]
    struct Stamp {
        at_ms: u64,
    }

    impl Expiring for Stamp {
        fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
            self.at_ms + window_ms <= now_ms
        }

        fn last_seen_ms(&self) -> u64 {
            self.at_ms
        }
    }

    struct Exploding;

    impl Expiring for Exploding {
        fn is_expired(&self, _now_ms: u64, _window_ms: u64) -> bool {
            panic!("boom");
        }

        fn last_seen_ms(&self) -> u64 {
            0
        }
    }

    fn store_with_clock(window_ms: u64, max_keys: usize) -> (WindowStore<Stamp>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = WindowStore::new("test", window_ms, max_keys, clock.clone());
        (store, clock)
    }

    #[test]
    fn test_get_set_delete() {
        let (store, _clock) = store_with_clock(1_000, 10);

        assert!(store.get("a").is_none());
        store.set("a", Stamp { at_ms: 5 });
        assert_eq!(store.get("a"), Some(Stamp { at_ms: 5 }));
        assert_eq!(store.delete("a"), Some(Stamp { at_ms: 5 }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_initializes_missing_entries() {
        let (store, _clock) = store_with_clock(1_000, 10);

        let seen = store.update("a", || Stamp { at_ms: 7 }, |stamp| {
            stamp.at_ms += 1;
            stamp.at_ms
        });

        assert_eq!(seen, 8);
        assert_eq!(store.get("a"), Some(Stamp { at_ms: 8 }));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (store, clock) = store_with_clock(1_000, 10);
        store.set("old", Stamp { at_ms: 0 });
        store.set("new", Stamp { at_ms: 900 });

        clock.set(1_000);
        assert_eq!(store.sweep_now(), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }

    #[test]
    fn test_capacity_prefers_expired_entries() {
        let (store, clock) = store_with_clock(1_000, 2);
        store.set("stale", Stamp { at_ms: 0 });
        store.set("fresh", Stamp { at_ms: 1_500 });

        clock.set(1_600);
        store.set("third", Stamp { at_ms: 1_600 });

        assert_eq!(store.len(), 2);
        assert!(store.get("stale").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let (store, _clock) = store_with_clock(10_000, 2);
        store.set("a", Stamp { at_ms: 10 });
        store.set("b", Stamp { at_ms: 20 });
        store.set("c", Stamp { at_ms: 30 });

        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_updating_existing_key_at_capacity_does_not_evict() {
        let (store, _clock) = store_with_clock(10_000, 2);
        store.set("a", Stamp { at_ms: 10 });
        store.set("b", Stamp { at_ms: 20 });

        store.update("a", || Stamp { at_ms: 0 }, |stamp| stamp.at_ms = 40);

        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_some());
    }

    #[test]
    fn test_full_store_evicts_in_batches() {
        let (store, clock) = store_with_clock(u64::MAX / 2, 1_000);
        for i in 0..1_000u64 {
            store.set(&format!("seed-{}", i), Stamp { at_ms: i });
        }
        assert_eq!(store.eviction_runs(), 0);

        for i in 0..1_000u64 {
            clock.set(10_000 + i);
            store.update(&format!("new-{}", i), || Stamp { at_ms: 10_000 + i }, |_| ());
        }

        // Each run frees 20 slots, so 1 000 inserts need 50 runs.
        assert_eq!(store.eviction_runs(), 50);
        assert!(store.len() <= 1_000);
        // The oldest seeds went first.
        assert!(store.get("seed-0").is_none());
        assert!(store.get("new-999").is_some());
    }

    #[test]
    fn test_updates_to_existing_keys_never_evict() {
        let (store, _clock) = store_with_clock(u64::MAX / 2, 100);
        for i in 0..100u64 {
            store.set(&format!("k{}", i), Stamp { at_ms: i });
        }

        for round in 0..10u64 {
            for i in 0..100u64 {
                store.update(&format!("k{}", i), || Stamp { at_ms: 0 }, |s| s.at_ms = round);
            }
        }

        assert_eq!(store.eviction_runs(), 0);
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_concurrent_inserts_respect_cap() {
        let (store, _clock) = store_with_clock(u64::MAX / 2, 100);

        std::thread::scope(|scope| {
            for t in 0..8u64 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..500u64 {
                        store.update(&format!("t{}-{}", t, i), || Stamp { at_ms: i }, |_| ());
                        assert!(store.len() <= 100);
                    }
                });
            }
        });

        assert!(store.len() <= 100);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (store, _clock) = store_with_clock(1_000, 10);
        store.set("a", Stamp { at_ms: 0 });

        store.destroy();
        assert!(store.is_empty());
        store.destroy();
        assert!(store.is_empty());
    }

    #[test]
    fn test_no_sweep_without_runtime() {
        let (store, _clock) = store_with_clock(1_000, 10);
        assert!(!store.start_sweep(Duration::from_millis(10)));
        assert!(!store.is_sweeping());
    }

    #[test]
    fn test_start_sweep_inside_block_on() {
        let (store, _clock) = store_with_clock(1_000, 10);
        tokio_test::block_on(async {
            assert!(store.start_sweep(Duration::from_secs(60)));
            // A second start is refused while the first is scheduled.
            assert!(!store.start_sweep(Duration::from_secs(60)));
            store.destroy();
            assert!(!store.is_sweeping());
        });
    }

    #[tokio::test]
    async fn test_background_sweep_evicts() {
        let (store, clock) = store_with_clock(1_000, 10);
        store.set("a", Stamp { at_ms: 0 });
        assert!(store.start_sweep(Duration::from_millis(10)));

        clock.set(5_000);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.is_empty());
        store.destroy();
    }

    #[tokio::test]
    async fn test_sweep_survives_panics() {
        let clock = Arc::new(ManualClock::new(0));
        let store: WindowStore<Exploding> = WindowStore::new("exploding", 1_000, 10, clock);
        store.set("a", Exploding);
        assert!(store.start_sweep(Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(50)).await;

        // The task is still running after several panicking ticks.
        assert!(store.is_sweeping());
        store.destroy();
    }
}
