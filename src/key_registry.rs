//! Per-key bucket registry with idle eviction.
//!
//! Buckets are created lazily on first use of a key and dropped by a
//! background sweep once they have been idle for `key_timeout`. The map lock
//! is separate from every bucket's own lock, so contention on one key never
//! blocks lookups of another for longer than a map access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::token_bucket::SharedBucket;

/// Shortest sweep period, so tiny key timeouts do not spin the sweeper.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Entry {
    bucket: Arc<SharedBucket>,
    last_access: Instant,
}

#[derive(Debug)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    rate: f64,
    capacity: u32,
    key_timeout: Duration,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let mut map = self.entries();
        let before = map.len();
        // A bucket still referenced elsewhere has a caller waiting on it.
        map.retain(|_, e| {
            Arc::strong_count(&e.bucket) > 1
                || now.saturating_duration_since(e.last_access) < self.key_timeout
        });
        before - map.len()
    }
}

/// Owns one [`SharedBucket`] per key.
#[derive(Debug)]
pub struct KeyRegistry {
    shared: Arc<Shared>,
    stop: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl KeyRegistry {
    /// Create a registry whose buckets all share `rate` and `capacity`.
    ///
    /// A non-zero `key_timeout` starts the eviction sweep on the current
    /// tokio runtime; without a runtime, entries are only evicted through
    /// [`evict_idle`](Self::evict_idle).
    pub fn new(rate: f64, capacity: u32, key_timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            rate,
            capacity,
            key_timeout,
        });
        let stop = CancellationToken::new();

        let sweeper = if key_timeout.is_zero() {
            None
        } else {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let interval = (key_timeout / 2).max(MIN_SWEEP_INTERVAL);
                    Some(handle.spawn(sweep_loop(
                        Arc::clone(&shared),
                        stop.clone(),
                        interval,
                    )))
                }
                Err(_) => {
                    tracing::warn!("no tokio runtime; idle key eviction runs only on demand");
                    None
                }
            }
        };

        Self {
            shared,
            stop,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Look up the bucket for `key`, creating a full one if absent, and mark
    /// the key as recently used.
    pub fn get_or_create(&self, key: &str) -> Arc<SharedBucket> {
        let now = Instant::now();
        let mut map = self.shared.entries();
        if let Some(entry) = map.get_mut(key) {
            entry.last_access = now;
            return Arc::clone(&entry.bucket);
        }
        let bucket = Arc::new(SharedBucket::new(self.shared.rate, self.shared.capacity));
        map.insert(
            key.to_string(),
            Entry {
                bucket: Arc::clone(&bucket),
                last_access: now,
            },
        );
        tracing::debug!(key, "rate limit bucket created");
        bucket
    }

    /// Mark `key` as recently used if it is present.
    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.shared.entries().get_mut(key) {
            entry.last_access = Instant::now();
        }
    }

    /// Look up an existing bucket without creating or touching it.
    pub fn get(&self, key: &str) -> Option<Arc<SharedBucket>> {
        self.shared.entries().get(key).map(|e| Arc::clone(&e.bucket))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry idle for at least `key_timeout` as of `now`, except
    /// those whose bucket is still held outside the registry. Returns how
    /// many were removed. A zero timeout never evicts.
    pub fn evict_idle(&self, now: Instant) -> usize {
        if self.shared.key_timeout.is_zero() {
            return 0;
        }
        self.shared.evict_idle(now)
    }

    /// Stop the sweep task and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
            tracing::debug!("key registry sweeper stopped");
        }
    }
}

impl Drop for KeyRegistry {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn sweep_loop(shared: Arc<Shared>, stop: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    tracing::debug!(?period, "key registry sweeper started");
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = shared.evict_idle(Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle rate limit keys");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reuses_bucket() {
        let reg = KeyRegistry::new(1.0, 2, Duration::ZERO);
        let a = reg.get_or_create("a");
        let again = reg.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn get_does_not_create() {
        let reg = KeyRegistry::new(1.0, 2, Duration::ZERO);
        assert!(reg.get("missing").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn keys_have_independent_buckets() {
        let reg = KeyRegistry::new(0.1, 1, Duration::ZERO);
        assert!(reg.get_or_create("a").allow(1.0));
        assert!(!reg.get_or_create("a").allow(1.0));
        assert!(reg.get_or_create("b").allow(1.0));
    }

    #[test]
    fn evict_idle_on_demand() {
        let reg = KeyRegistry::new(1.0, 1, Duration::from_secs(10));
        reg.get_or_create("old");
        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(reg.evict_idle(later), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn held_bucket_survives_eviction() {
        let reg = KeyRegistry::new(1.0, 1, Duration::from_secs(10));
        let held = reg.get_or_create("busy");
        reg.get_or_create("idle");
        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(reg.evict_idle(later), 1);
        assert!(reg.get("busy").is_some());

        drop(held);
        assert_eq!(reg.evict_idle(later), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn touch_refreshes_last_access() {
        let reg = KeyRegistry::new(1.0, 1, Duration::from_millis(50));
        reg.get_or_create("k");
        std::thread::sleep(Duration::from_millis(60));
        reg.touch("k");
        assert_eq!(reg.evict_idle(Instant::now()), 0);
        reg.touch("missing");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn zero_timeout_never_evicts() {
        let reg = KeyRegistry::new(1.0, 1, Duration::ZERO);
        reg.get_or_create("k");
        assert_eq!(reg.evict_idle(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn evicted_key_comes_back_full() {
        let reg = KeyRegistry::new(0.01, 1, Duration::from_secs(1));
        assert!(reg.get_or_create("k").allow(1.0));
        assert!(!reg.get_or_create("k").allow(1.0));
        reg.evict_idle(Instant::now() + Duration::from_secs(2));
        assert!(reg.get_or_create("k").allow(1.0));
    }

    #[tokio::test]
    async fn background_sweep_evicts_and_shutdown_joins() {
        let reg = KeyRegistry::new(1.0, 1, Duration::from_millis(50));
        reg.get_or_create("a");
        reg.get_or_create("b");
        reg.get_or_create("c");
        assert_eq!(reg.len(), 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reg.len(), 0);

        reg.shutdown().await;
        reg.shutdown().await;
    }
}
