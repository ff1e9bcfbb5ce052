//! Token bucket with continuous refill.
//!
//! [`TokenBucket`] is plain numeric state and takes the current instant as
//! an argument so its arithmetic can be tested without sleeping.
//! [`SharedBucket`] wraps it, together with its admission counters, behind
//! the bucket's own lock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest delay ever reported. Small enough that adding it to an `Instant`
/// or to another delay cannot overflow.
pub const MAX_DELAY: Duration = Duration::from_secs(u32::MAX as u64);

fn secs_to_delay(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// A single token bucket with refill mechanics.
///
/// `tokens` never leaves `[0, capacity]`. Tokens handed out ahead of time by
/// [`reserve`](TokenBucket::reserve) are tracked as `debt`, which refill pays
/// off before the level rises again.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens (burst capacity).
    capacity: u32,
    /// Tokens added per second.
    rate: f64,
    /// Current available tokens (fractional during refill).
    tokens: f64,
    /// Tokens already promised to reservations that are not yet usable.
    debt: f64,
    /// Last time tokens were refilled.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a new bucket filled to capacity.
    pub fn new(rate: f64, capacity: u32, now: Instant) -> Self {
        Self {
            capacity,
            rate,
            tokens: capacity as f64,
            debt: 0.0,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Refill tokens based on elapsed time since last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let mut accrued = elapsed * self.rate;
        if self.debt > 0.0 {
            let paid = accrued.min(self.debt);
            self.debt -= paid;
            accrued -= paid;
        }
        self.tokens = (self.tokens + accrued).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Time until `n` tokens are available, assuming the bucket is refilled.
    fn delay_for(&self, n: f64) -> Duration {
        let deficit = self.debt + n - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            secs_to_delay(deficit / self.rate)
        }
    }

    /// Try to consume `n` tokens. Returns `Ok(())` or the duration to wait;
    /// on failure the bucket is left unchanged.
    pub fn try_acquire(&mut self, n: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.debt <= 0.0 && self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            Err(self.delay_for(n))
        }
    }

    /// Consume `n` tokens unconditionally and return how long until they
    /// would have been available. Whatever the current level cannot cover
    /// becomes debt.
    pub fn reserve(&mut self, n: f64, now: Instant) -> Duration {
        self.refill(now);
        if self.debt <= 0.0 && self.tokens >= n {
            self.tokens -= n;
            return Duration::ZERO;
        }
        self.debt += n - self.tokens;
        self.tokens = 0.0;
        secs_to_delay(self.debt / self.rate)
    }

    /// Give `n` tokens back, paying off outstanding debt first.
    pub fn credit(&mut self, n: f64, now: Instant) {
        self.refill(now);
        let mut remaining = n;
        if self.debt > 0.0 {
            let paid = remaining.min(self.debt);
            self.debt -= paid;
            remaining -= paid;
        }
        self.tokens = (self.tokens + remaining).min(self.capacity as f64);
    }

    /// Tokens available right now (after refill).
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

// ---------------------------------------------------------------------------
// SharedBucket
// ---------------------------------------------------------------------------

/// Monotonic admission counters kept next to a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketCounters {
    pub allowed: u64,
    pub denied: u64,
    pub waited: u64,
    pub total_wait: Duration,
}

#[derive(Debug)]
struct Tracked {
    bucket: TokenBucket,
    counters: BucketCounters,
}

/// A [`TokenBucket`] plus counters, guarded by one exclusive lock.
#[derive(Debug)]
pub struct SharedBucket {
    inner: Mutex<Tracked>,
}

impl SharedBucket {
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            inner: Mutex::new(Tracked {
                bucket: TokenBucket::new(rate, capacity, Instant::now()),
                counters: BucketCounters::default(),
            }),
        }
    }

    // The guarded state is plain numbers; a panic elsewhere cannot leave it
    // half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> u32 {
        self.lock().bucket.capacity()
    }

    /// Debit `n` tokens if available, counting the outcome either way.
    pub fn allow(&self, n: f64) -> bool {
        let mut t = self.lock();
        match t.bucket.try_acquire(n, Instant::now()) {
            Ok(()) => {
                t.counters.allowed += 1;
                true
            }
            Err(_) => {
                t.counters.denied += 1;
                false
            }
        }
    }

    /// Debit `n` tokens if available; only a success is counted.
    pub fn try_acquire(&self, n: f64) -> Result<(), Duration> {
        let mut t = self.lock();
        let res = t.bucket.try_acquire(n, Instant::now());
        if res.is_ok() {
            t.counters.allowed += 1;
        }
        res
    }

    /// Pre-debit `n` tokens and return the delay until they are usable.
    pub fn reserve(&self, n: f64) -> Duration {
        let mut t = self.lock();
        t.counters.allowed += 1;
        t.bucket.reserve(n, Instant::now())
    }

    pub fn credit(&self, n: f64) {
        self.lock().bucket.credit(n, Instant::now());
    }

    pub fn record_denied(&self) {
        self.lock().counters.denied += 1;
    }

    /// Count one blocking wait and add the time spent blocked.
    pub fn record_wait(&self, slept: Duration) {
        let mut t = self.lock();
        t.counters.waited += 1;
        t.counters.total_wait += slept;
    }

    /// Current level and counters. Refills, never debits.
    pub fn snapshot(&self) -> (f64, BucketCounters) {
        let mut t = self.lock();
        let available = t.bucket.available(Instant::now());
        (available, t.counters)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
