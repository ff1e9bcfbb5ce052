//! Token-bucket rate limiter for LLM API calls.
//!
//! One shared bucket, or one bucket per key when `per_key` is set. Four
//! admission modes: [`allow`](RateLimiter::allow) (non-blocking),
//! [`wait`](RateLimiter::wait) (blocks until admitted or the caller gives
//! up), [`reserve`](RateLimiter::reserve) (pre-debits and reports the delay)
//! and [`stats`](RateLimiter::stats).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::context::{CallContext, ContextDone};
use crate::error::{ConfigError, WaitError};
use crate::key_registry::KeyRegistry;
use crate::telemetry::{trace_rate_limit_wait, SpanGuard};
use crate::token_bucket::{BucketCounters, SharedBucket};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time view of one bucket's counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Stats {
    pub allowed: u64,
    pub denied: u64,
    pub waited: u64,
    pub total_wait_time: Duration,
    pub available_tokens: f64,
    pub last_update: DateTime<Utc>,
    /// Live per-key entries; always 0 when per-key mode is off.
    pub active_keys: usize,
}

impl Stats {
    fn from_parts(available: f64, counters: BucketCounters, active_keys: usize) -> Self {
        Self {
            allowed: counters.allowed,
            denied: counters.denied,
            waited: counters.waited,
            total_wait_time: counters.total_wait,
            available_tokens: available,
            last_update: Utc::now(),
            active_keys,
        }
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// A token taken now for use after [`delay`](Reservation::delay).
///
/// Cancelling before the delay elapses returns the token; after that, or a
/// second time, cancelling does nothing.
#[derive(Debug)]
pub struct Reservation {
    ok: bool,
    delay: Duration,
    ready_at: Instant,
    tokens: f64,
    bucket: Option<Arc<SharedBucket>>,
    cancelled: AtomicBool,
}

impl Reservation {
    /// An admitted reservation with no bucket behind it.
    fn immediate() -> Self {
        Self {
            ok: true,
            delay: Duration::ZERO,
            ready_at: Instant::now(),
            tokens: 0.0,
            bucket: None,
            cancelled: AtomicBool::new(false),
        }
    }

    fn impossible() -> Self {
        Self {
            ok: false,
            ..Self::immediate()
        }
    }

    /// False when the request can never be satisfied.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// How long after reservation the tokens become usable.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Time left until the tokens become usable.
    pub fn remaining(&self) -> Duration {
        self.ready_at.saturating_duration_since(Instant::now())
    }

    /// Return the reserved tokens to the bucket.
    pub fn cancel(&self) {
        let Some(bucket) = self.bucket.as_ref() else {
            return;
        };
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if Instant::now() >= self.ready_at {
            return;
        }
        bucket.credit(self.tokens);
        tracing::debug!(tokens = self.tokens, "rate limit reservation cancelled");
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Rate limiter over one shared bucket or a registry of per-key buckets.
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Arc<SharedBucket>,
    keys: Option<KeyRegistry>,
}

impl RateLimiter {
    /// Validate `config` and build the limiter.
    ///
    /// In per-key mode with a non-zero `key_timeout_ms` this starts the
    /// eviction sweep on the current tokio runtime; stop it with
    /// [`shutdown`](Self::shutdown).
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rate = config.requests_per_second;
        let burst = config.burst_size;
        let keys = (config.enabled && config.per_key)
            .then(|| KeyRegistry::new(rate, burst, config.key_timeout()));
        tracing::debug!(
            enabled = config.enabled,
            rate,
            burst,
            per_key = config.per_key,
            "rate limiter created"
        );
        Ok(Self {
            global: Arc::new(SharedBucket::new(rate, burst)),
            keys,
            config,
        })
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self {
            config: RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
            global: Arc::new(SharedBucket::new(1.0, 1)),
            keys: None,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn bucket_for(&self, key: &str) -> Arc<SharedBucket> {
        match &self.keys {
            Some(registry) => registry.get_or_create(key),
            None => Arc::clone(&self.global),
        }
    }

    /// Take one token if available. Never blocks.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Take `n` tokens at once if available.
    pub fn allow_n(&self, key: &str, n: u32) -> bool {
        if !self.config.enabled {
            return true;
        }
        let allowed = self.bucket_for(key).allow(f64::from(n));
        if !allowed {
            tracing::debug!(key, n, "rate limit denied");
        }
        allowed
    }

    /// Block until a token is taken for `key`.
    ///
    /// Fails without sleeping when the required delay is already known to
    /// overrun the caller's deadline or the configured wait timeout, and
    /// returns promptly when `ctx` is cancelled mid-sleep.
    pub async fn wait(&self, ctx: &CallContext, key: &str) -> Result<(), WaitError> {
        if !self.config.enabled {
            return Ok(());
        }
        let bucket = self.bucket_for(key);
        let started = Instant::now();
        let mut slept = Duration::ZERO;
        let mut span: Option<SpanGuard> = None;

        let result = loop {
            if let Some(done) = ctx.err() {
                break Err(context_error(done, Duration::ZERO));
            }
            let delay = match bucket.try_acquire(1.0) {
                Ok(()) => break Ok(()),
                Err(delay) => delay,
            };
            if let Some(limit) = self.config.wait_timeout() {
                let needed = started.elapsed() + delay;
                if needed > limit {
                    break Err(WaitError::WaitTimeout { needed, limit });
                }
            }
            if let Some(remaining) = ctx.remaining() {
                if delay > remaining {
                    break Err(WaitError::DeadlineExceeded { needed: delay });
                }
            }

            tracing::debug!(key, ?delay, "waiting for rate limit token");
            span.get_or_insert_with(|| trace_rate_limit_wait(key));
            let before = Instant::now();
            let interrupted = tokio::select! {
                biased;
                _ = tokio::time::sleep(delay) => None,
                done = ctx.done() => Some(done),
            };
            slept += before.elapsed();
            if let Some(done) = interrupted {
                break Err(context_error(done, delay));
            }
        };

        if let Some(registry) = &self.keys {
            registry.touch(key);
        }
        if !slept.is_zero() {
            bucket.record_wait(slept);
        }
        if let Some(span) = span.as_mut() {
            match &result {
                Ok(()) => span.set_status(true, ""),
                Err(err) => span.set_status(false, &err.to_string()),
            }
        }
        if let Err(ref err) = result {
            bucket.record_denied();
            tracing::debug!(key, error = %err, "rate limit wait failed");
        }
        result
    }

    /// Take one token now and report when it becomes usable.
    pub fn reserve(&self, key: &str) -> Reservation {
        self.reserve_n(key, 1)
    }

    /// Take `n` tokens now. The reservation is not `ok` when `n` exceeds the
    /// burst size, since such a request could never be admitted.
    pub fn reserve_n(&self, key: &str, n: u32) -> Reservation {
        if !self.config.enabled {
            return Reservation::immediate();
        }
        if n > self.config.burst_size {
            return Reservation::impossible();
        }
        let bucket = self.bucket_for(key);
        let tokens = f64::from(n);
        let reserved_at = Instant::now();
        let delay = bucket.reserve(tokens);
        Reservation {
            ok: true,
            delay,
            ready_at: reserved_at + delay,
            tokens,
            bucket: Some(bucket),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Counters and current level for `key`. Does not create a bucket.
    pub fn stats(&self, key: &str) -> Stats {
        let capacity = f64::from(self.config.burst_size);
        if !self.config.enabled {
            return Stats::from_parts(capacity, BucketCounters::default(), 0);
        }
        match &self.keys {
            Some(registry) => {
                let active = registry.len();
                match registry.get(key) {
                    Some(bucket) => {
                        let (available, counters) = bucket.snapshot();
                        Stats::from_parts(available, counters, active)
                    }
                    None => Stats::from_parts(capacity, BucketCounters::default(), active),
                }
            }
            None => {
                let (available, counters) = self.global.snapshot();
                Stats::from_parts(available, counters, 0)
            }
        }
    }

    /// Number of live per-key buckets (0 outside per-key mode).
    pub fn active_keys(&self) -> usize {
        self.keys.as_ref().map_or(0, KeyRegistry::len)
    }

    /// Stop the eviction sweep and wait for it to finish.
    pub async fn shutdown(&self) {
        if let Some(registry) = &self.keys {
            registry.shutdown().await;
        }
    }
}

fn context_error(done: ContextDone, needed: Duration) -> WaitError {
    match done {
        ContextDone::Cancelled => WaitError::Cancelled,
        ContextDone::DeadlineExceeded => WaitError::DeadlineExceeded { needed },
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.config.enabled)
            .field("requests_per_second", &self.config.requests_per_second)
            .field("burst_size", &self.config.burst_size)
            .field("per_key", &self.config.per_key)
            .field("active_keys", &self.active_keys())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
