//! Per-channel pacing: token bucket and retry backoff.
//!
//! Each delivery lane owns its own [`TokenBucket`]; nothing here is shared
//! between channels.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::SenderConfig;

/// Tolerance for float drift when checking for a whole token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Maximum jitter added to computed backoff, as a fraction of it.
const JITTER_FRACTION: f64 = 0.1;

/// Classic token bucket: `capacity` permits, refilled at `rate_per_sec`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn from_config(config: &SenderConfig) -> Self {
        Self::new(config.rate_per_sec, config.burst)
    }

    /// Take a permit now, or report how long until one is available.
    ///
    /// A rate too small to express as a wait yields `Duration::MAX`.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill(Instant::now());
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        Err(Duration::try_from_secs_f64(deficit / self.rate_per_sec).unwrap_or(Duration::MAX))
    }

    /// Wait until a permit is available and take it.
    pub async fn acquire(&mut self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole permits currently available.
    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        (self.tokens + TOKEN_EPSILON).floor() as u32
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Exponential backoff between retries of one delivery.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    pub fn from_config(config: &SenderConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_max)
    }

    /// Disable random jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retries` (1-based).
    ///
    /// `base * 2^(retries-1)` capped at `max`, plus up to 10% jitter. A
    /// platform-provided `retry_after` is a floor and is honored even above
    /// `max`.
    pub fn delay(&self, retries: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = retries.saturating_sub(1).min(31);
        let computed = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        let computed = if self.jitter && !computed.is_zero() {
            let spread = computed.as_secs_f64() * JITTER_FRACTION;
            computed + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=spread))
        } else {
            computed
        };

        retry_after.map_or(computed, |floor| computed.max(floor))
    }
}
