//! Token-bucket rate limiter for outbound detail API calls.
//!
//! The bucket starts full. Every acquire first refills the bucket by
//! `elapsed * refill_rate` (capped at capacity), then debits the requested
//! tokens if enough are available. Refill, check and debit happen under one
//! mutex so concurrent callers can never jointly overdraw the bucket.
//!
//! [`TokenBucket::try_acquire`] never waits. [`TokenBucket::acquire`] waits
//! until the tokens are available or the deadline passes, so callers are
//! delayed rather than dropped.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors returned by the blocking acquire path.
#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    /// The permit did not become available before the deadline.
    #[error("Timed out after {0:?} waiting for rate-limiter permit")]
    Timeout(Duration),

    /// The request can never be satisfied by this bucket.
    #[error("Requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: f64 },
}

/// A permits-per-window rate, e.g. 75 permits every 60 seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub permits: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn new(permits: u32, per: Duration) -> Self {
        Self { permits, per }
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.permits as f64 / self.per.as_secs_f64()
    }
}

impl std::str::FromStr for RateLimit {
    type Err = String;

    /// Parse `"<permits>/<seconds>"`, e.g. `"75/60"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (permits, secs) = s
            .split_once('/')
            .ok_or_else(|| format!("expected '<permits>/<seconds>', got '{s}'"))?;
        let permits: u32 = permits
            .trim()
            .parse()
            .map_err(|_| format!("invalid permit count '{permits}'"))?;
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|_| format!("invalid window seconds '{secs}'"))?;
        if permits == 0 || secs == 0 {
            return Err("permits and window must be greater than 0".to_string());
        }
        Ok(Self::new(permits, Duration::from_secs(secs)))
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket shared by every enrichment worker.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens, refilled at
    /// `refill_rate` tokens per second.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A bucket that allows a burst of `limit.permits` and refills evenly
    /// across the window.
    pub fn from_rate_limit(limit: RateLimit) -> Self {
        Self::new(limit.permits, limit.refill_rate())
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Take `n` tokens if available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        self.try_acquire_at(n, Instant::now()).is_ok()
    }

    /// Wait until `n` tokens are available, or fail after `timeout`.
    pub async fn acquire(&self, n: u32, timeout: Duration) -> Result<(), RateLimitError> {
        if n as f64 > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let wait = match self.try_acquire_at(n, Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(RateLimitError::Timeout(timeout));
            }
            // Sleep for the projected deficit, never past the deadline. Another
            // caller may take the refilled tokens first, so loop and re-check.
            let remaining = deadline - now;
            tokio::time::sleep(wait.min(remaining).max(Duration::from_millis(1))).await;
        }
    }

    /// Current token count after applying the refill for `now`.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Refill for `now`, then debit `n` tokens. On failure returns how long
    /// the caller should expect to wait for the deficit to refill.
    pub(crate) fn try_acquire_at(&self, n: u32, now: Instant) -> Result<(), Duration> {
        let needed = n as f64;
        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= needed {
            state.tokens -= needed;
            return Ok(());
        }

        let deficit = needed - state.tokens;
        if self.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64(deficit / self.refill_rate))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        // Never move the clock backwards when a caller passes a stale `now`.
        if now > state.last_refill {
            state.last_refill = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
