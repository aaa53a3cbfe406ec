//! Token-bucket admission control with failure-driven backoff.
//!
//! Outbound requests pass through [`RateLimiter::acquire`] before hitting
//! the network so the structural request rate never exceeds the quota the
//! server granted. Server-side 429 rejections feed back through
//! [`RateLimiter::report_outcome`] and introduce a capped, jittered
//! exponential delay in front of subsequent admissions.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default token regeneration rate (tokens per second) and bucket size.
pub const DEFAULT_REFILL_RATE: f64 = 8.0;

/// Default ceiling for the failure backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(64);

/// Minimum backoff delay once any failure has been recorded.
const MIN_BACKOFF_MS: u64 = 100;

/// A token bucket shared by all requests of one connection.
///
/// Tokens accrue at `refill_rate` per second up to `max_tokens`; each
/// admitted request consumes exactly one. The bucket state sits behind a
/// mutex, so the availability check and the decrement are a single
/// atomic step: under concurrent contention exactly one caller wins each
/// available token.
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    max_backoff: Duration,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
    failed_attempts: f64,
}

impl RateLimiter {
    /// Create a limiter with a bucket sized to one second of quota.
    ///
    /// `refill_rate` is the server-granted request rate in requests per
    /// second; the bucket holds at most that many tokens, which keeps
    /// bursts conservative.
    pub fn new(refill_rate: f64) -> Self {
        Self::with_limits(refill_rate, refill_rate, DEFAULT_MAX_BACKOFF)
    }

    /// Create a limiter with explicit bucket size, refill rate, and
    /// backoff ceiling.
    pub fn with_limits(max_tokens: f64, refill_rate: f64, max_backoff: Duration) -> Self {
        Self {
            max_tokens,
            refill_rate,
            max_backoff,
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_update: Instant::now(),
                failed_attempts: 0.0,
            }),
        }
    }

    /// Wait until a token is available, then consume it.
    ///
    /// Suspends the caller while the bucket is empty, polling at the
    /// interval it takes to regenerate one token. If rate-limit failures
    /// have been reported and not yet decayed, an additional randomized
    /// backoff delay is served first.
    pub async fn acquire(&self) {
        let backoff = {
            let bucket = self.bucket.lock().await;
            self.backoff_delay(bucket.failed_attempts)
        };
        if let Some(delay) = backoff {
            debug!(delay_ms = delay.as_millis() as u64, "backing off after rate-limit failures");
            tokio::time::sleep(delay).await;
        }

        loop {
            {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    trace!(tokens = bucket.tokens, "token acquired");
                    return;
                }
            }
            // Wait roughly the time it takes to regenerate one token.
            tokio::time::sleep(Duration::from_secs_f64(1.0 / self.refill_rate)).await;
        }
    }

    /// Record the outcome of a request that passed admission control.
    ///
    /// Must be called exactly once per admitted request. A failure (a
    /// server 429) increments the failure count by one; a success decays
    /// it by a third of the bucket size, floored at zero. The decay is
    /// deliberate: backoff persists somewhat after a single success
    /// following many failures.
    pub async fn report_outcome(&self, success: bool) {
        let mut bucket = self.bucket.lock().await;
        if success {
            bucket.failed_attempts = (bucket.failed_attempts - self.max_tokens / 3.0).max(0.0);
        } else {
            bucket.failed_attempts += 1.0;
            debug!(failed_attempts = bucket.failed_attempts, "rate-limit rejection recorded");
        }
    }

    /// Current token count.
    pub async fn tokens(&self) -> f64 {
        self.bucket.lock().await.tokens
    }

    /// Overwrite the token count, clamped into `[0, max_tokens]`.
    pub async fn set_tokens(&self, tokens: f64) {
        let mut bucket = self.bucket.lock().await;
        bucket.tokens = tokens.clamp(0.0, self.max_tokens);
    }

    /// Current failure count driving the backoff delay.
    pub async fn failed_attempts(&self) -> f64 {
        self.bucket.lock().await.failed_attempts
    }

    /// Credit tokens for the time elapsed since the last update.
    ///
    /// Partial refills below one whole token are not credited and do not
    /// advance `last_update`, so clock reads that would only ever add
    /// fractions cannot drift the bucket.
    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let new_tokens = now.duration_since(bucket.last_update).as_secs_f64() * self.refill_rate;
        if bucket.tokens + new_tokens >= 1.0 {
            bucket.tokens = (bucket.tokens + new_tokens).min(self.max_tokens);
            bucket.last_update = now;
        }
    }

    /// Randomized backoff delay for the given failure count.
    ///
    /// Uniform between 100ms and `ceil(2^n) * 100` ms, where the
    /// exponent `n` is the failure count capped so the result never
    /// exceeds the configured ceiling regardless of how large the count
    /// grows. The jitter avoids thundering-herd retries across clients.
    fn backoff_delay(&self, failed_attempts: f64) -> Option<Duration> {
        if failed_attempts <= 0.0 {
            return None;
        }
        let ceiling_exp = (self.max_backoff.as_millis() as f64 / MIN_BACKOFF_MS as f64).log2();
        let exponent = ceiling_exp.min(failed_attempts);
        let cap_ms = (2f64.powf(exponent).ceil() as u64) * MIN_BACKOFF_MS;
        let cap_ms = cap_ms.max(MIN_BACKOFF_MS);
        let delay_ms = rand::thread_rng().gen_range(MIN_BACKOFF_MS..=cap_ms);
        Some(Duration::from_millis(delay_ms))
    }
}

impl Default for RateLimiter {
    /// A conservative default bucket: eight requests per second.
    fn default() -> Self {
        Self::new(DEFAULT_REFILL_RATE)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_tokens", &self.max_tokens)
            .field("refill_rate", &self.refill_rate)
            .field("max_backoff", &self.max_backoff)
            .finish_non_exhaustive()
    }
}
