//! Rate limiters that decide how long a failed identity waits before its
//! next attempt.
//!
//! The controller default is [`default_controller_limiter`]: per-identity
//! exponential backoff combined with an overall token bucket, whichever
//! asks for the longer wait.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::ObjectIdentity;

pub trait RateLimiter: Send + Sync {
    /// Delay before `id` may be retried. Records one more failure for `id`.
    fn when(&self, id: &ObjectIdentity) -> Duration;

    /// Stop tracking `id`; its next failure starts from the base delay.
    fn forget(&self, id: &ObjectIdentity);

    /// Failures recorded for `id` since the last `forget`.
    fn retries(&self, id: &ObjectIdentity) -> u32;
}

// ---------------------------------------------------------------------------
// Exponential per-identity backoff
// ---------------------------------------------------------------------------

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectIdentity, u32>>,
}

impl ExponentialFailureLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self, exponent: u32) -> Duration {
        // 2^31 * base already exceeds any sane cap.
        let factor = 2u32.checked_pow(exponent.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for ExponentialFailureLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ExponentialFailureLimiter {
    fn when(&self, id: &ObjectIdentity) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(id.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);
        self.backoff(exponent)
    }

    fn forget(&self, id: &ObjectIdentity) {
        self.failures.lock().remove(id);
    }

    fn retries(&self, id: &ObjectIdentity) -> u32 {
        self.failures.lock().get(id).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Overall token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every identity: at most `qps` retries per second
/// with bursts up to `burst`. Tokens may go negative; the debt is the delay.
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl Default for BucketLimiter {
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

impl RateLimiter for BucketLimiter {
    fn when(&self, _id: &ObjectIdentity) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _id: &ObjectIdentity) {}

    fn retries(&self, _id: &ObjectIdentity) -> u32 {
        0
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Longest delay of all members. Retry counts come from the member that
/// tracks the most.
pub struct MaxOfLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfLimiter {
    fn when(&self, id: &ObjectIdentity) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(id))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, id: &ObjectIdentity) {
        for limiter in &self.limiters {
            limiter.forget(id);
        }
    }

    fn retries(&self, id: &ObjectIdentity) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.retries(id))
            .max()
            .unwrap_or(0)
    }
}

/// Per-identity exponential backoff (`base` → `max`) plus a 10 qps / 100
/// burst overall bucket.
pub fn default_controller_limiter(base: Duration, max: Duration) -> MaxOfLimiter {
    MaxOfLimiter::new(vec![
        Box::new(ExponentialFailureLimiter::new(base, max)),
        Box::new(BucketLimiter::default()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ObjectIdentity {
        ObjectIdentity::cluster("Namespace", name)
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let limiter =
            ExponentialFailureLimiter::new(Duration::from_secs(5), Duration::from_secs(1000));
        let delays: Vec<Duration> = (0..12).map(|_| limiter.when(&id("a"))).collect();

        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "backoff must not shrink: {pair:?}");
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1000));
        assert_eq!(limiter.retries(&id("a")), 12);
    }

    #[test]
    fn exponential_survives_huge_failure_counts() {
        let limiter =
            ExponentialFailureLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            let d = limiter.when(&id("a"));
            assert!(d >= last);
            assert!(d <= Duration::from_secs(1000));
            last = d;
        }
    }

    #[test]
    fn forget_resets_backoff() {
        let limiter = ExponentialFailureLimiter::default();
        limiter.when(&id("a"));
        limiter.when(&id("a"));
        limiter.forget(&id("a"));
        assert_eq!(limiter.retries(&id("a")), 0);
        assert_eq!(limiter.when(&id("a")), Duration::from_millis(5));
    }

    #[test]
    fn identities_back_off_independently() {
        let limiter = ExponentialFailureLimiter::default();
        limiter.when(&id("a"));
        limiter.when(&id("a"));
        assert_eq!(limiter.when(&id("b")), Duration::from_millis(5));
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let limiter = BucketLimiter::new(1.0, 2);
        assert_eq!(limiter.when(&id("a")), Duration::ZERO);
        assert_eq!(limiter.when(&id("b")), Duration::ZERO);
        assert!(limiter.when(&id("c")) > Duration::from_millis(500));
    }

    #[test]
    fn max_of_takes_longest_delay() {
        let limiter = MaxOfLimiter::new(vec![
            Box::new(ExponentialFailureLimiter::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
            )),
            Box::new(BucketLimiter::default()),
        ]);
        assert_eq!(limiter.when(&id("a")), Duration::from_secs(1));
        assert_eq!(limiter.when(&id("a")), Duration::from_secs(2));
        assert_eq!(limiter.retries(&id("a")), 2);
        limiter.forget(&id("a"));
        assert_eq!(limiter.retries(&id("a")), 0);
    }
}
