//! Rate Limiter.
//!
//! Per-provider state behind `parking_lot::Mutex`, at the same per-provider
//! granularity as the load balancer's health map (a mutex here since every
//! operation both reads and writes the bucket).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub rpm: u32,
    pub tpm: u32,
    pub concurrent_cap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    BackoffActive,
    RequestLimitExceeded,
    TokenLimitExceeded,
    ConcurrentLimitExceeded,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::BackoffActive => "backoff_active",
            DenyReason::RequestLimitExceeded => "request_limit_exceeded",
            DenyReason::TokenLimitExceeded => "token_limit_exceeded",
            DenyReason::ConcurrentLimitExceeded => "concurrent_limit_exceeded",
        }
    }
}

const MINUTE_MS: u64 = 60_000;
const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Default)]
struct Bucket {
    requests_this_minute: u32,
    tokens_this_minute: u32,
    concurrent: u32,
    minute_bucket_start: u64,
    backoff_until: u64,
    consecutive_hits: u32,
    current_delay_ms: u64,
}

impl Bucket {
    fn roll_if_expired(&mut self, now: u64) {
        if self.minute_bucket_start == 0 || self.minute_bucket_start + MINUTE_MS <= now {
            self.minute_bucket_start = now;
            self.requests_this_minute = 0;
            self.tokens_this_minute = 0;
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a request if rpm, tpm, and concurrency limits all have room,
    /// accounting for it against the bucket immediately on success.
    pub fn can_admit(
        &self,
        provider: &str,
        est_tokens: u32,
        limits: Limits,
    ) -> Result<(), DenyReason> {
        let now = now_unix_ms();
        let mut guard = self.buckets.lock();
        let bucket = guard.entry(provider.to_string()).or_default();

        if now < bucket.backoff_until {
            return Err(DenyReason::BackoffActive);
        }
        bucket.roll_if_expired(now);

        if bucket.requests_this_minute + 1 > limits.rpm {
            return Err(DenyReason::RequestLimitExceeded);
        }
        if bucket.tokens_this_minute + est_tokens > limits.tpm {
            return Err(DenyReason::TokenLimitExceeded);
        }
        if bucket.concurrent + 1 > limits.concurrent_cap {
            return Err(DenyReason::ConcurrentLimitExceeded);
        }

        bucket.requests_this_minute += 1;
        bucket.tokens_this_minute += est_tokens;
        bucket.concurrent += 1;
        Ok(())
    }

    /// Caller must call this after every admitted request settles.
    /// `upstream_rate_limited` advances backoff; otherwise a clean success
    /// resets `consecutive_hits`.
    pub fn record(&self, provider: &str, upstream_rate_limited: bool) {
        let now = now_unix_ms();
        let mut guard = self.buckets.lock();
        let bucket = guard.entry(provider.to_string()).or_default();
        bucket.concurrent = bucket.concurrent.saturating_sub(1);

        if upstream_rate_limited {
            let delay = (BASE_DELAY_MS * 2u64.saturating_pow(bucket.consecutive_hits)).min(MAX_DELAY_MS);
            bucket.current_delay_ms = delay;
            bucket.backoff_until = now + delay;
            bucket.consecutive_hits += 1;
        } else {
            bucket.consecutive_hits = 0;
            bucket.current_delay_ms = 0;
        }
    }

    /// Release a concurrency slot without touching backoff state, used on
    /// cancellation.
    pub fn release(&self, provider: &str) {
        let mut guard = self.buckets.lock();
        if let Some(bucket) = guard.get_mut(provider) {
            bucket.concurrent = bucket.concurrent.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            rpm: 2,
            tpm: 100,
            concurrent_cap: 1,
        }
    }

    #[test]
    fn admits_within_limits() {
        let limiter = RateLimiter::new();
        assert!(limiter.can_admit("a", 10, limits()).is_ok());
    }

    #[test]
    fn denies_when_concurrent_cap_reached() {
        let limiter = RateLimiter::new();
        limiter.can_admit("a", 10, limits()).unwrap();
        assert_eq!(
            limiter.can_admit("a", 10, limits()).unwrap_err(),
            DenyReason::ConcurrentLimitExceeded
        );
    }

    #[test]
    fn denies_when_token_budget_exceeded() {
        let limiter = RateLimiter::new();
        let err = limiter.can_admit("a", 200, limits()).unwrap_err();
        assert_eq!(err, DenyReason::TokenLimitExceeded);
    }

    #[test]
    fn release_frees_slot_for_next_admit() {
        let limiter = RateLimiter::new();
        limiter.can_admit("a", 10, limits()).unwrap();
        limiter.release("a");
        assert!(limiter.can_admit("a", 10, limits()).is_ok());
    }

    #[test]
    fn backoff_blocks_until_delay_elapses() {
        let limiter = RateLimiter::new();
        limiter.can_admit("a", 10, limits()).unwrap();
        limiter.record("a", true);
        let err = limiter.can_admit("a", 10, limits()).unwrap_err();
        assert_eq!(err, DenyReason::BackoffActive);
    }

    #[test]
    fn success_resets_consecutive_hits() {
        let limiter = RateLimiter::new();
        limiter.can_admit("a", 10, limits()).unwrap();
        limiter.record("a", true);
        // second attempt goes to backoff again but with doubled delay;
        // simulate backoff clearing then a clean success resets it.
        {
            let mut guard = limiter.buckets.lock();
            guard.get_mut("a").unwrap().backoff_until = 0;
        }
        limiter.can_admit("a", 10, limits()).unwrap();
        limiter.record("a", false);
        let guard = limiter.buckets.lock();
        assert_eq!(guard.get("a").unwrap().consecutive_hits, 0);
    }
}
