//! Inbound request rate limiting.
//!
//! Each caller key (its bearer secret, or the anonymous bucket when auth is
//! disabled) gets its own token bucket via the governor crate. Buckets are
//! created lazily on the first request from a key.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::config::RateLimitConfig;
use crate::core::error::AppError;

/// Type alias for the rate limiter instance
type RateLimiterInstance = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Rate limiter for managing per-key request limits.
pub struct RateLimiter {
    /// Map of key -> rate limiter instance
    limiters: Arc<DashMap<String, RateLimiterInstance>>,
    quota: Quota,
}

impl RateLimiter {
    /// Create a rate limiter applying `config` to every key.
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(60u32));
        Self {
            limiters: Arc::new(DashMap::new()),
            quota: Quota::per_minute(per_minute).allow_burst(per_minute),
        }
    }

    /// Check if a request is allowed for the given key.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the request is allowed
    /// * `Err(AppError::RateLimitExceeded)` if the rate limit is exceeded
    pub fn check_rate_limit(&self, key: &str) -> Result<(), AppError> {
        let limiter = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(self.quota)))
            .clone();

        match limiter.check() {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    key_prefix = &key[..key.len().min(8)],
                    "Inbound rate limit exceeded"
                );
                Err(AppError::RateLimitExceeded(
                    "Too many requests, please slow down".to_string(),
                ))
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}
