//! Rate-limited access to the upstream API
//!
//! This module provides:
//! - Quota tracking over fixed 1-second and 60-second windows, reset on expiry
//! - A bounded log of recent call outcomes for statistics
//! - Request execution with retry, linear backoff and 429 cooldown
//! - The reqwest-backed HTTP transport

mod executor;
mod quota;
mod transport;
mod usage;

pub use executor::{RequestExecutor, Transport};
pub use quota::{QuotaSnapshot, QuotaState, QuotaTracker, MAX_ACQUIRE_ITERATIONS};
pub use transport::{HttpTransport, HttpTransportConfig};
pub use usage::{UsageRecorder, DEFAULT_MAX_ENTRIES, DEFAULT_RETENTION};

use std::time::Duration;

/// Immutable limiter settings; caps sit below the advertised upstream limits
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests granted per 60-second window
    pub per_minute_cap: u32,
    /// Requests granted per 1-second window
    pub per_second_cap: u32,
    /// Default chunk size for batch runs
    pub batch_size: usize,
    /// Attempts per logical request, including the first
    pub retry_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * retry_base_delay`
    pub retry_base_delay: Duration,
    /// Pause after every successful call
    pub request_pacing: Duration,
    /// Fixed wait after the upstream answers 429
    pub rate_limit_cooldown: Duration,
    /// Whether a 429 on the last attempt still waits out the cooldown
    pub cooldown_on_final_attempt: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            per_minute_cap: 280,
            per_second_cap: 9,
            batch_size: 10,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            request_pacing: Duration::from_millis(50),
            rate_limit_cooldown: Duration::from_secs(60),
            cooldown_on_final_attempt: true,
        }
    }
}

impl RateLimiterConfig {
    /// Derive caps from an advertised plan limit, keeping ~93% / ~90% headroom
    pub fn for_plan(advertised_per_minute: u32, advertised_per_second: u32) -> Self {
        Self {
            per_minute_cap: headroom(advertised_per_minute, 93),
            per_second_cap: headroom(advertised_per_second, 90),
            ..Default::default()
        }
    }
}

/// `percent` of `limit`, rounded down, never below one
fn headroom(limit: u32, percent: u64) -> u32 {
    (u64::from(limit) * percent / 100).max(1) as u32
}
