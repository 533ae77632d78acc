//! Quota tracking over 1-second and 60-second windows
//!
//! Every caller goes through one critical section that resets expired
//! windows, checks both caps and increments the counters. Callers that
//! cannot be granted a slot sleep outside the lock and re-evaluate, since
//! another caller may have reset the window in the meantime.

use crate::error::{IngestError, Result};
use crate::observability::IngestMetrics;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on wait/re-check rounds for a single acquisition
pub const MAX_ACQUIRE_ITERATIONS: u32 = 1_000;

/// Window counters; only mutated inside [`QuotaTracker::acquire`]
#[derive(Debug, Clone)]
pub struct QuotaState {
    pub per_second_count: u32,
    pub per_second_window_start: Instant,
    pub per_minute_count: u32,
    pub per_minute_window_start: Instant,
}

impl QuotaState {
    pub fn new(now: Instant) -> Self {
        Self {
            per_second_count: 0,
            per_second_window_start: now,
            per_minute_count: 0,
            per_minute_window_start: now,
        }
    }

    /// Reset expired windows, then either reserve a slot (`None`) or return
    /// how long the caller has to wait before trying again.
    pub fn try_reserve(
        &mut self,
        now: Instant,
        per_minute_cap: u32,
        per_second_cap: u32,
    ) -> Option<Duration> {
        if now.saturating_duration_since(self.per_second_window_start) >= SECOND_WINDOW {
            self.per_second_count = 0;
            self.per_second_window_start = now;
        }
        if now.saturating_duration_since(self.per_minute_window_start) >= MINUTE_WINDOW {
            self.per_minute_count = 0;
            self.per_minute_window_start = now;
        }

        if self.per_minute_count >= per_minute_cap {
            let elapsed = now.saturating_duration_since(self.per_minute_window_start);
            return Some(MINUTE_WINDOW.saturating_sub(elapsed));
        }
        if self.per_second_count >= per_second_cap {
            let elapsed = now.saturating_duration_since(self.per_second_window_start);
            return Some(SECOND_WINDOW.saturating_sub(elapsed));
        }

        self.per_second_count += 1;
        self.per_minute_count += 1;
        None
    }

    /// Counts as they would read at `now`, treating expired windows as empty
    fn effective_counts(&self, now: Instant) -> (u32, u32) {
        let second = if now.saturating_duration_since(self.per_second_window_start) >= SECOND_WINDOW
        {
            0
        } else {
            self.per_second_count
        };
        let minute = if now.saturating_duration_since(self.per_minute_window_start) >= MINUTE_WINDOW
        {
            0
        } else {
            self.per_minute_count
        };
        (second, minute)
    }
}

/// Read-only view of the quota counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub per_second_count: u32,
    pub per_minute_count: u32,
    pub per_second_cap: u32,
    pub per_minute_cap: u32,
}

impl QuotaSnapshot {
    pub fn remaining_this_minute(&self) -> u32 {
        self.per_minute_cap.saturating_sub(self.per_minute_count)
    }

    /// Share of the minute cap already consumed, in percent
    pub fn minute_usage_percent(&self) -> f64 {
        if self.per_minute_cap == 0 {
            return 0.0;
        }
        self.per_minute_count as f64 / self.per_minute_cap as f64 * 100.0
    }
}

/// Gatekeeper granting upstream request slots
pub struct QuotaTracker {
    per_minute_cap: u32,
    per_second_cap: u32,
    state: Mutex<QuotaState>,
    metrics: IngestMetrics,
}

impl QuotaTracker {
    pub fn new(per_minute_cap: u32, per_second_cap: u32) -> Self {
        Self {
            per_minute_cap,
            per_second_cap,
            state: Mutex::new(QuotaState::new(Instant::now())),
            metrics: IngestMetrics::new(),
        }
    }

    pub fn per_minute_cap(&self) -> u32 {
        self.per_minute_cap
    }

    pub fn per_second_cap(&self) -> u32 {
        self.per_second_cap
    }

    /// Wait until a slot is available, then reserve it
    pub async fn acquire(&self) -> Result<()> {
        let started = Instant::now();

        for iteration in 0..MAX_ACQUIRE_ITERATIONS {
            let wait = {
                let mut state = self.state.lock().await;
                match state.try_reserve(Instant::now(), self.per_minute_cap, self.per_second_cap) {
                    None => {
                        self.metrics
                            .observe_quota_wait(started.elapsed().as_secs_f64());
                        self.metrics.set_quota_minute_usage(state.per_minute_count as i64);
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };

            debug!(
                iteration = iteration,
                wait_ms = wait.as_millis() as u64,
                "Quota exhausted, waiting for next window"
            );
            sleep(wait).await;
        }

        error!(
            iterations = MAX_ACQUIRE_ITERATIONS,
            "Quota acquisition did not converge"
        );
        Err(IngestError::QuotaExceeded {
            iterations: MAX_ACQUIRE_ITERATIONS,
        })
    }

    /// Current counters without reserving anything
    pub async fn snapshot(&self) -> QuotaSnapshot {
        let state = self.state.lock().await;
        let (per_second_count, per_minute_count) = state.effective_counts(Instant::now());
        QuotaSnapshot {
            per_second_count,
            per_minute_count,
            per_second_cap: self.per_second_cap,
            per_minute_cap: self.per_minute_cap,
        }
    }
}
