//! Circuit breaker guarding the backing store.
//!
//! Every store call made by the pipeline runs through [`CircuitBreaker::execute`].
//! While the breaker is open, calls fail immediately with
//! [`CircuitError::Open`] and the store is not contacted; after the cool-down a
//! single trial call decides whether the breaker closes again.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::types::{CircuitBreakerState, CircuitStatus};

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open, retry in {retry_in:?}")]
    Open { retry_in: Duration },
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerStats {
    state: CircuitStatus,
    consecutive_failures: u32,
    total_requests: u32,
    failed_requests: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<i64>,
    trial_in_flight: bool,
}

impl BreakerStats {
    fn new() -> Self {
        Self {
            state: CircuitStatus::Closed,
            consecutive_failures: 0,
            total_requests: 0,
            failed_requests: 0,
            opened_at: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.failed_requests) / f64::from(self.total_requests)
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.total_requests = 0;
        self.failed_requests = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Clears the half-open trial flag if the trial future is dropped before it
/// reports an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    stats: Mutex<BreakerStats>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(BreakerStats::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Runs `operation` unless the breaker is open, recording its outcome.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(admission);
                Err(CircuitError::Inner(err))
            }
        }
    }

    pub fn state(&self) -> CircuitStatus {
        let mut stats = self.lock();
        self.refresh(&mut stats);
        stats.state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let mut stats = self.lock();
        self.refresh(&mut stats);
        let open_for_ms = match (stats.state, stats.opened_at) {
            (CircuitStatus::Open, Some(opened_at)) => Some(
                self.config
                    .cooldown
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as i64,
            ),
            _ => None,
        };
        CircuitBreakerState {
            state: stats.state,
            consecutive_failures: stats.consecutive_failures,
            total_requests: stats.total_requests,
            failed_requests: stats.failed_requests,
            last_failure_at: stats.last_failure_at,
            open_for_ms,
        }
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        let mut stats = self.lock();
        tracing::warn!(
            previous = ?stats.state,
            consecutive_failures = stats.consecutive_failures,
            "circuit breaker reset by operator"
        );
        *stats = BreakerStats::new();
    }

    fn admit<E>(&self) -> Result<Admission, CircuitError<E>> {
        let mut stats = self.lock();
        self.refresh(&mut stats);

        match stats.state {
            CircuitStatus::Closed => Ok(Admission::Normal),
            CircuitStatus::Open => Err(CircuitError::Open {
                retry_in: self.remaining_cooldown(&stats),
            }),
            CircuitStatus::HalfOpen if stats.trial_in_flight => Err(CircuitError::Open {
                retry_in: Duration::ZERO,
            }),
            CircuitStatus::HalfOpen => {
                stats.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut stats = self.lock();
        if admission == Admission::Trial {
            stats.trial_in_flight = false;
            if stats.state == CircuitStatus::HalfOpen {
                tracing::info!("circuit breaker closing after successful trial");
                stats.state = CircuitStatus::Closed;
                stats.opened_at = None;
                stats.reset_counters();
            }
            return;
        }

        self.roll_window(&mut stats);
        stats.total_requests += 1;
        stats.consecutive_failures = 0;
    }

    fn record_failure(&self, admission: Admission) {
        let mut stats = self.lock();
        stats.last_failure_at = Some(Utc::now().timestamp_millis());

        if admission == Admission::Trial {
            stats.trial_in_flight = false;
            tracing::warn!("circuit breaker trial failed, reopening");
            stats.state = CircuitStatus::Open;
            stats.opened_at = Some(Instant::now());
            return;
        }

        self.roll_window(&mut stats);
        stats.total_requests += 1;
        stats.failed_requests += 1;
        stats.consecutive_failures += 1;

        if stats.state == CircuitStatus::Closed && self.should_open(&stats) {
            tracing::warn!(
                consecutive_failures = stats.consecutive_failures,
                failure_rate = stats.failure_rate(),
                "circuit breaker opening"
            );
            stats.state = CircuitStatus::Open;
            stats.opened_at = Some(Instant::now());
        }
    }

    fn should_open(&self, stats: &BreakerStats) -> bool {
        if stats.consecutive_failures >= self.config.failure_threshold {
            return true;
        }

        stats.total_requests >= self.config.min_requests_for_rate
            && stats.failure_rate() >= self.config.failure_rate_threshold
    }

    /// Moves an open breaker to half-open once the cool-down has elapsed.
    fn refresh(&self, stats: &mut BreakerStats) {
        if stats.state == CircuitStatus::Open
            && let Some(opened_at) = stats.opened_at
            && opened_at.elapsed() >= self.config.cooldown
        {
            tracing::info!("circuit breaker half-open, admitting trial call");
            stats.state = CircuitStatus::HalfOpen;
            stats.trial_in_flight = false;
        }
    }

    fn roll_window(&self, stats: &mut BreakerStats) {
        if stats.total_requests >= self.config.window_size.max(1) {
            stats.total_requests = 0;
            stats.failed_requests = 0;
        }
    }

    fn remaining_cooldown(&self, stats: &BreakerStats) -> Duration {
        stats
            .opened_at
            .map(|opened_at| self.config.cooldown.saturating_sub(opened_at.elapsed()))
            .unwrap_or(self.config.cooldown)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
