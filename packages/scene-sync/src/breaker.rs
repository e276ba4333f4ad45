//! Circuit breaker guarding one class of collaborator call.
//!
//! ```text
//!            failureThreshold consecutive failures
//!            or ceilings violated for monitoringPeriod
//!   Closed ─────────────────────────────────────────► Open
//!     ▲                                                 │
//!     │ trial succeeds                   resetTimeout   │
//!     │                                     elapses     ▼
//!     └──────────────────────────────────────────── HalfOpen
//!                      trial fails: back to Open, timer restarts
//! ```
//!
//! Half-open admits exactly one trial call. Calls rejected while open are
//! reported to the caller, never retried.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::BreakerConfig;
use crate::context::PerformanceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} circuit is open; retry after {retry_at}")]
pub struct CircuitOpenError {
    pub operation: &'static str,
    pub retry_at: DateTime<Utc>,
}

/// Result of a guarded call: either the breaker refused it or the call ran.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("{0}")]
    Failed(E),
}

pub struct CircuitBreaker {
    operation: &'static str,
    config: BreakerConfig,
    clock: SharedClock,
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    degraded_since: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(operation: &'static str, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            operation,
            config,
            clock,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
            degraded_since: None,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Effective state. An open breaker whose reset timeout has elapsed
    /// reports `HalfOpen` even before the next call materializes it.
    pub fn state(&self) -> BreakerState {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at))
                if self.clock.now() - opened_at >= self.config.reset_timeout() =>
            {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            opened_at: self.opened_at,
        }
    }

    /// Ask permission for one call. Every `Ok` must be followed by exactly
    /// one `record_success` or `record_failure`.
    pub fn try_acquire(&mut self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let retry_at = opened_at + self.config.reset_timeout();
                if now < retry_at {
                    debug!(operation = self.operation, %retry_at, "call rejected by open circuit");
                    return Err(CircuitOpenError {
                        operation: self.operation,
                        retry_at,
                    });
                }
                self.half_open();
                self.trial_in_flight = true;
                Ok(())
            }
            BreakerState::HalfOpen if self.trial_in_flight => {
                debug!(operation = self.operation, "half-open trial already in flight");
                Err(CircuitOpenError {
                    operation: self.operation,
                    retry_at: now,
                })
            }
            BreakerState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::HalfOpen => self.close(),
            // A call admitted before the breaker opened; the trial decides.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        let now = self.clock.now();
        self.last_failure_at = Some(now);
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.open(now, "failure threshold reached");
                }
            }
            BreakerState::HalfOpen => self.open(now, "half-open trial failed"),
            BreakerState::Open => {}
        }
    }

    /// Trip when ceilings stay violated for a full monitoring period.
    pub fn observe_performance(&mut self, snapshot: &PerformanceSnapshot) {
        let now = self.clock.now();
        if !self.config.is_degraded(snapshot) {
            self.degraded_since = None;
            return;
        }

        let since = *self.degraded_since.get_or_insert(now);
        if self.state == BreakerState::Closed && now - since >= self.config.monitoring_period() {
            self.open(now, "performance ceilings exceeded");
            self.degraded_since = None;
        }
    }

    /// Run an async operation under the breaker.
    pub async fn execute<T, E, F, Fut>(&mut self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(CallError::Open)?;
        let result = operation().await;
        self.settle(result)
    }

    /// Run a synchronous operation under the breaker.
    pub fn call<T, E>(&mut self, operation: impl FnOnce() -> Result<T, E>) -> Result<T, CallError<E>> {
        self.try_acquire().map_err(CallError::Open)?;
        let result = operation();
        self.settle(result)
    }

    fn settle<T, E>(&mut self, result: Result<T, E>) -> Result<T, CallError<E>> {
        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(CallError::Failed(error))
            }
        }
    }

    fn open(&mut self, now: DateTime<Utc>, reason: &'static str) {
        warn!(
            operation = self.operation,
            failures = self.failure_count,
            reason,
            "circuit opened"
        );
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    fn half_open(&mut self) {
        debug!(operation = self.operation, "circuit half-open");
        self.state = BreakerState::HalfOpen;
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        info!(operation = self.operation, "circuit closed");
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation", &self.operation)
            .field("state", &self.state)
            .field("failure_count", &self.failure_count)
            .finish_non_exhaustive()
    }
}
