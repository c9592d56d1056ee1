//! Per-subscription circuit breaker.
//!
//! Isolates a persistently failing consumer: after enough consecutive
//! failures the breaker opens and delivery attempts fail fast without
//! invoking the handler, until a reset timeout admits a trial call.
//! Timing uses the tokio clock so tests can pause and advance it.

use courier_core::HandlerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Trial calls are being admitted after a reset timeout
    HalfOpen,
    /// Calls fail fast without reaching the handler
    Open,
}

/// Why `execute` did not return the operation's own result.
#[derive(Debug, Clone, Error)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Point-in-time breaker counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub trips: u64,
}

/// A consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_state_change: Instant,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_state_change: Instant::now(),
            trips: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may proceed right now.
    ///
    /// An open breaker whose reset timeout has elapsed transitions to
    /// half-open and admits the call as a trial.
    pub fn try_acquire(&mut self) -> Result<(), BreakerError> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                if self.last_state_change.elapsed() >= self.timeout {
                    info!("Circuit breaker half-open, admitting trial call");
                    self.transition(BreakerState::HalfOpen);
                    Ok(())
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    info!("Circuit breaker closed after successful trials");
                    self.transition(BreakerState::Closed);
                }
            }
            // A call admitted before the breaker opened may settle late;
            // it has no bearing on the open state
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    warn!(
                        failures = self.failure_count,
                        "Circuit breaker opened after consecutive failures"
                    );
                    self.trips += 1;
                    self.transition(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                warn!("Trial call failed, circuit breaker re-opened");
                self.trips += 1;
                self.transition(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Run an operation through the breaker.
    ///
    /// Fails fast with [`BreakerError::Open`] while open; otherwise awaits
    /// the operation and records its outcome.
    pub async fn execute<F>(&mut self, op: F) -> Result<(), BreakerError>
    where
        F: std::future::Future<Output = Result<(), HandlerError>>,
    {
        self.try_acquire()?;
        match op.await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Handler(err))
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            trips: self.trips,
        }
    }

    fn transition(&mut self, next: BreakerState) {
        self.state = next;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_state_change = Instant::now();
    }
}
