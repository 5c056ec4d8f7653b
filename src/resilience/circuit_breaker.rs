//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed   -> Open      consecutive counted failures reach the threshold
//! Open     -> HalfOpen  first call after the cooldown becomes the probe
//! HalfOpen -> Closed    probe succeeds
//! HalfOpen -> Open      probe fails, cooldown restarts
//! ```
//!
//! All state lives behind one mutex per breaker and the lock is never held
//! across an `.await`, so transitions are linearizable across workers.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::{Duration, Instant};

use crate::core::time::format_offset;
use crate::resilience::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BreakerConfig {
    pub(crate) failure_threshold: u32,
    pub(crate) open_duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CircuitSnapshot {
    pub(crate) dependency: String,
    pub(crate) state: CircuitState,
    pub(crate) consecutive_failures: u32,
    pub(crate) failure_threshold: u32,
    pub(crate) open_duration_seconds: u64,
    pub(crate) last_failure_at: Option<String>,
    pub(crate) times_opened: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct BreakerInner {
    phase: Phase,
    consecutive_failures: u32,
    last_failure_at: Option<OffsetDateTime>,
    times_opened: u64,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Reservation handed out by [`CircuitBreaker::acquire`]. A probe reservation
/// dropped without an outcome (e.g. the caller was cancelled by a timeout)
/// frees the half-open slot so another caller can probe.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.probe, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

impl CircuitBreaker {
    pub(crate) fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner {
                phase: Phase::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                times_opened: 0,
            }),
        }
    }

    /// Runs `op` under the breaker, counting transient failures.
    pub(crate) async fn call<T, F, Fut>(&self, op: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.call_with(op, PipelineError::is_transient).await
    }

    /// Runs `op` under the breaker. Errors for which `is_failure` returns
    /// false are passed through without counting against the dependency.
    pub(crate) async fn call_with<T, F, Fut, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
        P: Fn(&PipelineError) -> bool,
    {
        let permit = self.acquire()?;
        let result = op().await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(err) if is_failure(err) => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        permit.settle(outcome);
        result
    }

    pub(crate) fn state(&self) -> CircuitState {
        match self.lock().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub(crate) fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let state = match inner.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        };
        CircuitSnapshot {
            dependency: self.dependency.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            open_duration_seconds: self.config.open_duration.as_secs(),
            last_failure_at: inner.last_failure_at.map(format_offset),
            times_opened: inner.times_opened,
        }
    }

    fn acquire(&self) -> Result<Permit<'_>, PipelineError> {
        let mut inner = self.lock();
        let phase = inner.phase;
        let probe = match phase {
            Phase::Closed => false,
            Phase::Open { until } if Instant::now() >= until => {
                self.enter(&mut inner, Phase::HalfOpen { probe_in_flight: true });
                true
            }
            Phase::HalfOpen { probe_in_flight: false } => {
                inner.phase = Phase::HalfOpen { probe_in_flight: true };
                true
            }
            Phase::Open { .. } | Phase::HalfOpen { probe_in_flight: true } => {
                drop(inner);
                metrics::counter!(
                    "circuit_breaker_rejections_total",
                    "dependency" => self.dependency.clone()
                )
                .increment(1);
                return Err(PipelineError::CircuitOpen { dependency: self.dependency.clone() });
            }
        };

        Ok(Permit { breaker: self, probe, settled: false })
    }

    fn record(&self, probe: bool, outcome: Outcome) {
        let mut inner = self.lock();

        if probe {
            match outcome {
                Outcome::Success | Outcome::Neutral => {
                    inner.consecutive_failures = 0;
                    self.enter(&mut inner, Phase::Closed);
                }
                Outcome::Failure => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure_at = Some(OffsetDateTime::now_utc());
                    self.open(&mut inner);
                }
            }
            return;
        }

        // Calls admitted while closed only move the counter if the breaker is
        // still closed; a concurrent caller may already have opened it.
        match (outcome, inner.phase) {
            (Outcome::Success, Phase::Closed) => inner.consecutive_failures = 0,
            (Outcome::Failure, Phase::Closed) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.last_failure_at = Some(OffsetDateTime::now_utc());
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            (Outcome::Failure, _) => inner.last_failure_at = Some(OffsetDateTime::now_utc()),
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if let Phase::HalfOpen { probe_in_flight: true } = inner.phase {
            inner.phase = Phase::HalfOpen { probe_in_flight: false };
            tracing::debug!(dependency = %self.dependency, "Half-open probe abandoned");
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.times_opened += 1;
        let until = Instant::now() + self.config.open_duration;
        self.enter(inner, Phase::Open { until });
        tracing::warn!(
            dependency = %self.dependency,
            consecutive_failures = inner.consecutive_failures,
            cooldown_seconds = self.config.open_duration.as_secs(),
            "Circuit breaker opened"
        );
    }

    fn enter(&self, inner: &mut BreakerInner, phase: Phase) {
        inner.phase = phase;
        let to = match phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        };
        if to != CircuitState::Open {
            tracing::info!(dependency = %self.dependency, state = to.as_str(), "Circuit breaker transition");
        }
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "dependency" => self.dependency.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
