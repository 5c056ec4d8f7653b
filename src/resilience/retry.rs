use std::future::Future;
use std::ops::ControlFlow;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::error::PipelineError;

/// Bounded retry with exponential backoff (`base * 2^n`, capped, optional
/// jitter). A rejected call from an open breaker is never retried.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub(crate) fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay, jitter: false }
    }

    pub(crate) fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay slept after the `retry`-th failed attempt (0-based).
    pub(crate) fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub(crate) async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.run_with(operation, op, PipelineError::is_transient).await
    }

    pub(crate) async fn run_with<T, F, Fut, P>(
        &self,
        operation: &'static str,
        mut op: F,
        is_transient: P,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
        P: Fn(&PipelineError) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = op(attempt).await;
            match self.decide(operation, attempt, result, &is_transient) {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(delay) => sleep(delay).await,
            }
        }
    }

    /// Retries `op` through `breaker`; each attempt is one breaker call.
    pub(crate) async fn run_guarded<T, F, Fut>(
        &self,
        operation: &'static str,
        breaker: &CircuitBreaker,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = breaker.call(|| op()).await;
            match self.decide(operation, attempt, result, &PipelineError::is_transient) {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(delay) => sleep(delay).await,
            }
        }
    }

    fn decide<T, P>(
        &self,
        operation: &'static str,
        attempt: u32,
        result: Result<T, PipelineError>,
        is_transient: &P,
    ) -> ControlFlow<Result<T, PipelineError>, Duration>
    where
        P: Fn(&PipelineError) -> bool,
    {
        let err = match result {
            Ok(value) => return ControlFlow::Break(Ok(value)),
            Err(err) => err,
        };

        if err.is_circuit_open() || !is_transient(&err) {
            return ControlFlow::Break(Err(err));
        }

        if attempt >= self.max_attempts {
            tracing::error!(operation, attempts = attempt, error = %err, "Retries exhausted");
            return ControlFlow::Break(Err(PipelineError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            }));
        }

        let delay = self.delay_for(attempt - 1);
        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );
        metrics::counter!("retry_attempts_total", "operation" => operation).increment(1);
        ControlFlow::Continue(delay)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}
