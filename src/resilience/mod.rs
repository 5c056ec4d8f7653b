pub(crate) mod circuit_breaker;
pub(crate) mod error;
pub(crate) mod retry;

pub(crate) use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState};
pub(crate) use error::{ErrorKind, PipelineError};
pub(crate) use retry::RetryPolicy;
