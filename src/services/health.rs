use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::repositories::TaskStore;
use crate::resilience::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::services::resource_cache::{CacheStats, ResourceCache};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HealthReport {
    pub(crate) status: HealthStatus,
    pub(crate) components: BTreeMap<String, String>,
    pub(crate) circuits: Vec<CircuitSnapshot>,
    pub(crate) cache: Option<CacheStats>,
}

/// Aggregates breaker and cache state into a liveness signal. Observes only;
/// nothing on the evaluation path consults it.
pub(crate) struct HealthReporter {
    breakers: Vec<Arc<CircuitBreaker>>,
    cache: Arc<ResourceCache>,
    database: Option<Arc<dyn TaskStore>>,
    probe_timeout: Duration,
}

impl HealthReporter {
    pub(crate) fn new(breakers: Vec<Arc<CircuitBreaker>>, cache: Arc<ResourceCache>) -> Self {
        Self { breakers, cache, database: None, probe_timeout: PROBE_TIMEOUT }
    }

    pub(crate) fn with_database(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.database = Some(store);
        self
    }

    pub(crate) async fn report(&self) -> HealthReport {
        let mut status = HealthStatus::Healthy;
        let mut components = BTreeMap::new();

        let circuits = self.breakers.iter().map(|breaker| breaker.snapshot()).collect::<Vec<_>>();
        for circuit in &circuits {
            components.insert(circuit.dependency.clone(), circuit.state.as_str().to_string());
            if circuit.state == CircuitState::Open {
                status = HealthStatus::Degraded;
            }
        }

        let cache = match tokio::time::timeout(self.probe_timeout, self.cache.stats()).await {
            Ok(stats) => {
                components.insert("cache".to_string(), "healthy".to_string());
                Some(stats)
            }
            Err(_) => {
                components.insert("cache".to_string(), "unresponsive".to_string());
                status = HealthStatus::Unhealthy;
                None
            }
        };

        if let Some(database) = &self.database {
            match tokio::time::timeout(self.probe_timeout, database.ping()).await {
                Ok(Ok(())) => {
                    components.insert("database".to_string(), "healthy".to_string());
                }
                Ok(Err(err)) => {
                    components.insert("database".to_string(), format!("unhealthy: {err}"));
                    status = HealthStatus::Unhealthy;
                }
                Err(_) => {
                    components.insert("database".to_string(), "unhealthy: ping timed out".to_string());
                    status = HealthStatus::Unhealthy;
                }
            }
        }

        HealthReport { status, components, circuits, cache }
    }
}
