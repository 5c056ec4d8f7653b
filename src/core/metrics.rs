use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("evaluation_tasks_total", "Evaluation tasks finished, by terminal status");
    describe_histogram!(
        "evaluation_duration_seconds",
        Unit::Seconds,
        "Wall-clock time from claim to persisted result"
    );
    describe_histogram!(
        "evaluation_queue_latency_seconds",
        Unit::Seconds,
        "Time a job waited in the queue before a worker picked it up"
    );
    describe_counter!("circuit_breaker_transitions_total", "Circuit breaker state changes");
    describe_counter!("circuit_breaker_rejections_total", "Calls rejected by an open breaker");
    describe_counter!("retry_attempts_total", "Retries scheduled after a transient failure");
    describe_counter!("rag_cache_builds_total", "Theme indexes built from the example store");
    describe_counter!("rag_cache_hits_total", "Theme lookups served from the cache");
    describe_counter!("rag_cache_misses_total", "Theme lookups that needed a build");
    describe_counter!("rag_cache_evictions_total", "Theme indexes evicted by capacity");
    describe_counter!("http_requests_total", "HTTP responses, by status code");
    describe_histogram!("http_request_duration_seconds", Unit::Seconds, "HTTP request latency");
}
