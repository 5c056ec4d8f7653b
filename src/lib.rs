pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod resilience;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::repositories::{PgExampleStore, PgTaskStore, TaskStore};
use crate::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy};
use crate::services::health::HealthReporter;
use crate::services::llm_scoring::{HttpScorer, Scorer};
use crate::services::notifier::{ResultNotifier, WebhookNotifier};
use crate::services::resource_cache::ResourceCache;
use crate::services::storage::StorageService;
use crate::services::submissions::StoredSubmissionSource;
use crate::tasks::dispatcher::TaskDispatcher;
use crate::tasks::evaluation::{EvaluationWorker, WorkerDeps};
use crate::tasks::scheduler::{job_queue, WorkerPool};

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let resilience = settings.resilience();
    let llm_breaker = Arc::new(CircuitBreaker::new(
        "llm",
        BreakerConfig {
            failure_threshold: resilience.llm_breaker_threshold,
            open_duration: resilience.llm_cooldown(),
        },
    ));
    let retrieval_breaker = Arc::new(CircuitBreaker::new(
        "retrieval",
        BreakerConfig {
            failure_threshold: resilience.retrieval_breaker_threshold,
            open_duration: resilience.retrieval_cooldown(),
        },
    ));
    let retry = RetryPolicy::new(
        resilience.retry_max_attempts,
        resilience.retry_base_delay(),
        resilience.retry_max_delay(),
    )
    .with_jitter(resilience.retry_jitter);

    let tasks: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(db_pool.clone()));
    let cache = Arc::new(ResourceCache::new(
        Arc::new(PgExampleStore::new(db_pool.clone())),
        retrieval_breaker.clone(),
        retry,
        settings.cache().capacity,
        settings.cache().top_k,
    ));

    let scorer = Arc::new(HttpScorer::from_settings(&settings)?);
    let storage = StorageService::from_settings(&settings).await?;
    if let Some(storage) = &storage {
        tracing::info!(bucket = storage.bucket(), "S3 submission storage enabled");
    }
    let source =
        Arc::new(StoredSubmissionSource::new(settings.storage().resources_dir.clone(), storage));
    let notifier = match settings.notifier().result_webhook_url.as_deref() {
        Some(url) => Some(Arc::new(WebhookNotifier::new(url)?) as Arc<dyn ResultNotifier>),
        None => None,
    };

    let worker = Arc::new(EvaluationWorker::new(WorkerDeps {
        tasks: tasks.clone(),
        source,
        cache: cache.clone(),
        scorer: scorer.clone(),
        llm_breaker: llm_breaker.clone(),
        retry,
        notifier,
        task_timeout: settings.worker().task_timeout(),
        persist_timeout: settings.worker().persist_timeout(),
    }));
    let (queue, receiver) = job_queue(settings.worker().queue_capacity);
    let workers = WorkerPool::spawn(worker, receiver, settings.worker().concurrency);

    let dispatcher = TaskDispatcher::new(tasks.clone(), queue, scorer.default_model());
    let health = HealthReporter::new(vec![llm_breaker, retrieval_breaker], cache.clone())
        .with_database(tasks.clone());
    let state = AppState::new(settings, tasks, dispatcher, cache, health);

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        llm_provider = state.settings().llm().provider.as_str(),
        workers = state.settings().worker().concurrency,
        "Autograder API listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    tracing::info!(in_flight = workers.in_flight(), "Stopping evaluation workers");
    workers.shutdown().await;
    db_pool.close().await;

    result?;

    Ok(())
}
