use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::time::{Duration, Instant};

use crate::db::models::Task;
use crate::db::types::TaskStatus;
use crate::repositories::{CompletionOutcome, TaskCompletion, TaskStore};
use crate::resilience::{CircuitBreaker, ErrorKind, PipelineError, RetryPolicy};
use crate::services::llm_scoring::{ScoreOutcome, ScoreRequest, Scorer};
use crate::services::notifier::ResultNotifier;
use crate::services::resource_cache::ResourceCache;
use crate::services::submissions::SubmissionSource;

/// Runs one task from `Running` to a terminal state and writes its result.
pub(crate) struct EvaluationWorker {
    tasks: Arc<dyn TaskStore>,
    source: Arc<dyn SubmissionSource>,
    cache: Arc<ResourceCache>,
    scorer: Arc<dyn Scorer>,
    llm_breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    notifier: Option<Arc<dyn ResultNotifier>>,
    task_timeout: Duration,
    persist_timeout: Duration,
}

pub(crate) struct WorkerDeps {
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) source: Arc<dyn SubmissionSource>,
    pub(crate) cache: Arc<ResourceCache>,
    pub(crate) scorer: Arc<dyn Scorer>,
    pub(crate) llm_breaker: Arc<CircuitBreaker>,
    pub(crate) retry: RetryPolicy,
    pub(crate) notifier: Option<Arc<dyn ResultNotifier>>,
    pub(crate) task_timeout: Duration,
    pub(crate) persist_timeout: Duration,
}

impl EvaluationWorker {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self {
            tasks: deps.tasks,
            source: deps.source,
            cache: deps.cache,
            scorer: deps.scorer,
            llm_breaker: deps.llm_breaker,
            retry: deps.retry,
            notifier: deps.notifier,
            task_timeout: deps.task_timeout,
            persist_timeout: deps.persist_timeout,
        }
    }

    /// Processes `task_id` once. Returns the terminal status written, or
    /// `None` when the task was not pending (unknown or already claimed).
    pub(crate) async fn process(&self, task_id: &str) -> Result<Option<TaskStatus>, PipelineError> {
        let Some(task) = self.tasks.mark_running(task_id).await? else {
            tracing::warn!(task_id, "Task is not pending, skipping");
            return Ok(None);
        };

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let outcome = match tokio::time::timeout(self.task_timeout, self.evaluate(&task, &attempts))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::Timeout(self.task_timeout)),
        };
        let attempts = attempts.load(Ordering::SeqCst);

        let completion = match outcome {
            Ok(scored) => TaskCompletion {
                task_id: task.id.clone(),
                model: scored.model,
                attempts,
                outcome: CompletionOutcome::Succeeded {
                    score: scored.score,
                    feedback: scored.feedback,
                },
            },
            Err(err) => {
                tracing::error!(
                    task_id = %task.id,
                    theme = %task.theme,
                    error_kind = err.kind().as_str(),
                    error = %err,
                    attempts,
                    "Evaluation failed"
                );
                TaskCompletion {
                    task_id: task.id.clone(),
                    model: self.model_for(&task),
                    attempts,
                    outcome: CompletionOutcome::Failed { kind: err.kind(), detail: err.to_string() },
                }
            }
        };

        let status = self.persist(completion).await?;
        metrics::counter!("evaluation_tasks_total", "status" => status.as_str()).increment(1);
        metrics::histogram!("evaluation_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            task_id = %task.id,
            status = status.as_str(),
            attempts,
            duration_seconds = started.elapsed().as_secs_f64(),
            "Evaluation finished"
        );
        Ok(Some(status))
    }

    /// Fails a task whose job ended without writing a result, e.g. after a
    /// panic. Returns `None` when the task is not running.
    pub(crate) async fn fail_abandoned(
        &self,
        task_id: &str,
        detail: &str,
    ) -> Result<Option<TaskStatus>, PipelineError> {
        let Some(stored) = self.tasks.find_with_result(task_id).await? else {
            return Ok(None);
        };
        if stored.task.status != TaskStatus::Running {
            return Ok(None);
        }

        let err = PipelineError::Internal(detail.to_string());
        let completion = TaskCompletion {
            task_id: stored.task.id.clone(),
            model: self.model_for(&stored.task),
            attempts: 0,
            outcome: CompletionOutcome::Failed { kind: err.kind(), detail: err.to_string() },
        };
        self.complete_within(completion.clone()).await?;
        self.notify(&completion).await;

        metrics::counter!("evaluation_tasks_total", "status" => TaskStatus::Failed.as_str())
            .increment(1);
        tracing::error!(task_id, error = %err, "Abandoned task marked failed");
        Ok(Some(TaskStatus::Failed))
    }

    async fn evaluate(
        &self,
        task: &Task,
        attempts: &AtomicU32,
    ) -> Result<ScoreOutcome, PipelineError> {
        let bundle = self.source.load(task).await?;
        let context = self.cache.query(&task.theme, &bundle.submission).await?;
        tracing::debug!(task_id = %task.id, snippets = context.len(), "Retrieval context ready");

        let request = Arc::new(ScoreRequest {
            task_id: task.id.clone(),
            theme: task.theme.clone(),
            language: task.language.clone(),
            rubric: bundle.rubric,
            submission: bundle.submission,
            context,
            model: Some(self.model_for(task)),
        });

        self.retry
            .run_guarded("llm_score", &self.llm_breaker, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let scorer = self.scorer.clone();
                let request = request.clone();
                async move { scorer.score(&request).await }
            })
            .await
    }

    /// Writes the result. A failed success write is retried once as a
    /// persistence failure so the task is not left running.
    async fn persist(&self, completion: TaskCompletion) -> Result<TaskStatus, PipelineError> {
        let status = completion.status();
        let notice = completion.clone();
        let err = match self.complete_within(completion).await {
            Ok(()) => {
                self.notify(&notice).await;
                return Ok(status);
            }
            Err(err) => err,
        };

        tracing::error!(task_id = %notice.task_id, error = %err, "Failed to persist task result");
        if status == TaskStatus::Failed {
            return Err(err);
        }

        let fallback = TaskCompletion {
            task_id: notice.task_id.clone(),
            model: notice.model.clone(),
            attempts: notice.attempts,
            outcome: CompletionOutcome::Failed {
                kind: ErrorKind::Persistence,
                detail: err.to_string(),
            },
        };
        match self.complete_within(fallback.clone()).await {
            Ok(()) => {
                self.notify(&fallback).await;
                Ok(TaskStatus::Failed)
            }
            Err(fallback_err) => {
                tracing::error!(
                    task_id = %notice.task_id,
                    error = %fallback_err,
                    "Task left running; it needs reconciliation"
                );
                Err(err)
            }
        }
    }

    async fn complete_within(&self, completion: TaskCompletion) -> Result<(), PipelineError> {
        match tokio::time::timeout(self.persist_timeout, self.tasks.complete(completion)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Persistence(format!(
                "result write timed out after {:?}",
                self.persist_timeout
            ))),
        }
    }

    async fn notify(&self, completion: &TaskCompletion) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(err) = notifier.notify(completion).await {
            tracing::warn!(task_id = %completion.task_id, error = %err, "Result notification failed");
        }
    }

    fn model_for(&self, task: &Task) -> String {
        if task.model.trim().is_empty() {
            self.scorer.default_model().to_string()
        } else {
            task.model.clone()
        }
    }
}
