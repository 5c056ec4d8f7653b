use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::core::time::primitive_now_utc;
use crate::db::models::{RetrievalExample, Task, TaskResult};
use crate::db::types::TaskStatus;
use crate::repositories::{examples, health, tasks};
use crate::resilience::{ErrorKind, PipelineError};

#[derive(Debug, Clone)]
pub(crate) struct NewTask {
    pub(crate) id: String,
    pub(crate) theme: String,
    pub(crate) language: String,
    pub(crate) submission_ref: String,
    pub(crate) rubric_ref: String,
    pub(crate) model: String,
}

#[derive(Debug, Clone)]
pub(crate) enum CompletionOutcome {
    Succeeded { score: f64, feedback: Value },
    Failed { kind: ErrorKind, detail: String },
}

#[derive(Debug, Clone)]
pub(crate) struct TaskCompletion {
    pub(crate) task_id: String,
    pub(crate) model: String,
    pub(crate) attempts: u32,
    pub(crate) outcome: CompletionOutcome,
}

impl TaskCompletion {
    pub(crate) fn status(&self) -> TaskStatus {
        match self.outcome {
            CompletionOutcome::Succeeded { .. } => TaskStatus::Succeeded,
            CompletionOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TaskWithResult {
    pub(crate) task: Task,
    pub(crate) result: Option<TaskResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NewExample {
    pub(crate) id: String,
    pub(crate) language: Option<String>,
    pub(crate) code: String,
    pub(crate) embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ExampleFilter {
    pub(crate) example_id: Option<String>,
    pub(crate) language: Option<String>,
}

impl ExampleFilter {
    pub(crate) fn matches(&self, id: &str, language: Option<&str>) -> bool {
        let id_matches = self.example_id.as_deref().map_or(true, |wanted| wanted == id);
        let language_matches =
            self.language.as_deref().map_or(true, |wanted| Some(wanted) == language);
        id_matches && language_matches
    }
}

/// Durable task bookkeeping. Acknowledged writes are assumed durable.
#[async_trait]
pub(crate) trait TaskStore: Send + Sync {
    async fn create_task(&self, task: NewTask) -> Result<Task, PipelineError>;

    /// Claims a pending task. `None` means it is unknown or already claimed.
    async fn mark_running(&self, task_id: &str) -> Result<Option<Task>, PipelineError>;

    /// Records the terminal status together with the task's only result.
    async fn complete(&self, completion: TaskCompletion) -> Result<(), PipelineError>;

    async fn find_with_result(&self, task_id: &str)
        -> Result<Option<TaskWithResult>, PipelineError>;

    async fn ping(&self) -> Result<(), PipelineError>;
}

#[async_trait]
pub(crate) trait ExampleStore: Send + Sync {
    /// Returns how many of `examples` were not stored before.
    async fn upsert(&self, theme: &str, examples: &[NewExample]) -> Result<u64, PipelineError>;

    async fn remove(&self, theme: &str, filter: &ExampleFilter) -> Result<u64, PipelineError>;

    async fn list(&self, theme: &str) -> Result<Vec<RetrievalExample>, PipelineError>;
}

#[derive(Clone)]
pub(crate) struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<Task, PipelineError> {
        tasks::create(
            &self.pool,
            tasks::CreateTask {
                id: &task.id,
                theme: &task.theme,
                language: &task.language,
                submission_ref: &task.submission_ref,
                rubric_ref: &task.rubric_ref,
                model: &task.model,
                created_at: primitive_now_utc(),
            },
        )
        .await
        .map_err(PipelineError::persistence)
    }

    async fn mark_running(&self, task_id: &str) -> Result<Option<Task>, PipelineError> {
        tasks::mark_running(&self.pool, task_id, primitive_now_utc())
            .await
            .map_err(PipelineError::persistence)
    }

    async fn complete(&self, completion: TaskCompletion) -> Result<(), PipelineError> {
        let status = completion.status();
        let (score, feedback, error_kind, error_detail) = match &completion.outcome {
            CompletionOutcome::Succeeded { score, feedback } => {
                (Some(*score), feedback.clone(), None, None)
            }
            CompletionOutcome::Failed { kind, detail } => {
                (None, Value::Null, Some(*kind), Some(detail.as_str()))
            }
        };

        let written = tasks::complete(
            &self.pool,
            tasks::CompleteTask {
                task_id: &completion.task_id,
                status,
                score,
                feedback,
                model: &completion.model,
                error_kind,
                error_detail,
                attempts: i32::try_from(completion.attempts).unwrap_or(i32::MAX),
                completed_at: primitive_now_utc(),
            },
        )
        .await
        .map_err(PipelineError::persistence)?;

        if !written {
            return Err(PipelineError::Persistence(format!(
                "task {} is not running",
                completion.task_id
            )));
        }
        Ok(())
    }

    async fn find_with_result(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskWithResult>, PipelineError> {
        let Some(task) =
            tasks::find_by_id(&self.pool, task_id).await.map_err(PipelineError::persistence)?
        else {
            return Ok(None);
        };
        let result =
            tasks::find_result(&self.pool, task_id).await.map_err(PipelineError::persistence)?;
        Ok(Some(TaskWithResult { task, result }))
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        health::ping(&self.pool).await.map_err(classify_sqlx)
    }
}

#[derive(Clone)]
pub(crate) struct PgExampleStore {
    pool: PgPool,
}

impl PgExampleStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExampleStore for PgExampleStore {
    async fn upsert(&self, theme: &str, items: &[NewExample]) -> Result<u64, PipelineError> {
        let rows = items
            .iter()
            .map(|item| examples::UpsertExample {
                id: &item.id,
                language: item.language.as_deref(),
                code: &item.code,
                embedding: item.embedding.as_deref(),
            })
            .collect::<Vec<_>>();

        examples::upsert(&self.pool, theme, &rows, primitive_now_utc())
            .await
            .map_err(PipelineError::persistence)
    }

    async fn remove(&self, theme: &str, filter: &ExampleFilter) -> Result<u64, PipelineError> {
        examples::delete(
            &self.pool,
            theme,
            filter.example_id.as_deref(),
            filter.language.as_deref(),
        )
        .await
        .map_err(PipelineError::persistence)
    }

    async fn list(&self, theme: &str) -> Result<Vec<RetrievalExample>, PipelineError> {
        examples::list_by_theme(&self.pool, theme).await.map_err(classify_sqlx)
    }
}

/// Connection-level failures are transient so the retrieval breaker sees them.
fn classify_sqlx(err: sqlx::Error) -> PipelineError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            PipelineError::transient(err)
        }
        other => PipelineError::persistence(other),
    }
}
