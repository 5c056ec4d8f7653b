use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{Task, TaskResult};
use crate::db::types::TaskStatus;
use crate::resilience::ErrorKind;

const TASK_COLUMNS: &str = "id, theme, language, submission_ref, rubric_ref, model, status, created_at,
     started_at, completed_at";

pub(crate) struct CreateTask<'a> {
    pub(crate) id: &'a str,
    pub(crate) theme: &'a str,
    pub(crate) language: &'a str,
    pub(crate) submission_ref: &'a str,
    pub(crate) rubric_ref: &'a str,
    pub(crate) model: &'a str,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) struct CompleteTask<'a> {
    pub(crate) task_id: &'a str,
    pub(crate) status: TaskStatus,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: serde_json::Value,
    pub(crate) model: &'a str,
    pub(crate) error_kind: Option<ErrorKind>,
    pub(crate) error_detail: Option<&'a str>,
    pub(crate) attempts: i32,
    pub(crate) completed_at: PrimitiveDateTime,
}

pub(crate) async fn create(pool: &PgPool, params: CreateTask<'_>) -> Result<Task, sqlx::Error> {
    let query = format!(
        "INSERT INTO evaluation_tasks (
            id, theme, language, submission_ref, rubric_ref, model, status, created_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        RETURNING {TASK_COLUMNS}"
    );

    sqlx::query_as::<_, Task>(&query)
        .bind(params.id)
        .bind(params.theme)
        .bind(params.language)
        .bind(params.submission_ref)
        .bind(params.rubric_ref)
        .bind(params.model)
        .bind(TaskStatus::Pending)
        .bind(params.created_at)
        .fetch_one(pool)
        .await
}

/// Moves a pending task to running. Returns `None` when the task is unknown
/// or already claimed, so a task is never processed twice.
pub(crate) async fn mark_running(
    pool: &PgPool,
    task_id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<Task>, sqlx::Error> {
    let query = format!(
        "UPDATE evaluation_tasks
         SET status = $1, started_at = $2
         WHERE id = $3 AND status = $4
         RETURNING {TASK_COLUMNS}"
    );

    sqlx::query_as::<_, Task>(&query)
        .bind(TaskStatus::Running)
        .bind(now)
        .bind(task_id)
        .bind(TaskStatus::Pending)
        .fetch_optional(pool)
        .await
}

/// Writes the terminal status and the single result row in one transaction.
/// Returns `false` if the task was not running (already completed).
pub(crate) async fn complete(pool: &PgPool, params: CompleteTask<'_>) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE evaluation_tasks
         SET status = $1, completed_at = $2
         WHERE id = $3 AND status = $4",
    )
    .bind(params.status)
    .bind(params.completed_at)
    .bind(params.task_id)
    .bind(TaskStatus::Running)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO evaluation_results (
            task_id, score, feedback, model, error_kind, error_detail, attempts, created_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(params.task_id)
    .bind(params.score)
    .bind(Json(params.feedback))
    .bind(params.model)
    .bind(params.error_kind)
    .bind(params.error_detail)
    .bind(params.attempts)
    .bind(params.completed_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

pub(crate) async fn find_by_id(pool: &PgPool, task_id: &str) -> Result<Option<Task>, sqlx::Error> {
    let query = format!("SELECT {TASK_COLUMNS} FROM evaluation_tasks WHERE id = $1");
    sqlx::query_as::<_, Task>(&query).bind(task_id).fetch_optional(pool).await
}

pub(crate) async fn find_result(
    pool: &PgPool,
    task_id: &str,
) -> Result<Option<TaskResult>, sqlx::Error> {
    sqlx::query_as::<_, TaskResult>(
        "SELECT task_id, score, feedback, model, error_kind, error_detail, attempts, created_at
         FROM evaluation_results
         WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
}
