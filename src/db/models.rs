use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::TaskStatus;
use crate::resilience::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Task {
    pub(crate) id: String,
    pub(crate) theme: String,
    pub(crate) language: String,
    pub(crate) submission_ref: String,
    pub(crate) rubric_ref: String,
    pub(crate) model: String,
    pub(crate) status: TaskStatus,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) started_at: Option<PrimitiveDateTime>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct TaskResult {
    pub(crate) task_id: String,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: Json<serde_json::Value>,
    pub(crate) model: String,
    pub(crate) error_kind: Option<ErrorKind>,
    pub(crate) error_detail: Option<String>,
    pub(crate) attempts: i32,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct RetrievalExample {
    pub(crate) theme: String,
    pub(crate) id: String,
    pub(crate) language: Option<String>,
    pub(crate) code: String,
    pub(crate) embedding: Option<Json<Vec<f32>>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}
