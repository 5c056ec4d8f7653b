use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::evaluation::{EvaluationAccepted, EvaluationCreate, EvaluationResponse};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_evaluation))
        .route("/:task_id", get(get_evaluation))
}

async fn submit_evaluation(
    State(state): State<AppState>,
    Json(payload): Json<EvaluationCreate>,
) -> Result<(StatusCode, Json<EvaluationAccepted>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let dispatched = state.dispatcher().dispatch(payload.into_request()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EvaluationAccepted { task_id: dispatched.task_id, status: dispatched.status }),
    ))
}

async fn get_evaluation(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<EvaluationResponse>, ApiError> {
    let stored = state
        .tasks()
        .find_with_result(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Evaluation task {task_id} not found")))?;
    Ok(Json(EvaluationResponse::from_db(stored)))
}
