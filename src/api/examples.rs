use axum::{extract::State, routing::post, Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::example::{ExamplesDelete, ExamplesDeleted, ExamplesPopulate, ExamplesPopulated};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/populate", post(populate_examples))
        .route("/delete", post(delete_examples))
}

async fn populate_examples(
    State(state): State<AppState>,
    Json(payload): Json<ExamplesPopulate>,
) -> Result<Json<ExamplesPopulated>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (theme, examples) = payload.into_examples();
    let inserted = state.cache().populate(&theme, &examples).await?;
    Ok(Json(ExamplesPopulated { theme, inserted }))
}

async fn delete_examples(
    State(state): State<AppState>,
    Json(payload): Json<ExamplesDelete>,
) -> Result<Json<ExamplesDeleted>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (theme, filter) = payload.into_filter();
    let removed = state.cache().delete(&theme, &filter).await?;
    Ok(Json(ExamplesDeleted { theme, removed }))
}
