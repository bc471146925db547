use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::put;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::response::{AppError, SuccessResponse};
use crate::routes::required;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/:exam_id/topics", put(register_topics))
}

/// `topics` is either a list of names or an object mapping question ids to topics.
#[derive(Debug, Deserialize)]
struct AssessmentTopicsRequest {
    topics: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssessmentTopicsResponse {
    exam_id: String,
    topics: Vec<String>,
}

async fn register_topics(
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
    Json(payload): Json<AssessmentTopicsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let exam_id = required(&exam_id).ok_or_else(|| AppError::validation("examId is required"))?;
    if !(payload.topics.is_array() || payload.topics.is_object()) {
        return Err(AppError::validation(
            "topics must be a list or an object of question topics",
        ));
    }

    let topics = state
        .tutor()
        .register_assessment(exam_id, &payload.topics)
        .await?;

    Ok(SuccessResponse::ok(AssessmentTopicsResponse {
        exam_id: exam_id.to_string(),
        topics,
    }))
}
