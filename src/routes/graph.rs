use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::response::{AppError, SuccessResponse};
use crate::routes::required;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/prerequisites", post(add_prerequisite))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrerequisiteRequest {
    subject: String,
    topic: String,
    prerequisite: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrerequisiteResponse {
    subject: String,
    topic: String,
    prerequisite: String,
}

async fn add_prerequisite(
    State(state): State<AppState>,
    Json(payload): Json<PrerequisiteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let subject =
        required(&payload.subject).ok_or_else(|| AppError::validation("subject is required"))?;
    let topic =
        required(&payload.topic).ok_or_else(|| AppError::validation("topic is required"))?;
    let prerequisite = required(&payload.prerequisite)
        .ok_or_else(|| AppError::validation("prerequisite is required"))?;
    if topic.eq_ignore_ascii_case(prerequisite) {
        return Err(AppError::bad_request(
            "a topic cannot be its own prerequisite",
        ));
    }

    state
        .tutor()
        .register_prerequisite(subject, topic, prerequisite)
        .await?;

    Ok(SuccessResponse::ok(PrerequisiteResponse {
        subject: subject.to_string(),
        topic: topic.to_string(),
        prerequisite: prerequisite.to_string(),
    }))
}
