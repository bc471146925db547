use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::response::{AppError, SuccessResponse};
use crate::routes::required;
use crate::state::AppState;
use crate::tutor::{AnswerSubmission, Difficulty};

const DEFAULT_LOG_LIMIT: usize = 20;
const MAX_LOG_LIMIT: usize = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start-session", post(start_session))
        .route("/submit-answer", post(submit_answer))
        .route("/end-session", post(end_session))
        .route("/logs/:student_id", get(logs))
        .route("/progress/:student_id/:subject", get(progress))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest {
    student_id: String,
    subject: String,
    #[serde(default)]
    exam_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitAnswerRequest {
    session_id: String,
    student_id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    difficulty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionRequest {
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionResponse {
    session_id: String,
    ended: bool,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let student_id = required(&payload.student_id)
        .ok_or_else(|| AppError::validation("studentId is required"))?;
    let subject =
        required(&payload.subject).ok_or_else(|| AppError::validation("subject is required"))?;

    let start = state
        .tutor()
        .start_session(student_id, subject, payload.exam_id.as_deref())
        .await?;

    Ok(SuccessResponse::ok(start))
}

async fn submit_answer(
    State(state): State<AppState>,
    Json(payload): Json<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = required(&payload.session_id)
        .ok_or_else(|| AppError::validation("sessionId is required"))?;

    let submission = AnswerSubmission {
        session_id: session_id.to_string(),
        student_id: payload.student_id.trim().to_string(),
        question: payload.question,
        answer: payload.answer,
        topic: payload.topic,
        difficulty: Difficulty::parse(&payload.difficulty),
    };

    let outcome = state.tutor().submit_answer(submission).await?;
    Ok(SuccessResponse::ok(outcome))
}

async fn end_session(
    State(state): State<AppState>,
    Json(payload): Json<EndSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = required(&payload.session_id)
        .ok_or_else(|| AppError::validation("sessionId is required"))?;
    let ended = state.tutor().end_session(session_id);

    Ok(SuccessResponse::ok(EndSessionResponse {
        session_id: session_id.to_string(),
        ended,
    }))
}

async fn logs(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let steps = state
        .tutor()
        .recent_learning_steps(student_id.trim(), limit)
        .await?;

    Ok(SuccessResponse::ok(steps))
}

async fn progress(
    State(state): State<AppState>,
    Path((student_id, subject)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let progress = state
        .tutor()
        .progress(student_id.trim(), subject.trim())
        .await?;

    Ok(SuccessResponse::ok(progress))
}
