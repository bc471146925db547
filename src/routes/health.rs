use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(root))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    start_time: String,
    uptime: u64,
    timestamp: String,
}

async fn root(State(state): State<AppState>) -> Json<HealthResponse> {
    let started: DateTime<Utc> = state.started_at_system().into();
    Json(HealthResponse {
        status: "ok",
        store: state.backend(),
        start_time: started.to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: state.uptime_seconds(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}
