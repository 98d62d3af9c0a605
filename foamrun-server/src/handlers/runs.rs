use crate::errors::AppResult;
use crate::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

/// `GET /api/runs`: the journal, newest first.
pub async fn list_runs(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let runs = state.journal.list_runs().await?;
    Ok(Json(json!({ "runs": runs })))
}
