//! `GET /healthz` — liveness plus cache reachability.

use axum::{extract::State, Json};
use serde_json::json;

use super::super::AppState;

pub(crate) async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = match state.cache.health_check().await {
        Ok(()) => "ok",
        Err(_) => "unreachable",
    };
    Json(json!({ "status": "ok", "cache": cache }))
}
