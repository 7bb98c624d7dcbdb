//! Model catalogue and control-plane endpoints.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde_json::json;

use crate::control::CreateModelSpec;
use crate::error::ApiError;
use crate::router::ProviderSelection;

use super::super::auth::Principal;
use super::super::AppState;

/// `GET /v1/models` — the aggregated catalogue for the caller's scope.
pub(crate) async fn list_models(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let selection = ProviderSelection {
        organization_id: principal.organization_id.clone(),
        project_ids: principal.project_ids.clone(),
        ..Default::default()
    };
    let models = state.router.get_models(&selection).await?;
    Ok(Json(json!({
        "object": "list",
        "data": models,
    })))
}

/// `GET /v1/models/status` — orchestrator and cluster health.
pub(crate) async fn models_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kubernetes = state.control.kubernetes_status().await?;
    let cluster = state.control.cluster_status().await?;
    Ok(Json(json!({
        "kubernetes": kubernetes,
        "cluster": cluster,
    })))
}

/// `GET /v1/models/gpus` — GPU nodes visible to the orchestrator.
pub(crate) async fn gpu_resources(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let gpus = state.control.gpu_resources().await?;
    Ok(Json(json!({ "object": "list", "data": gpus })))
}

/// `POST /v1/models` — deploy a model workload.
pub(crate) async fn create_model(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(mut spec): Json<CreateModelSpec>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if spec.organization_id.is_none() {
        spec.organization_id = principal.organization_id.clone();
    }
    let deployment = state.control.create_model(&spec).await?;
    Ok(Json(serde_json::to_value(deployment).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

/// `DELETE /v1/models/{model}` — remove a model workload.
pub(crate) async fn delete_model(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(model_name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .control
        .delete_model(&model_name, principal.organization_id.as_deref())
        .await?;
    Ok(Json(json!({
        "id": model_name,
        "object": "model",
        "deleted": true,
    })))
}
