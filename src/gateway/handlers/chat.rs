//! `POST /v1/chat/completions` — passthrough chat.

use axum::{
    body::Body,
    extract::{Extension, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::ApiError;
use crate::providers::CompletionRequest;
use crate::router::ProviderSelection;
use crate::stream::{passthrough, NON_STREAM_DEADLINE};

use super::super::auth::Principal;
use super::super::AppState;

pub(crate) async fn chat_completions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    if req.model.is_empty() {
        return Err(ApiError::InvalidRequest("model is required".into()));
    }
    if req.messages.is_empty() {
        return Err(ApiError::InvalidRequest(
            "messages must not be empty".into(),
        ));
    }

    let selection = ProviderSelection {
        model_id: Some(req.model.clone()),
        organization_id: principal.organization_id.clone(),
        project_ids: principal.project_ids.clone(),
        ..Default::default()
    };
    let provider = state.router.resolve(&selection).await?;

    if req.stream {
        let upstream = provider
            .create_completion_stream(&req)
            .await
            .map_err(|e| ApiError::UpstreamFailed(e.to_string()))?;

        let body = Body::from_stream(passthrough(
            upstream,
            state.shutdown.clone(),
            state.in_flight.guard(),
        ));
        return Ok(Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(body)
            .map_err(|e| ApiError::Internal(e.to_string()))?);
    }

    let upstream = provider.create_completion(&req);
    match tokio::time::timeout(NON_STREAM_DEADLINE, upstream).await {
        Ok(Ok(body)) => Ok(Json(body).into_response()),
        Ok(Err(e)) => Err(ApiError::UpstreamFailed(e.to_string())),
        Err(_) => Err(ApiError::UpstreamTimeout(NON_STREAM_DEADLINE.as_secs())),
    }
}
