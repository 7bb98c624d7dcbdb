//! The `/v1/responses` surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt as _;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::providers::{parse_token_usage, InferenceProvider};
use crate::responses::{response_object, CreateResponseRequest, ResponsesService};
use crate::router::ProviderSelection;
use crate::store::{Item, ItemRole, Order, Page, ResponseStatus};
use crate::stream::accumulator::CompletedCall;
use crate::stream::{output_parts, typed_events, EngineEvent, ResponseStreamSession, NON_STREAM_DEADLINE};

use super::super::auth::Principal;
use super::super::AppState;

pub(crate) async fn create_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateResponseRequest>,
) -> Result<Response, ApiError> {
    let input = req.validate()?;

    let selection = ProviderSelection {
        provider_id: req.provider.clone(),
        model_id: Some(req.model.clone()),
        organization_id: principal.organization_id.clone(),
        project_ids: principal.project_ids.clone(),
        ..Default::default()
    };
    let provider = state.router.resolve(&selection).await?;

    let (response, conversation) = state
        .service
        .create_response_with_previous(&principal.user_id, &req)
        .await?;

    // User messages land in the conversation before any upstream
    // chunk is forwarded.
    if let Some(conv) = &conversation {
        state
            .service
            .append_input_items(&response, conv, &input)
            .await?;
    }

    let completion_req = req.to_completion_request(&input);

    if req.wants_stream() {
        let upstream = match provider.create_completion_stream(&completion_req).await {
            Ok(s) => s,
            Err(e) => {
                let api = ApiError::UpstreamFailed(e.to_string());
                state.service.update_error(response.id, &api).await?;
                return Err(api);
            }
        };

        let session = ResponseStreamSession {
            service: state.service.clone(),
            response,
            conversation,
            shutdown: state.shutdown.clone(),
            in_flight: state.in_flight.guard(),
        };
        let events = typed_events(upstream, session).map(|ev| -> Result<Event, Infallible> {
            Ok(match ev {
                EngineEvent::Typed(t) => Event::default().event(t.kind).data(t.data.to_string()),
                EngineEvent::Done => Event::default().data("[DONE]"),
            })
        });
        return Ok(Sse::new(events).into_response());
    }

    blocking_completion(
        state.service.clone(),
        provider,
        completion_req,
        response,
        conversation,
    )
    .await
}

/// Non-streaming path: one upstream call under the 60 s deadline,
/// then persistence and the final JSON body.
async fn blocking_completion(
    service: Arc<ResponsesService>,
    provider: Arc<dyn InferenceProvider>,
    completion_req: crate::providers::CompletionRequest,
    response: crate::store::Response,
    conversation: Option<crate::store::Conversation>,
) -> Result<Response, ApiError> {
    service
        .update_status(response.id, ResponseStatus::Running)
        .await?;

    let body = match tokio::time::timeout(
        NON_STREAM_DEADLINE,
        provider.create_completion(&completion_req),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            let api = ApiError::UpstreamFailed(e.to_string());
            service.update_error(response.id, &api).await?;
            return Err(api);
        }
        Err(_) => {
            let api = ApiError::UpstreamTimeout(NON_STREAM_DEADLINE.as_secs());
            service.update_error(response.id, &api).await?;
            return Err(api);
        }
    };

    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let calls = completed_calls_of(&body);
    let usage = parse_token_usage(&body);

    if let Some(conv) = &conversation {
        let mut items = Vec::new();
        if !text.is_empty() {
            items.push(crate::store::NewItem::message(
                conv.id,
                Some(response.id),
                ItemRole::Assistant,
                vec![crate::store::ContentPart::Text { text: text.clone() }],
            ));
        }
        for call in &calls {
            items.push(crate::store::NewItem::function_call(
                conv.id,
                Some(response.id),
                call.name.clone(),
                call.raw_arguments.clone(),
            ));
        }
        if !items.is_empty() {
            service.create_items_for_response(&response, items).await?;
        }
    }

    service
        .update_output(response.id, &output_parts(&text, &calls))
        .await?;
    service.update_usage(response.id, usage.as_ref()).await?;
    let terminal = service
        .update_status(response.id, ResponseStatus::Completed)
        .await?;

    let conv_public = conversation.as_ref().map(|c| c.public_id.as_str());
    Ok(Json(response_object(&terminal, conv_public)).into_response())
}

/// Tool/function calls reported by a non-streaming completion body.
fn completed_calls_of(body: &serde_json::Value) -> Vec<CompletedCall> {
    let message = &body["choices"][0]["message"];
    let mut out = Vec::new();

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            let name = tc["function"]["name"].as_str().unwrap_or_default();
            let raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
            out.push(CompletedCall {
                id: tc["id"].as_str().map(String::from),
                name: name.to_string(),
                arguments: serde_json::from_str(raw)
                    .unwrap_or_else(|_| json!({ "raw": raw })),
                raw_arguments: raw.to_string(),
            });
        }
    } else if let Some(fc) = message["function_call"].as_object() {
        let name = fc.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let raw = fc
            .get("arguments")
            .and_then(|v| v.as_str())
            .unwrap_or("{}");
        out.push(CompletedCall {
            id: None,
            name: name.to_string(),
            arguments: serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw": raw })),
            raw_arguments: raw.to_string(),
        });
    }

    out
}

pub(crate) async fn get_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(response_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resp = state
        .service
        .get_for_user(&principal.user_id, &response_id)
        .await?;
    let conv_public = state.service.conversation_public_id(&resp).await?;
    Ok(Json(response_object(&resp, conv_public.as_deref())))
}

pub(crate) async fn cancel_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(response_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resp = state.service.cancel(&principal.user_id, &response_id).await?;
    let conv_public = state.service.conversation_public_id(&resp).await?;
    Ok(Json(response_object(&resp, conv_public.as_deref())))
}

pub(crate) async fn delete_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(response_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .service
        .delete(&principal.user_id, &response_id)
        .await?;
    Ok(Json(json!({
        "id": response_id,
        "object": "response",
        "deleted": true,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListItemsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

pub(crate) async fn list_input_items(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(response_id): Path<String>,
    Query(query): Query<ListItemsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let role = match query.role.as_deref() {
        Some(r) => Some(
            ItemRole::parse(r)
                .ok_or_else(|| ApiError::InvalidRequest(format!("unknown role: {r}")))?,
        ),
        None => None,
    };

    let resp = state
        .service
        .get_for_user(&principal.user_id, &response_id)
        .await?;

    // `before` walks backwards, `after` forwards.
    let (cursor_public, order) = match (&query.before, &query.after) {
        (Some(before), _) => (Some(before.clone()), Order::Desc),
        (None, Some(after)) => (Some(after.clone()), Order::Asc),
        (None, None) => (None, Order::Asc),
    };
    let after = match (cursor_public, resp.conversation_id) {
        (Some(public_id), Some(conversation_id)) => state
            .service
            .resolve_item_cursor(conversation_id, &public_id)
            .await?,
        _ => None,
    };

    let page = Page {
        limit: query.limit.unwrap_or(20).min(100),
        after,
        order,
    };
    let items = state
        .service
        .get_items_for_response(&principal.user_id, &response_id, role, page)
        .await?;

    let data: Vec<serde_json::Value> = items.iter().map(item_object).collect();
    Ok(Json(json!({
        "object": "list",
        "data": data,
        "first_id": items.first().map(|i| i.public_id.clone()),
        "last_id": items.last().map(|i| i.public_id.clone()),
        "has_more": items.len() == page.limit,
    })))
}

/// The wire shape of an item: public ids only.
fn item_object(item: &Item) -> serde_json::Value {
    json!({
        "id": item.public_id,
        "object": "item",
        "type": item.item_type,
        "role": item.role,
        "content": item.content,
        "created_at": item.created_at.timestamp(),
    })
}
