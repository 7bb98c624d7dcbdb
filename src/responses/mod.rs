//! Responses orchestrator.
//!
//! Owns the lifecycle of response records, the conversation
//! resolution policy, and the item append rules around one model
//! invocation. Handlers and the stream engine drive everything
//! through [`ResponsesService`].

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::providers::{CompletionMessage, CompletionRequest, Usage};
use crate::store::{
    ContentPart, Conversation, ConversationRepo, Item, ItemFilter, ItemRepo, ItemRole, NewConversation,
    NewItem, NewResponse, Page, Response, ResponseParams, ResponseRepo, ResponseStatus,
};

/// Clients pass this conversation sentinel (or omit the field) to ask
/// for a fresh conversation.
pub const CLIENT_CREATED_ROOT: &str = "client-created-root";

// ---------------------------------------------------------------------------
// Request shape
// ---------------------------------------------------------------------------

/// `POST /v1/responses` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateResponseRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub store: Option<bool>,
    #[serde(default)]
    pub background: Option<bool>,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Explicit provider selection.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop: Option<Value>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub logit_bias: Option<Value>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Per-request upstream timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub user: Option<String>,
}

impl CreateResponseRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// `store` defaults to true; only an explicit `false` disables
    /// conversation persistence.
    pub fn wants_store(&self) -> bool {
        self.store.unwrap_or(true)
    }

    /// Validate the payload and parse the dynamic `input` shape.
    pub fn validate(&self) -> Result<ResponseInput, ApiError> {
        if self.model.is_empty() {
            return Err(ApiError::InvalidRequest("model is required".into()));
        }
        parse_input(&self.input)
    }

    /// Typed params for the stored record. JSON-valued params are
    /// marshalled to strings; empty `[]`/`{}` become null.
    pub fn to_params(&self) -> ResponseParams {
        ResponseParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            stop: marshal_param(self.stop.as_ref()),
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            seed: self.seed,
            logit_bias: marshal_param(self.logit_bias.as_ref()),
            response_format: marshal_param(self.response_format.as_ref()),
            tools: marshal_param(self.tools.as_ref()),
            tool_choice: marshal_param(self.tool_choice.as_ref()),
            metadata: marshal_param(self.metadata.as_ref()),
            stream: self.wants_stream(),
            background: self.background.unwrap_or(false),
            timeout_secs: self.timeout,
            user: self.user.clone(),
        }
    }

    /// The upstream chat-completions request for this payload.
    pub fn to_completion_request(&self, input: &ResponseInput) -> CompletionRequest {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(CompletionMessage::new("system", prompt.clone()));
        }
        for m in input.messages() {
            messages.push(CompletionMessage::new(m.role.as_str(), m.content));
        }
        CompletionRequest {
            model: self.model.clone(),
            messages,
            stream: self.wants_stream(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            stop: self.stop.clone(),
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            seed: self.seed,
            logit_bias: self.logit_bias.clone(),
            response_format: self.response_format.clone(),
            tools: self.tools.clone(),
            tool_choice: self.tool_choice.clone(),
            user: self.user.clone(),
        }
    }
}

/// Marshal a JSON-typed param to its stored string form; empty
/// arrays/objects and nulls are dropped.
fn marshal_param(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::Null => None,
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        other => Some(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Dynamic input
// ---------------------------------------------------------------------------

/// The request `input` after boundary parsing: plain text or a list
/// of role-tagged messages. Untyped values never travel deeper.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseInput {
    Text(String),
    Messages(Vec<InputMessage>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputMessage {
    pub role: ItemRole,
    pub content: String,
}

impl ResponseInput {
    /// Flatten into role-tagged messages (`Text` becomes one user
    /// message).
    pub fn messages(&self) -> Vec<InputMessage> {
        match self {
            ResponseInput::Text(text) => vec![InputMessage {
                role: ItemRole::User,
                content: text.clone(),
            }],
            ResponseInput::Messages(msgs) => msgs.clone(),
        }
    }
}

/// Parse the dynamic `input` shape: a string, an array of strings, or
/// an array of `{role, content}` messages whose content is a string
/// or an array of text parts.
pub fn parse_input(v: &Value) -> Result<ResponseInput, ApiError> {
    match v {
        Value::String(s) if !s.is_empty() => Ok(ResponseInput::Text(s.clone())),
        Value::Array(entries) if !entries.is_empty() => {
            let mut msgs = Vec::with_capacity(entries.len());
            for entry in entries {
                msgs.push(parse_input_message(entry)?);
            }
            Ok(ResponseInput::Messages(msgs))
        }
        _ => Err(ApiError::InvalidRequest(
            "input must be a non-empty string or array of messages".into(),
        )),
    }
}

fn parse_input_message(v: &Value) -> Result<InputMessage, ApiError> {
    match v {
        Value::String(s) => Ok(InputMessage {
            role: ItemRole::User,
            content: s.clone(),
        }),
        Value::Object(obj) => {
            let role = match obj.get("role").and_then(Value::as_str) {
                Some(r) => ItemRole::parse(r)
                    .ok_or_else(|| ApiError::InvalidRequest(format!("unknown role: {r}")))?,
                None => ItemRole::User,
            };
            let content = match obj.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => {
                    let mut text = String::new();
                    for part in parts {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    text
                }
                _ => {
                    return Err(ApiError::InvalidRequest(
                        "message content must be a string or text parts".into(),
                    ))
                }
            };
            Ok(InputMessage { role, content })
        }
        _ => Err(ApiError::InvalidRequest(
            "input entries must be strings or message objects".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Wire object
// ---------------------------------------------------------------------------

/// The JSON wire shape of a response record.
pub fn response_object(resp: &Response, conversation_public_id: Option<&str>) -> Value {
    let parse = |s: &Option<String>| -> Value {
        s.as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null)
    };
    let mut output = parse(&resp.output);
    if output.is_null() {
        output = json!([]);
    }
    json!({
        "id": resp.public_id,
        "object": "response",
        "created_at": resp.created_at.timestamp(),
        "status": resp.status,
        "model": resp.model,
        "output": output,
        "usage": parse(&resp.usage),
        "error": parse(&resp.error),
        "conversation": conversation_public_id.map(|id| json!({ "id": id })).unwrap_or(Value::Null),
        "previous_response_id": resp.previous_response_id,
        "completed_at": resp.completed_at.map(|t| t.timestamp()),
        "cancelled_at": resp.cancelled_at.map(|t| t.timestamp()),
        "failed_at": resp.failed_at.map(|t| t.timestamp()),
    })
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct ResponsesService {
    conversations: Arc<dyn ConversationRepo>,
    items: Arc<dyn ItemRepo>,
    responses: Arc<dyn ResponseRepo>,
}

impl ResponsesService {
    pub fn new(
        conversations: Arc<dyn ConversationRepo>,
        items: Arc<dyn ItemRepo>,
        responses: Arc<dyn ResponseRepo>,
    ) -> Self {
        Self {
            conversations,
            items,
            responses,
        }
    }

    /// Create a `pending` response record, resolving (and possibly
    /// materialising) its conversation.
    pub async fn create_response_with_previous(
        &self,
        user_id: &str,
        req: &CreateResponseRequest,
    ) -> Result<(Response, Option<Conversation>), ApiError> {
        req.validate()?;
        let conversation = self.resolve_conversation(user_id, req).await?;

        let record = NewResponse {
            public_id: crate::utils::public_id("resp"),
            user_id: user_id.to_string(),
            conversation_id: conversation.as_ref().map(|c| c.id),
            previous_response_id: req.previous_response_id.clone(),
            model: req.model.clone(),
            input: req.input.to_string(),
            system_prompt: req.system_prompt.clone(),
            params: req.to_params(),
        };
        let response = self
            .responses
            .create(record)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok((response, conversation))
    }

    /// Conversation resolution policy:
    /// no conversation when `store=false`; inherit from
    /// `previous_response_id` (same user, must have one); create on
    /// the sentinel/empty value; otherwise load by public id.
    async fn resolve_conversation(
        &self,
        user_id: &str,
        req: &CreateResponseRequest,
    ) -> Result<Option<Conversation>, ApiError> {
        if !req.wants_store() {
            return Ok(None);
        }

        if let Some(prev_id) = &req.previous_response_id {
            let prev = self
                .responses
                .get_by_public_id(prev_id)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?
                .ok_or_else(|| ApiError::NotFound(format!("response {prev_id}")))?;
            if prev.user_id != user_id {
                return Err(ApiError::Unauthorized(
                    "previous response belongs to another user".into(),
                ));
            }
            let conv_id = prev.conversation_id.ok_or_else(|| {
                ApiError::InvalidRequest("previous response has no conversation".into())
            })?;
            let conv = self
                .conversations
                .get_by_id(conv_id)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?
                .ok_or_else(|| {
                    ApiError::Internal(format!("conversation {conv_id} missing for {prev_id}"))
                })?;
            return Ok(Some(conv));
        }

        match req.conversation.as_deref() {
            None | Some("") | Some(CLIENT_CREATED_ROOT) => {
                let conv = self
                    .conversations
                    .create(NewConversation {
                        user_id: user_id.to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
                Ok(Some(conv))
            }
            Some(public_id) => {
                let conv = self
                    .conversations
                    .get_by_public_id(public_id, user_id)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?
                    .ok_or_else(|| ApiError::NotFound(format!("conversation {public_id}")))?;
                Ok(Some(conv))
            }
        }
    }

    // -- lookups -----------------------------------------------------------

    pub async fn get_for_user(
        &self,
        user_id: &str,
        public_id: &str,
    ) -> Result<Response, ApiError> {
        let resp = self
            .responses
            .get_by_public_id(public_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or_else(|| ApiError::NotFound(format!("response {public_id}")))?;
        if resp.user_id != user_id {
            return Err(ApiError::NotFound(format!("response {public_id}")));
        }
        Ok(resp)
    }

    pub async fn conversation_public_id(
        &self,
        resp: &Response,
    ) -> Result<Option<String>, ApiError> {
        match resp.conversation_id {
            Some(id) => Ok(self
                .conversations
                .get_by_id(id)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?
                .map(|c| c.public_id)),
            None => Ok(None),
        }
    }

    /// Items recorded for a response, optionally filtered by role.
    pub async fn get_items_for_response(
        &self,
        user_id: &str,
        response_public_id: &str,
        role: Option<ItemRole>,
        page: Page,
    ) -> Result<Vec<Item>, ApiError> {
        let resp = self.get_for_user(user_id, response_public_id).await?;
        let Some(conversation_id) = resp.conversation_id else {
            return Ok(Vec::new());
        };
        self.items
            .list(
                ItemFilter {
                    conversation_id: Some(conversation_id),
                    response_id: Some(resp.id),
                    role,
                    public_id: None,
                },
                page,
            )
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Resolve an item public id to its internal id (pagination
    /// cursors arrive as public ids).
    pub async fn resolve_item_cursor(
        &self,
        conversation_id: i64,
        public_id: &str,
    ) -> Result<Option<i64>, ApiError> {
        let items = self
            .items
            .list(
                ItemFilter {
                    conversation_id: Some(conversation_id),
                    public_id: Some(public_id.to_string()),
                    ..Default::default()
                },
                Page {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(items.first().map(|i| i.id))
    }

    /// Every item in a response's conversation, in logical order.
    pub async fn list_conversation_items(
        &self,
        conversation_id: i64,
        page: Page,
    ) -> Result<Vec<Item>, ApiError> {
        self.items
            .list(
                ItemFilter {
                    conversation_id: Some(conversation_id),
                    ..Default::default()
                },
                page,
            )
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    // -- mutation ----------------------------------------------------------

    /// Append items to the response's conversation; items naming a
    /// different conversation are rejected.
    pub async fn create_items_for_response(
        &self,
        resp: &Response,
        items: Vec<NewItem>,
    ) -> Result<Vec<Item>, ApiError> {
        let Some(conversation_id) = resp.conversation_id else {
            return Err(ApiError::Conflict(format!(
                "response {} has no conversation",
                resp.public_id
            )));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if item.conversation_id != conversation_id {
                return Err(ApiError::Conflict(
                    "item conversation does not match the response".into(),
                ));
            }
            out.push(
                self.items
                    .append(item)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?,
            );
        }
        Ok(out)
    }

    /// Append the request's user messages to the conversation, linked
    /// to the response.
    pub async fn append_input_items(
        &self,
        resp: &Response,
        conversation: &Conversation,
        input: &ResponseInput,
    ) -> Result<Vec<Item>, ApiError> {
        let items = input
            .messages()
            .into_iter()
            .map(|m| {
                NewItem::message(
                    conversation.id,
                    Some(resp.id),
                    m.role,
                    vec![ContentPart::InputText { text: m.content }],
                )
            })
            .collect();
        self.create_items_for_response(resp, items).await
    }

    pub async fn update_status(
        &self,
        id: i64,
        status: ResponseStatus,
    ) -> Result<Response, ApiError> {
        self.responses
            .update_status(id, status)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Store the output parts; an empty array stores null.
    pub async fn update_output(&self, id: i64, output: &Value) -> Result<(), ApiError> {
        let encoded = match output {
            Value::Array(a) if a.is_empty() => None,
            Value::Null => None,
            other => Some(other.to_string()),
        };
        self.responses
            .set_output(id, encoded)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    pub async fn update_usage(&self, id: i64, usage: Option<&Usage>) -> Result<(), ApiError> {
        let encoded = usage
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.responses
            .set_usage(id, encoded)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Record a failure payload; the response transitions to `failed`.
    pub async fn update_error(&self, id: i64, error: &ApiError) -> Result<(), ApiError> {
        self.responses
            .set_error(id, Some(error.record_payload()))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// `POST /responses/{id}/cancel`: record the cancellation. An
    /// in-flight stream for this response keeps running; client
    /// disconnect is what tears streams down.
    pub async fn cancel(&self, user_id: &str, public_id: &str) -> Result<Response, ApiError> {
        let resp = self.get_for_user(user_id, public_id).await?;
        self.update_status(resp.id, ResponseStatus::Cancelled).await
    }

    pub async fn delete(&self, user_id: &str, public_id: &str) -> Result<(), ApiError> {
        let resp = self.get_for_user(user_id, public_id).await?;
        self.responses
            .delete(resp.id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn service() -> ResponsesService {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        ResponsesService::new(store.clone(), store.clone(), store)
    }

    fn request(input: Value) -> CreateResponseRequest {
        CreateResponseRequest {
            model: "jan-v1-4b".into(),
            input,
            ..Default::default()
        }
    }

    #[test]
    fn input_parses_all_shapes() {
        assert_eq!(
            parse_input(&json!("Hi")).unwrap(),
            ResponseInput::Text("Hi".into())
        );
        assert_eq!(
            parse_input(&json!(["a", "b"])).unwrap(),
            ResponseInput::Messages(vec![
                InputMessage { role: ItemRole::User, content: "a".into() },
                InputMessage { role: ItemRole::User, content: "b".into() },
            ])
        );
        let msgs = parse_input(&json!([
            { "role": "system", "content": "be brief" },
            { "role": "user", "content": [{ "type": "input_text", "text": "Hi" }] },
        ]))
        .unwrap();
        assert_eq!(
            msgs,
            ResponseInput::Messages(vec![
                InputMessage { role: ItemRole::System, content: "be brief".into() },
                InputMessage { role: ItemRole::User, content: "Hi".into() },
            ])
        );

        assert!(parse_input(&json!("")).is_err());
        assert!(parse_input(&json!([])).is_err());
        assert!(parse_input(&json!(42)).is_err());
        assert!(parse_input(&json!([{ "role": "alien", "content": "x" }])).is_err());
    }

    #[test]
    fn params_marshal_empty_collections_to_null() {
        let req = CreateResponseRequest {
            stop: Some(json!([])),
            logit_bias: Some(json!({})),
            tools: Some(json!([{ "type": "function" }])),
            metadata: Some(json!({ "k": "v" })),
            ..request(json!("Hi"))
        };
        let params = req.to_params();
        assert_eq!(params.stop, None);
        assert_eq!(params.logit_bias, None);
        assert_eq!(params.tools.as_deref(), Some("[{\"type\":\"function\"}]"));
        assert_eq!(params.metadata.as_deref(), Some("{\"k\":\"v\"}"));
    }

    #[test]
    fn completion_request_includes_system_prompt_first() {
        let req = CreateResponseRequest {
            system_prompt: Some("be brief".into()),
            ..request(json!("Hi"))
        };
        let input = req.validate().unwrap();
        let completion = req.to_completion_request(&input);
        assert_eq!(completion.messages.len(), 2);
        assert_eq!(completion.messages[0].role, "system");
        assert_eq!(completion.messages[1].content, "Hi");
    }

    #[tokio::test]
    async fn create_materialises_a_conversation_by_default() {
        let svc = service();
        let (resp, conv) = svc
            .create_response_with_previous("user-1", &request(json!("Hi")))
            .await
            .unwrap();
        let conv = conv.unwrap();
        assert!(resp.public_id.starts_with("resp_"));
        assert_eq!(resp.public_id.len(), 5 + 42);
        assert_eq!(resp.status, ResponseStatus::Pending);
        assert_eq!(resp.conversation_id, Some(conv.id));
        assert_eq!(conv.user_id, "user-1");
    }

    #[tokio::test]
    async fn store_false_skips_conversation() {
        let svc = service();
        let req = CreateResponseRequest {
            store: Some(false),
            ..request(json!("Hi"))
        };
        let (resp, conv) = svc
            .create_response_with_previous("user-1", &req)
            .await
            .unwrap();
        assert!(conv.is_none());
        assert!(resp.conversation_id.is_none());
    }

    #[tokio::test]
    async fn sentinel_conversation_creates_fresh_one() {
        let svc = service();
        let req = CreateResponseRequest {
            conversation: Some(CLIENT_CREATED_ROOT.into()),
            ..request(json!("Hi"))
        };
        let (_, conv) = svc
            .create_response_with_previous("user-1", &req)
            .await
            .unwrap();
        assert!(conv.is_some());
    }

    #[tokio::test]
    async fn named_conversation_must_exist() {
        let svc = service();
        let req = CreateResponseRequest {
            conversation: Some("conv_missing".into()),
            ..request(json!("Hi"))
        };
        let err = svc
            .create_response_with_previous("user-1", &req)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn previous_response_inherits_conversation() {
        let svc = service();
        let (first, conv) = svc
            .create_response_with_previous("user-1", &request(json!("Hi")))
            .await
            .unwrap();
        let conv = conv.unwrap();

        let req = CreateResponseRequest {
            previous_response_id: Some(first.public_id.clone()),
            ..request(json!("again"))
        };
        let (second, second_conv) = svc
            .create_response_with_previous("user-1", &req)
            .await
            .unwrap();
        assert_eq!(second.conversation_id, Some(conv.id));
        assert_eq!(second_conv.unwrap().id, conv.id);
    }

    #[tokio::test]
    async fn previous_response_of_other_user_is_unauthorized() {
        let svc = service();
        let (first, _) = svc
            .create_response_with_previous("user-1", &request(json!("Hi")))
            .await
            .unwrap();

        let req = CreateResponseRequest {
            previous_response_id: Some(first.public_id.clone()),
            ..request(json!("steal"))
        };
        let err = svc
            .create_response_with_previous("user-2", &req)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn items_append_and_filter() {
        let svc = service();
        let req = request(json!([
            { "role": "user", "content": "Hi" },
            { "role": "user", "content": "there" },
        ]));
        let (resp, conv) = svc
            .create_response_with_previous("user-1", &req)
            .await
            .unwrap();
        let conv = conv.unwrap();
        let input = req.validate().unwrap();
        let items = svc.append_input_items(&resp, &conv, &input).await.unwrap();
        assert_eq!(items.len(), 2);

        let listed = svc
            .get_items_for_response("user-1", &resp.public_id, Some(ItemRole::User), Page::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed[0].content,
            vec![ContentPart::InputText { text: "Hi".into() }]
        );
    }

    #[tokio::test]
    async fn items_for_foreign_conversation_conflict() {
        let svc = service();
        let (resp, _) = svc
            .create_response_with_previous("user-1", &request(json!("Hi")))
            .await
            .unwrap();
        let err = svc
            .create_items_for_response(
                &resp,
                vec![NewItem::message(
                    99_999,
                    Some(resp.id),
                    ItemRole::User,
                    vec![ContentPart::InputText { text: "x".into() }],
                )],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_is_recorded() {
        let svc = service();
        let (resp, _) = svc
            .create_response_with_previous("user-1", &request(json!("Hi")))
            .await
            .unwrap();
        let cancelled = svc.cancel("user-1", &resp.public_id).await.unwrap();
        assert_eq!(cancelled.status, ResponseStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        // Foreign users cannot see (or cancel) the response.
        let err = svc.cancel("user-2", &resp.public_id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn response_object_wire_shape() {
        let resp = Response {
            id: 1,
            public_id: "resp_abc".into(),
            user_id: "user-1".into(),
            conversation_id: Some(7),
            previous_response_id: None,
            model: "jan-v1-4b".into(),
            status: ResponseStatus::Completed,
            input: "\"Hi\"".into(),
            system_prompt: None,
            params: Default::default(),
            output: Some("[{\"type\":\"message\"}]".into()),
            usage: Some("{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}".into()),
            error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            cancelled_at: None,
            failed_at: None,
        };
        let obj = response_object(&resp, Some("conv_xyz"));
        assert_eq!(obj["id"], "resp_abc");
        assert_eq!(obj["status"], "completed");
        assert_eq!(obj["output"][0]["type"], "message");
        assert_eq!(obj["usage"]["total_tokens"], 3);
        assert_eq!(obj["conversation"]["id"], "conv_xyz");
        assert_eq!(obj["error"], Value::Null);
    }
}
