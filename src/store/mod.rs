//! Durable entities and their repository interfaces.
//!
//! Conversations own an append-only sequence of items; responses
//! record single model invocations and may reference a conversation.
//! The gateway core only ever talks to the repository traits; the
//! SQLite implementation lives in [`sqlite`].

pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// An ordered collection of items owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    /// Opaque public id, prefix `conv_`.
    pub public_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub is_private: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub user_id: String,
    pub title: Option<String>,
    pub is_private: bool,
    pub metadata: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Message,
    FunctionCall,
    FunctionCallResult,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Message => "message",
            ItemType::FunctionCall => "function_call",
            ItemType::FunctionCallResult => "function_call_result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(ItemType::Message),
            "function_call" => Some(ItemType::FunctionCall),
            "function_call_result" => Some(ItemType::FunctionCallResult),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ItemRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemRole::System => "system",
            ItemRole::User => "user",
            ItemRole::Assistant => "assistant",
            ItemRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(ItemRole::System),
            "user" => Some(ItemRole::User),
            "assistant" => Some(ItemRole::Assistant),
            "tool" => Some(ItemRole::Tool),
            _ => None,
        }
    }
}

/// One structured piece of item content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    InputText { text: String },
    Image { url: String },
    File { file_id: String },
    FunctionCallResult { call_id: String, output: String },
}

/// A message, function call, or function-call result within a
/// conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    /// Opaque public id, prefix `msg_`.
    pub public_id: String,
    pub conversation_id: i64,
    /// The response that produced this item, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<i64>,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ItemRole>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Function-call payload, set for `function_call*` items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_arguments: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for appending an item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub conversation_id: i64,
    pub response_id: Option<i64>,
    pub item_type: ItemType,
    pub role: Option<ItemRole>,
    pub content: Vec<ContentPart>,
    pub function_name: Option<String>,
    pub function_arguments: Option<String>,
}

impl NewItem {
    /// A plain message item.
    pub fn message(
        conversation_id: i64,
        response_id: Option<i64>,
        role: ItemRole,
        content: Vec<ContentPart>,
    ) -> Self {
        Self {
            conversation_id,
            response_id,
            item_type: ItemType::Message,
            role: Some(role),
            content,
            function_name: None,
            function_arguments: None,
        }
    }

    /// A function-call item produced by the assistant.
    pub fn function_call(
        conversation_id: i64,
        response_id: Option<i64>,
        name: String,
        arguments: String,
    ) -> Self {
        Self {
            conversation_id,
            response_id,
            item_type: ItemType::FunctionCall,
            role: Some(ItemRole::Assistant),
            content: Vec::new(),
            function_name: Some(name),
            function_arguments: Some(arguments),
        }
    }

    /// An item either carries role+content or a function-call payload.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.item_type {
            ItemType::Message => {
                if self.role.is_none() || self.content.is_empty() {
                    anyhow::bail!("message items need a role and at least one content part");
                }
            }
            ItemType::FunctionCall | ItemType::FunctionCallResult => {
                if self.function_name.is_none() && self.function_arguments.is_none() {
                    anyhow::bail!("function-call items need a function payload");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Response lifecycle: `Pending → Running → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseStatus::Completed | ResponseStatus::Failed | ResponseStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Running => "running",
            ResponseStatus::Completed => "completed",
            ResponseStatus::Failed => "failed",
            ResponseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResponseStatus::Pending),
            "running" => Some(ResponseStatus::Running),
            "completed" => Some(ResponseStatus::Completed),
            "failed" => Some(ResponseStatus::Failed),
            "cancelled" => Some(ResponseStatus::Cancelled),
            _ => None,
        }
    }
}

/// Typed sampling and tool parameters captured on a response. The
/// JSON-valued fields (`stop`, `logit_bias`, `response_format`,
/// `tools`, `tool_choice`, `metadata`) are stored pre-marshalled;
/// empty arrays/objects are stored as `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A durable record of one model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    /// Opaque public id, prefix `resp_`.
    pub public_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    /// Public id of the prior response this one continues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    pub model: String,
    pub status: ResponseStatus,
    /// JSON-encoded input payload as received.
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub params: ResponseParams,
    /// JSON-encoded array of output parts, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// JSON-encoded token accounting, when the upstream reported any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    /// JSON-encoded error payload, set on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

/// Fields for creating a response record.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub public_id: String,
    pub user_id: String,
    pub conversation_id: Option<i64>,
    pub previous_response_id: Option<String>,
    pub model: String,
    pub input: String,
    pub system_prompt: Option<String>,
    pub params: ResponseParams,
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Asc,
    Desc,
}

/// Cursor pagination over internal ids.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    /// Return rows strictly after (asc) / before (desc) this id.
    pub after: Option<i64>,
    pub order: Order,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            after: None,
            order: Order::Asc,
        }
    }
}

/// Repository filter for items.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub conversation_id: Option<i64>,
    pub response_id: Option<i64>,
    pub role: Option<ItemRole>,
    pub public_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Repository traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConversationRepo: Send + Sync {
    async fn create(&self, conv: NewConversation) -> anyhow::Result<Conversation>;
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<Conversation>>;
    async fn get_by_public_id(
        &self,
        public_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<Conversation>>;
    async fn delete(&self, id: i64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ItemRepo: Send + Sync {
    async fn append(&self, item: NewItem) -> anyhow::Result<Item>;
    /// List items matching `filter` in logical order (`created_at`,
    /// then `id`), honouring `page`.
    async fn list(&self, filter: ItemFilter, page: Page) -> anyhow::Result<Vec<Item>>;
}

#[async_trait]
pub trait ResponseRepo: Send + Sync {
    async fn create(&self, resp: NewResponse) -> anyhow::Result<Response>;
    async fn get_by_public_id(&self, public_id: &str) -> anyhow::Result<Option<Response>>;
    async fn list_by_conversation(
        &self,
        conversation_id: i64,
        page: Page,
    ) -> anyhow::Result<Vec<Response>>;
    /// Transition a response's status, setting the matching terminal
    /// timestamp. Transitions out of a terminal state are a no-op;
    /// the stored record is returned either way.
    async fn update_status(&self, id: i64, status: ResponseStatus) -> anyhow::Result<Response>;
    async fn set_output(&self, id: i64, output: Option<String>) -> anyhow::Result<()>;
    async fn set_usage(&self, id: i64, usage: Option<String>) -> anyhow::Result<()>;
    async fn set_error(&self, id: i64, error: Option<String>) -> anyhow::Result<()>;
    async fn delete(&self, id: i64) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ResponseStatus::Pending.is_terminal());
        assert!(!ResponseStatus::Running.is_terminal());
        assert!(ResponseStatus::Completed.is_terminal());
        assert!(ResponseStatus::Failed.is_terminal());
        assert!(ResponseStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_round_trips() {
        for s in [
            ResponseStatus::Pending,
            ResponseStatus::Running,
            ResponseStatus::Completed,
            ResponseStatus::Failed,
            ResponseStatus::Cancelled,
        ] {
            assert_eq!(ResponseStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ResponseStatus::parse("nope"), None);
    }

    #[test]
    fn content_part_wire_shape() {
        let part = ContentPart::InputText {
            text: "Hi".to_string(),
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "input_text");
        assert_eq!(v["text"], "Hi");
    }

    #[test]
    fn message_item_requires_content() {
        let bad = NewItem {
            conversation_id: 1,
            response_id: None,
            item_type: ItemType::Message,
            role: Some(ItemRole::User),
            content: Vec::new(),
            function_name: None,
            function_arguments: None,
        };
        assert!(bad.validate().is_err());

        let good = NewItem::message(
            1,
            None,
            ItemRole::User,
            vec![ContentPart::InputText {
                text: "Hi".to_string(),
            }],
        );
        assert!(good.validate().is_ok());
    }

    #[test]
    fn function_call_item_requires_payload() {
        let good = NewItem::function_call(1, Some(2), "lookup".into(), "{}".into());
        assert!(good.validate().is_ok());

        let bad = NewItem {
            function_name: None,
            function_arguments: None,
            ..good
        };
        assert!(bad.validate().is_err());
    }
}
