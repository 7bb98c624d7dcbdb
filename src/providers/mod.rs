//! Inference provider abstractions.
//!
//! Defines the [`InferenceProvider`] trait, the OpenAI-shaped
//! completion request/response types shared by every adapter, and the
//! SSE line-scanning helpers. Concrete adapters:
//! [`OpenAiCompatClient`] (jan, open-router, and anything else
//! speaking the OpenAI chat-completions dialect) and [`GeminiClient`].

pub mod gemini;
pub mod openai_compat;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::config::{ProviderType, Vendor};

pub use gemini::GeminiClient;
pub use openai_compat::OpenAiCompatClient;

/// Raw SSE lines from an upstream stream (`data: {...}`, `data: [DONE]`).
pub type SseLineStream = Pin<Box<dyn Stream<Item = Result<String, anyhow::Error>> + Send>>;

/// Upstream lines longer than this abort the stream.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A single chat message in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// Assistant messages that invoke tools carry the raw
    /// `tool_calls` array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
    /// `role: "tool"` messages reference the call they answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl CompletionMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// An OpenAI-shaped chat-completions request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<CompletionMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A catalogue entry as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

fn default_model_object() -> String {
    "model".to_string()
}

impl ModelInfo {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: default_model_object(),
            created: None,
            owned_by: None,
        }
    }
}

/// A catalogue entry annotated with its originating provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedModel {
    #[serde(flatten)]
    pub model: ModelInfo,
    pub provider_id: String,
    pub provider_type: ProviderType,
    pub vendor: Vendor,
}

// ---------------------------------------------------------------------------
// InferenceProvider trait
// ---------------------------------------------------------------------------

/// Capability interface implemented by every upstream adapter.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn public_id(&self) -> &str;
    fn vendor(&self) -> Vendor;
    fn provider_type(&self) -> ProviderType;

    /// One-shot chat completion; returns the upstream JSON body.
    async fn create_completion(
        &self,
        req: &CompletionRequest,
    ) -> Result<serde_json::Value, anyhow::Error>;

    /// Streaming chat completion; yields raw upstream SSE lines
    /// (`data: {...}` envelopes, terminated by `data: [DONE]`).
    async fn create_completion_stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<SseLineStream, anyhow::Error>;

    /// The provider's model catalogue.
    async fn get_models(&self) -> Result<Vec<ModelInfo>, anyhow::Error>;

    /// Whether the provider serves `model`.
    async fn validate_model(&self, model: &str) -> Result<bool, anyhow::Error> {
        Ok(self.get_models().await?.iter().any(|m| m.id == model))
    }
}

/// Build a provider instance for a descriptor.
pub fn build_provider(
    public_id: &str,
    vendor: Vendor,
    provider_type: ProviderType,
    endpoint: &str,
    api_key: &str,
) -> Arc<dyn InferenceProvider> {
    match vendor {
        Vendor::Gemini => Arc::new(GeminiClient::new(
            public_id.to_string(),
            provider_type,
            endpoint.to_string(),
            api_key.to_string(),
        )),
        Vendor::Jan | Vendor::OpenRouter => Arc::new(OpenAiCompatClient::new(
            public_id.to_string(),
            vendor,
            provider_type,
            endpoint.to_string(),
            api_key.to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Extract token usage from an OpenAI-shaped response or delta body.
pub fn parse_token_usage(json: &serde_json::Value) -> Option<Usage> {
    let usage = json.get("usage")?;
    if usage.is_null() {
        return None;
    }
    serde_json::from_value(usage.clone()).ok()
}

/// A parsed `choices[0].delta` envelope from one upstream chunk.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub function_call: Option<FunctionCallDelta>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// Incremental piece of a legacy `function_call`.
#[derive(Debug, Clone, Default)]
pub struct FunctionCallDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Incremental piece of one entry in `tool_calls`.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Parse an OpenAI-shaped delta envelope. Fields are extracted in the
/// order content, reasoning_content, function_call, tool_calls.
pub fn parse_stream_delta(json: &serde_json::Value) -> StreamDelta {
    let mut out = StreamDelta {
        usage: parse_token_usage(json),
        ..Default::default()
    };

    let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else {
        return out;
    };
    out.finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let Some(delta) = choice.get("delta") else {
        return out;
    };
    out.content = delta
        .get("content")
        .and_then(|v| v.as_str())
        .map(String::from);
    out.reasoning_content = delta
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .map(String::from);

    if let Some(fc) = delta.get("function_call").and_then(|v| v.as_object()) {
        out.function_call = Some(FunctionCallDelta {
            name: fc.get("name").and_then(|v| v.as_str()).map(String::from),
            arguments: fc
                .get("arguments")
                .and_then(|v| v.as_str())
                .map(String::from),
        });
    }

    if let Some(tcs) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tcs {
            let func = tc.get("function");
            out.tool_calls.push(ToolCallDelta {
                index: tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                id: tc.get("id").and_then(|v| v.as_str()).map(String::from),
                name: func
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                arguments: func
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
            });
        }
    }

    out
}

/// Turn a streaming HTTP response body into a stream of SSE lines.
///
/// Lines are yielded verbatim (trailing whitespace trimmed, blank
/// lines skipped). The stream ends after `data: [DONE]` is yielded.
/// A single buffered line over [`MAX_SSE_LINE_BYTES`] aborts.
pub(crate) fn sse_line_stream(resp: reqwest::Response) -> SseLineStream {
    Box::pin(async_stream::try_stream! {
        use tokio_stream::StreamExt as _;

        let mut byte_stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim_end().to_string();
                buffer = buffer[newline_pos + 1..].to_string();

                if line.is_empty() {
                    continue;
                }
                let done = line == "data: [DONE]";
                yield line;
                if done {
                    return;
                }
            }

            if buffer.len() > MAX_SSE_LINE_BYTES {
                Err(anyhow::anyhow!(
                    "upstream SSE line exceeded {} bytes",
                    MAX_SSE_LINE_BYTES
                ))?;
            }
        }
    })
}
