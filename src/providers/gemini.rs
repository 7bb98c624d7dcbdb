//! Gemini provider via Google's OpenAI-compatibility endpoint.
//!
//! The wire shape matches the OpenAI dialect; authentication differs
//! (the key is sent as `x-goog-api-key` with bearer auth alongside,
//! since proxies accept one or the other) and the base URL is fixed
//! unless overridden.

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{ProviderType, Vendor};

use super::{
    sse_line_stream, CompletionRequest, InferenceProvider, ModelInfo, SseLineStream,
};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub struct GeminiClient {
    public_id: String,
    provider_type: ProviderType,
    endpoint: String,
    api_key: String,
    client: Client,
}

impl GeminiClient {
    /// `endpoint` may be empty to use [`DEFAULT_ENDPOINT`].
    pub fn new(
        public_id: String,
        provider_type: ProviderType,
        endpoint: String,
        api_key: String,
    ) -> Self {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            endpoint.trim_end_matches('/').to_string()
        };
        Self {
            public_id,
            provider_type,
            endpoint,
            api_key,
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            return req;
        }
        req.header("x-goog-api-key", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl InferenceProvider for GeminiClient {
    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn vendor(&self) -> Vendor {
        Vendor::Gemini
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn create_completion(
        &self,
        req: &CompletionRequest,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let mut body = req.clone();
        body.stream = false;
        let url = format!("{}/chat/completions", self.endpoint);
        let resp = self.authed(self.client.post(&url).json(&body)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("gemini returned {status}: {text}");
        }
        Ok(resp.json().await?)
    }

    async fn create_completion_stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<SseLineStream, anyhow::Error> {
        let mut body = req.clone();
        body.stream = true;
        let url = format!("{}/chat/completions", self.endpoint);
        let resp = self.authed(self.client.post(&url).json(&body)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("gemini returned {status}: {text}");
        }
        Ok(sse_line_stream(resp))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, anyhow::Error> {
        let url = format!("{}/models", self.endpoint);
        let resp = self.authed(self.client.get(&url)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("gemini model listing returned {status}: {text}");
        }

        #[derive(serde::Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelInfo>,
        }
        let list: ModelList = resp.json().await?;
        Ok(list.data)
    }
}
