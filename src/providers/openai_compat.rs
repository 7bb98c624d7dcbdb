//! Generic OpenAI-compatible provider.
//!
//! Works with any API that implements the OpenAI chat completions
//! interface: jan inference nodes, OpenRouter, and compatible local
//! servers. `api_key` may be empty for servers that need none.

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{ProviderType, Vendor};

use super::{
    sse_line_stream, CompletionRequest, InferenceProvider, ModelInfo, SseLineStream,
};

pub struct OpenAiCompatClient {
    public_id: String,
    vendor: Vendor,
    provider_type: ProviderType,
    /// Base URL up to and including the version segment
    /// (e.g. `https://openrouter.ai/api/v1`).
    endpoint: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(
        public_id: String,
        vendor: Vendor,
        provider_type: ProviderType,
        endpoint: String,
        api_key: String,
    ) -> Self {
        Self {
            public_id,
            vendor,
            provider_type,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }

    async fn post_completions(
        &self,
        req: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, anyhow::Error> {
        let mut body = req.clone();
        body.stream = stream;
        let url = format!("{}/chat/completions", self.endpoint);
        let resp = self.authed(self.client.post(&url).json(&body)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("upstream returned {status}: {text}");
        }
        Ok(resp)
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatClient {
    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn create_completion(
        &self,
        req: &CompletionRequest,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let resp = self.post_completions(req, false).await?;
        Ok(resp.json().await?)
    }

    async fn create_completion_stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<SseLineStream, anyhow::Error> {
        let resp = self.post_completions(req, true).await?;
        Ok(sse_line_stream(resp))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, anyhow::Error> {
        let url = format!("{}/models", self.endpoint);
        let resp = self.authed(self.client.get(&url)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("model listing returned {status}: {text}");
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
