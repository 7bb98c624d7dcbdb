//! Shared integration-test harness: boots the full gateway on an
//! ephemeral port against a wiremock upstream.

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jan_gateway::cache::{CacheService, NoopCache};
use jan_gateway::config::Config;
use jan_gateway::control::ControlPlane;
use jan_gateway::gateway::{auth::KeyTable, start_gateway, AppState, Gateway};
use jan_gateway::registry::ModelRegistry;
use jan_gateway::responses::ResponsesService;
use jan_gateway::router::InferenceRouter;
use jan_gateway::store::SqliteStore;
use jan_gateway::stream::InFlight;
use tokio_util::sync::CancellationToken;

pub const API_KEY_USER1: &str = "sk-test-user1";
pub const API_KEY_USER2: &str = "sk-test-user2";

pub struct TestGateway {
    pub base: String,
    pub client: reqwest::Client,
    pub upstream: MockServer,
    pub service: Arc<ResponsesService>,
    _gateway: Gateway,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

pub async fn spawn_gateway() -> TestGateway {
    let upstream = MockServer::start().await;
    let endpoint = upstream.uri();
    spawn_gateway_with_endpoint(upstream, &endpoint).await
}

/// Boot the gateway against an arbitrary system-provider endpoint
/// (e.g. a raw socket upstream the mock server cannot express).
pub async fn spawn_gateway_with_endpoint(upstream: MockServer, endpoint: &str) -> TestGateway {
    let yaml = format!(
        r#"
auth:
  api_keys:
    - key: {API_KEY_USER1}
      user_id: user-1
      organization_id: org-1
      project_ids: [proj_a]
    - key: {API_KEY_USER2}
      user_id: user-2
system_provider:
  id: provider-system
  vendor: jan
  endpoint: {uri}
"#,
        uri = endpoint,
    );
    let cfg = Config::parse(&yaml).expect("harness config");

    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
    let service = Arc::new(ResponsesService::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let cache: Arc<dyn CacheService> = Arc::new(NoopCache);
    let registry = Arc::new(ModelRegistry::new());
    let router = Arc::new(InferenceRouter::from_config(&cfg, registry, cache.clone()));
    let control = Arc::new(ControlPlane::new(None, cache.clone()));
    let keys = Arc::new(KeyTable::from_config(&cfg.auth));

    let state = AppState {
        service: service.clone(),
        router,
        control,
        cache,
        keys,
        shutdown: CancellationToken::new(),
        in_flight: InFlight::new(),
    };
    let gateway = start_gateway("127.0.0.1:0".parse().unwrap(), state)
        .await
        .expect("gateway start");

    TestGateway {
        base: format!("http://{}", gateway.addr),
        client: reqwest::Client::new(),
        upstream,
        service,
        _gateway: gateway,
    }
}

/// An SSE upstream that sends one chunk and then holds the
/// connection open until the client hangs up. Used for disconnect
/// tests, which need a stream that never finishes on its own.
pub async fn stalling_sse_upstream(first_line: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first_line = first_line.to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let line = first_line.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = sock.read(&mut buf).await;

                let chunk = format!("{line}\n\n");
                let head = format!(
                    "HTTP/1.1 200 OK\r\n\
                     content-type: text/event-stream\r\n\
                     transfer-encoding: chunked\r\n\r\n\
                     {:x}\r\n{chunk}\r\n",
                    chunk.len(),
                );
                if sock.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let _ = sock.flush().await;

                // Hold the stream open; exit when the peer closes.
                let mut scratch = [0u8; 64];
                loop {
                    match sock.read(&mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    format!("http://{addr}")
}

/// Mount a non-streaming completion on the upstream.
pub async fn mock_completion(upstream: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-upstream",
                "object": "chat.completion",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": text },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8 },
            })),
        )
        .mount(upstream)
        .await;
}

/// Mount a seeded SSE stream on the upstream.
pub async fn mock_sse(upstream: &MockServer, lines: &[&str]) {
    let mut body = String::new();
    for line in lines {
        body.push_str(line);
        body.push_str("\n\n");
    }
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(upstream)
        .await;
}

/// A parsed SSE frame: optional event name plus the data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Split a raw SSE body into frames.
pub fn parse_sse(body: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut event = None;
    let mut data = String::new();
    for line in body.lines() {
        if line.is_empty() {
            if event.is_some() || !data.is_empty() {
                frames.push(SseFrame {
                    event: event.take(),
                    data: std::mem::take(&mut data),
                });
            }
            continue;
        }
        if let Some(name) = line.strip_prefix("event: ") {
            event = Some(name.to_string());
        } else if let Some(payload) = line.strip_prefix("data: ") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(payload);
        }
    }
    if event.is_some() || !data.is_empty() {
        frames.push(SseFrame { event, data });
    }
    frames
}

/// Scrub server-generated ids and timestamps so two runs compare
/// equal.
pub fn scrub(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            for prefix in ["resp_", "msg_", "conv_"] {
                if s.starts_with(prefix) {
                    *s = format!("{prefix}<id>");
                }
            }
        }
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key.ends_with("_at") {
                    *v = serde_json::Value::Null;
                } else {
                    scrub(v);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for v in items.iter_mut() {
                scrub(v);
            }
        }
        _ => {}
    }
}
