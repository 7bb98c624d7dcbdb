//! Integration tests for the model catalogue and control plane.

mod common;

use common::{spawn_gateway, API_KEY_USER1};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn catalogue_lists_system_models() {
    let gw = spawn_gateway().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{ "id": "jan-v1-4b" }, { "id": "jan-nano" }],
        })))
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .client
        .get(gw.url("/v1/models"))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "jan-v1-4b");
    assert_eq!(data[0]["provider_id"], "provider-system");
    assert_eq!(data[0]["vendor"], "jan");
}

#[tokio::test]
async fn catalogue_survives_upstream_failure() {
    let gw = spawn_gateway().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&gw.upstream)
        .await;

    // Provider catalogue failures degrade to an empty list, never an
    // error.
    let resp = gw
        .client
        .get(gw.url("/v1/models"))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn control_plane_without_cluster_is_a_precondition_failure() {
    let gw = spawn_gateway().await;

    let status = gw
        .client
        .get(gw.url("/v1/models/status"))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(status.status(), 412);
    let body: serde_json::Value = status.json().await.unwrap();
    assert_eq!(body["code"], jan_gateway::error::CODE_PRECONDITION_FAILED);

    let gpus = gw
        .client
        .get(gw.url("/v1/models/gpus"))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(gpus.status(), 412);

    let create = gw
        .client
        .post(gw.url("/v1/models"))
        .bearer_auth(API_KEY_USER1)
        .json(&json!({
            "model_name": "jan-v1-4b",
            "image": "vllm/vllm-openai:v0.8",
            "command": ["--served-model-name", "jan-v1-4b"],
            "gpu_count": 1,
            "resources": { "cpu": "4", "memory": "16Gi" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(create.status(), 412);

    let delete = gw
        .client
        .delete(gw.url("/v1/models/jan-v1-4b"))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status(), 412);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let gw = spawn_gateway().await;

    // Liveness needs no API key.
    let resp = gw.client.get(gw.url("/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache"], "ok");
}
