//! Integration tests for the non-streaming responses surface.

mod common;

use common::{mock_completion, spawn_gateway, API_KEY_USER1, API_KEY_USER2};
use serde_json::json;

async fn create_response(
    gw: &common::TestGateway,
    key: &str,
    body: serde_json::Value,
) -> reqwest::Response {
    gw.client
        .post(gw.url("/v1/responses"))
        .bearer_auth(key)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn blocking_response_round_trip() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "Hello! How can I help?").await;

    let resp = create_response(
        &gw,
        API_KEY_USER1,
        json!({ "model": "jan-v1-4b", "input": "Hi", "stream": false }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["model"], "jan-v1-4b");
    assert_eq!(body["output"].as_array().unwrap().len(), 1);
    assert_eq!(
        body["output"][0]["content"][0]["text"],
        "Hello! How can I help?"
    );
    assert_eq!(body["usage"]["total_tokens"], 8);
    let conv_id = body["conversation"]["id"].as_str().unwrap();
    assert!(conv_id.starts_with("conv_"));
    assert!(body["completed_at"].is_number());

    // One user item, one non-empty assistant item, in that order.
    let items_resp = gw
        .client
        .get(gw.url(&format!(
            "/v1/responses/{}/input_items",
            body["id"].as_str().unwrap()
        )))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(items_resp.status(), 200);
    let items: serde_json::Value = items_resp.json().await.unwrap();
    let data = items["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["role"], "user");
    assert_eq!(data[0]["content"][0]["text"], "Hi");
    assert_eq!(data[1]["role"], "assistant");
    assert!(!data[1]["content"][0]["text"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn store_false_persists_no_conversation() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "ephemeral").await;

    let resp = create_response(
        &gw,
        API_KEY_USER1,
        json!({ "model": "jan-v1-4b", "input": "Hi", "stream": false, "store": false }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert!(body["conversation"].is_null());

    let items_resp = gw
        .client
        .get(gw.url(&format!(
            "/v1/responses/{}/input_items",
            body["id"].as_str().unwrap()
        )))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    let items: serde_json::Value = items_resp.json().await.unwrap();
    assert!(items["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn previous_response_inherits_conversation() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "first").await;

    let first: serde_json::Value = create_response(
        &gw,
        API_KEY_USER1,
        json!({ "model": "jan-v1-4b", "input": "Hi", "stream": false }),
    )
    .await
    .json()
    .await
    .unwrap();
    let first_conv = first["conversation"]["id"].as_str().unwrap().to_string();

    let second: serde_json::Value = create_response(
        &gw,
        API_KEY_USER1,
        json!({
            "model": "jan-v1-4b",
            "input": "again",
            "stream": false,
            "previous_response_id": first["id"],
        }),
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(second["conversation"]["id"].as_str().unwrap(), first_conv);
    assert_eq!(second["previous_response_id"], first["id"]);
}

#[tokio::test]
async fn foreign_previous_response_is_rejected() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "mine").await;

    let first: serde_json::Value = create_response(
        &gw,
        API_KEY_USER1,
        json!({ "model": "jan-v1-4b", "input": "Hi", "stream": false }),
    )
    .await
    .json()
    .await
    .unwrap();

    let stolen = create_response(
        &gw,
        API_KEY_USER2,
        json!({
            "model": "jan-v1-4b",
            "input": "steal",
            "stream": false,
            "previous_response_id": first["id"],
        }),
    )
    .await;
    assert_eq!(stolen.status(), 401);
    let body: serde_json::Value = stolen.json().await.unwrap();
    assert_eq!(body["code"], jan_gateway::error::CODE_UNAUTHORIZED);

    // The original conversation gained no records from the attempt.
    let items_resp = gw
        .client
        .get(gw.url(&format!(
            "/v1/responses/{}/input_items",
            first["id"].as_str().unwrap()
        )))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    let items: serde_json::Value = items_resp.json().await.unwrap();
    assert_eq!(items["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn get_cancel_delete_lifecycle() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "done deal").await;

    let created: serde_json::Value = create_response(
        &gw,
        API_KEY_USER1,
        json!({ "model": "jan-v1-4b", "input": "Hi", "stream": false }),
    )
    .await
    .json()
    .await
    .unwrap();
    let id = created["id"].as_str().unwrap();

    let fetched: serde_json::Value = gw
        .client
        .get(gw.url(&format!("/v1/responses/{id}")))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["id"], created["id"]);
    assert_eq!(fetched["status"], "completed");

    // Terminal states are final: cancel after completion is a no-op.
    let cancelled: serde_json::Value = gw
        .client
        .post(gw.url(&format!("/v1/responses/{id}/cancel")))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancelled["status"], "completed");
    assert!(cancelled["cancelled_at"].is_null());

    let deleted: serde_json::Value = gw
        .client
        .delete(gw.url(&format!("/v1/responses/{id}")))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["deleted"], true);

    let gone = gw
        .client
        .get(gw.url(&format!("/v1/responses/{id}")))
        .bearer_auth(API_KEY_USER1)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn named_conversation_must_belong_to_caller() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "hi").await;

    let resp = create_response(
        &gw,
        API_KEY_USER1,
        json!({
            "model": "jan-v1-4b",
            "input": "Hi",
            "stream": false,
            "conversation": "conv_does-not-exist",
        }),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn foreign_response_reads_are_not_found() {
    let gw = spawn_gateway().await;
    mock_completion(&gw.upstream, "private").await;

    let created: serde_json::Value = create_response(
        &gw,
        API_KEY_USER1,
        json!({ "model": "jan-v1-4b", "input": "Hi", "stream": false }),
    )
    .await
    .json()
    .await
    .unwrap();
    let id = created["id"].as_str().unwrap();

    let foreign = gw
        .client
        .get(gw.url(&format!("/v1/responses/{id}")))
        .bearer_auth(API_KEY_USER2)
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 404);
}
