//! HTTP adapter tests driven through the router with `tower::ServiceExt`.

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use common::*;
use nucleus::internal::api::{create_router, AppState};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

fn app(template: Value) -> Router {
    create_router(AppState::new(Fixture::new(template).kernel))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_lists_tools_and_intents() {
    let app = app(plan(vec![step("s1", "staging", "test.record", "/tmp/a/1")]));

    let (status, tools) = send(&app, "GET", "/v1/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(tools.as_array().unwrap().iter().any(|t| t["id"] == "fs.list"));

    let (status, intents) = send(&app, "GET", "/v1/intents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(intents, json!([{ "intent_id": "x.preview", "unit_id": "x" }]));

    println!("API listing test passed");
}

#[tokio::test]
async fn test_waited_run_returns_report() {
    let app = app(plan(vec![step("s1", "staging", "test.record", "/tmp/a/1")]));

    let (status, report) = send(
        &app,
        "POST",
        "/v1/runs",
        Some(json!({ "intent": intent(), "run_id": "w1", "wait": true })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["run_id"], "w1");
    assert_eq!(report["outcome"], "completed");

    let (status, trace) = send(&app, "GET", "/v1/runs/w1/trace?offset=6", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = trace["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"], "run_finished");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/runs",
        Some(json!({ "intent": intent(), "run_id": "w1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "run.exists");

    println!("Waited run test passed");
}

#[tokio::test]
async fn test_invalid_intent_is_bad_request() {
    let app = app(plan(vec![step("s1", "staging", "test.record", "/tmp/a/1")]));

    let (status, body) = send(
        &app,
        "POST",
        "/v1/runs",
        Some(json!({ "intent": { "intent_id": "x.preview", "params": {} }, "wait": true })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "intent.invalid");
    assert_eq!(body["error"]["data"]["errors"][0]["path"], "/scope");

    println!("Invalid intent API test passed");
}

#[tokio::test]
async fn test_async_run_waits_for_confirmation_signal() {
    let app = app(risky_plan(vec![step("c1", "commit", "test.record", "/tmp/a/1")]));

    let (status, accepted) = send(
        &app,
        "POST",
        "/v1/runs",
        Some(json!({ "intent": intent(), "run_id": "gated" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status_url"], "/v1/runs/gated");

    let (status, running) = send(&app, "GET", "/v1/runs/gated", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["status"], "running");

    let (status, _) = send(&app, "POST", "/v1/runs/gated/confirm", None).await;
    assert_eq!(status, StatusCode::OK);

    let mut finished = Value::Null;
    for _ in 0..100 {
        let (_, body) = send(&app, "GET", "/v1/runs/gated", None).await;
        if body["status"] == "finished" {
            finished = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(finished["report"]["outcome"], "completed");

    let (status, body) = send(&app, "POST", "/v1/runs/gated/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "run.not_running");

    println!("Async confirmation API test passed");
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = app(plan(vec![step("s1", "staging", "test.record", "/tmp/a/1")]));

    let (status, body) = send(&app, "GET", "/v1/runs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "run.not_found");

    let (status, _) = send(&app, "POST", "/v1/runs/nope/confirm", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    println!("Unknown run API test passed");
}

#[tokio::test]
async fn test_bearer_token_is_enforced() {
    let kernel = Fixture::new(plan(vec![step("s1", "staging", "test.record", "/tmp/a/1")])).kernel;
    let app = create_router(AppState::new(kernel).with_bearer_token("s3cret"));

    let (status, body) = send(&app, "GET", "/v1/tools", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "auth.unauthorized");

    let request = Request::builder()
        .uri("/v1/tools")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    println!("Bearer token test passed");
}
