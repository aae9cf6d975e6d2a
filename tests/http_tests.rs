// HTTP control API tests, driven through the router without a socket

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{harness, silent_frames, TestDevices};
use loqa_converse::{create_router, AppState};
use serde_json::Value;
use tower::ServiceExt;

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => request
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness(TestDevices::new(vec![]));
    let app = create_router(AppState::new(h.manager.clone()));

    let (status, body) = call(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_status_when_idle() {
    let h = harness(TestDevices::new(vec![]));
    let app = create_router(AppState::new(h.manager.clone()));

    let (status, body) = call(&app, "GET", "/conversation/status", None).await;
    let body = json(&body);

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["phase"], "idle");
    assert_eq!(body["status"]["message"], "Ready to connect");
    assert_eq!(body["status"]["muted"], false);
    assert!(body["stats"].is_null());
}

#[tokio::test]
async fn test_mute_toggles_status() {
    let h = harness(TestDevices::new(vec![]));
    let app = create_router(AppState::new(h.manager.clone()));

    let (status, body) = call(
        &app,
        "POST",
        "/conversation/mute",
        Some(serde_json::json!({ "muted": true })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["muted"], true);
    assert!(h.manager.is_muted());
}

#[tokio::test]
async fn test_stop_without_conversation_is_not_found() {
    let h = harness(TestDevices::new(vec![]));
    let app = create_router(AppState::new(h.manager.clone()));

    let (status, body) = call(&app, "POST", "/conversation/stop", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"], "No conversation running");
}

#[tokio::test]
async fn test_start_and_stop_over_http() {
    let mut h = harness(TestDevices::new(silent_frames(2)));
    let app = create_router(AppState::new(h.manager.clone()));

    let start_app = app.clone();
    let start =
        tokio::spawn(async move { call(&start_app, "POST", "/conversation/start", None).await });

    let peer = h.server.accept().await.unwrap();
    peer.acknowledge().await;

    let (status, body) = start.await.unwrap();
    let body = json(&body);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], peer.session_id.as_str());
    assert_eq!(body["status"]["phase"], "active");
    assert_eq!(body["status"]["message"], "Connected! Speak now.");

    let (status, body) = call(&app, "GET", "/conversation/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["stats"]["session_id"], peer.session_id.as_str());

    let (status, body) = call(&app, "POST", "/conversation/stop", None).await;
    let body = json(&body);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["phase"], "idle");
    assert_eq!(body["status"]["message"], "Disconnected");
    assert_eq!(body["stats"]["session_id"], peer.session_id.as_str());
}

#[tokio::test]
async fn test_start_with_missing_device_is_unavailable() {
    let mut devices = TestDevices::new(vec![]);
    devices.fail_input_open = true;
    let h = harness(devices);
    let app = create_router(AppState::new(h.manager.clone()));

    let (status, body) = call(&app, "POST", "/conversation/start", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json(&body)["error"]
        .as_str()
        .unwrap()
        .contains("microphone permission denied"));
}

#[tokio::test]
async fn test_start_refused_by_service_is_bad_gateway() {
    let h = harness(TestDevices::new(vec![]));
    h.transport.fail_next_connect("quota exceeded");
    let app = create_router(AppState::new(h.manager.clone()));

    let (status, _) = call(&app, "POST", "/conversation/start", None).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(h.manager.status().phase, loqa_converse::ConversationPhase::Idle);
}
