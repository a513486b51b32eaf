//! Shared helpers for HTTP-level tests against a mocked upstream.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use genspark_proxy::{build_router, AppConfig, AppState, BackgroundTasks, GensparkClient, Orchestrator};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::MockServer;

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

/// Build the router against `server` with `GS_COOKIE` and any extra variables.
pub fn app(server: &MockServer, vars: &[(&str, &str)]) -> TestApp {
    let mut env: HashMap<String, String> = HashMap::new();
    env.insert("GS_COOKIE".to_string(), "a".to_string());
    env.insert("UPSTREAM_BASE_URL".to_string(), server.uri());
    for (key, value) in vars {
        env.insert(key.to_string(), value.to_string());
    }

    let config = AppConfig::from_lookup(|key| env.get(key).cloned()).unwrap();
    let client = GensparkClient::new(reqwest::Client::new(), &server.uri());
    let orchestrator = Orchestrator::new(&config, client, BackgroundTasks::start())
        .with_poll_interval(Duration::from_millis(10));
    let state = Arc::new(AppState::new(config, orchestrator));

    TestApp {
        router: build_router(state.clone()),
        state,
    }
}

pub fn chat_request(stream: bool) -> Value {
    json!({
        "model": "gpt-4o",
        "stream": stream,
        "messages": [{"role": "user", "content": "Hi"}]
    })
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(app: &TestApp, request: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// Upstream event stream answering "Hello world" in two deltas.
pub fn hello_world_stream(conversation_id: &str) -> String {
    [
        json!({"type": "project_start", "id": conversation_id}),
        json!({"type": "message_field_delta", "field_name": "session_state.answer", "delta": "Hello"}),
        json!({"type": "message_field_delta", "field_name": "session_state.answer", "delta": " world"}),
        json!({"type": "message_result", "content": "Hello world"}),
    ]
    .iter()
    .map(|event| format!("data: {}\n", event))
    .collect()
}

/// Upstream image body dispatching the given task ids.
pub fn image_dispatch_body(conversation_id: &str, task_ids: &[&str]) -> String {
    let images: Vec<Value> = task_ids.iter().map(|id| json!({"task_id": id})).collect();
    let content = json!({"generated_images": images}).to_string();
    format!(
        "data: {}\ndata: {}\n",
        json!({"type": "project_start", "id": conversation_id}),
        json!({"type": "message_result", "content": content})
    )
}

/// Cookie header of every chat/image dispatch the upstream received, in order.
pub async fn dispatched_cookies(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/api/copilot/ask")
        .map(|request| {
            request
                .headers
                .get("cookie")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}
