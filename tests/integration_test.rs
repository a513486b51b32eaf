//! HTTP-level tests for the proxy against a mocked Genspark upstream.

mod common;

use axum::http::{Request, StatusCode};
use axum::body::Body;
use common::*;
use genspark_proxy::services::Credential;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHALLENGE_PAGE: &str = r#"<!DOCTYPE html><html lang="en-US"><head><title>Just a moment...</title></head><body><script>window._cf_chl_opt={}</script></body></html>"#;

fn ask() -> wiremock::MockBuilder {
    Mock::given(method("POST")).and(path("/api/copilot/ask"))
}

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

#[tokio::test]
async fn test_models_list() {
    let server = MockServer::start().await;
    let app = app(&server, &[]);

    let response = send(
        &app,
        Request::builder().uri("/v1/models").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-4o"));
    assert!(ids.contains(&"dall-e-3"));
}

#[tokio::test]
async fn test_auth_required_when_secret_configured() {
    let server = MockServer::start().await;
    let app = app(&server, &[("API_SECRET", "s3cret")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "authentication_error");

    let response = send(
        &app,
        Request::builder()
            .uri("/v1/models")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_public() {
    let server = MockServer::start().await;
    let app = app(&server, &[("API_SECRET", "s3cret"), ("GS_COOKIE", "a,b")]);

    let response = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["credentials"]["total"], 2);
}

#[tokio::test]
async fn test_route_prefix() {
    let server = MockServer::start().await;
    let app = app(&server, &[("ROUTE_PREFIX", "proxy")]);

    let response = send(
        &app,
        Request::builder().uri("/proxy/v1/models").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        Request::builder().uri("/v1/models").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_non_stream_chat() {
    let server = MockServer::start().await;
    ask()
        .and(header("cookie", "session_id=a"))
        .and(body_partial_json(json!({"type": "COPILOT_MOA_CHAT"})))
        .respond_with(sse(hello_world_stream("conv-1")))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(&server, &[]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_stream_chat() {
    let server = MockServer::start().await;
    ask()
        .respond_with(sse(hello_world_stream("conv-1")))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(&server, &[]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(true))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = body_string(response).await;
    let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), 4);

    let first: serde_json::Value =
        serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hello");

    let second: serde_json::Value =
        serde_json::from_str(frames[1].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(second["choices"][0]["delta"]["content"], " world");

    let stop: serde_json::Value =
        serde_json::from_str(frames[2].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(stop["choices"][0]["finish_reason"], "stop");
    assert!(stop["usage"]["total_tokens"].as_u64().unwrap() > 0);

    assert_eq!(frames[3], "data: [DONE]");
}

#[tokio::test]
async fn test_affinity_reuses_conversation() {
    let server = MockServer::start().await;
    ask()
        .and(body_partial_json(json!({"current_query_string": "type=chat"})))
        .respond_with(sse(hello_world_stream("conv-1")))
        .expect(1)
        .mount(&server)
        .await;
    ask()
        .and(body_partial_json(
            json!({"current_query_string": "id=conv-1&type=chat"}),
        ))
        .respond_with(sse(hello_world_stream("conv-1")))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(&server, &[]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
    app.state.orchestrator.background().idle().await;

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_auto_delete_removes_temporary_conversation() {
    let server = MockServer::start().await;
    ask()
        .respond_with(sse(hello_world_stream("temp-conv")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/project/delete"))
        .and(query_param("project_id", "temp-conv"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(
        &server,
        &[("AUTO_DEL_CHAT", "1"), ("AUTO_MODEL_CHAT_MAP_TYPE", "0")],
    );

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
    app.state.orchestrator.background().idle().await;
}

#[tokio::test]
async fn test_failover_to_second_credential() {
    let server = MockServer::start().await;
    ask()
        .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    ask()
        .respond_with(sse(hello_world_stream("conv-ok")))
        .mount(&server)
        .await;
    let app = app(&server, &[("GS_COOKIE", "a,b")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");

    let cookies = dispatched_cookies(&server).await;
    assert_eq!(cookies.len(), 2);
    assert_ne!(cookies[0], cookies[1]);
    assert!(app
        .state
        .orchestrator
        .store()
        .is_rate_limited(&Credential::new(&cookies[0])));
}

#[tokio::test]
async fn test_stream_failover_before_commit() {
    let server = MockServer::start().await;
    let quota = format!(
        "data: {}\n",
        json!({
            "type": "message_result",
            "content": "You've reached your free usage limit today",
            "action": {"type": "ACTION_QUOTA_EXCEEDED"}
        })
    );
    ask()
        .respond_with(sse(quota))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    ask()
        .respond_with(sse(hello_world_stream("conv-ok")))
        .mount(&server)
        .await;
    let app = app(&server, &[("GS_COOKIE", "a,b")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(true))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"content\":\"Hello\""));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let cookies = dispatched_cookies(&server).await;
    assert_eq!(cookies.len(), 2);
    assert_ne!(cookies[0], cookies[1]);
}

#[tokio::test]
async fn test_stream_failure_after_commit_is_not_retried() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\ndata: {}\nRate limit exceeded cf1\n",
        json!({"type": "project_start", "id": "conv-1"}),
        json!({"type": "message_field_delta", "field_name": "session_state.answer", "delta": "Hello"}),
    );
    ask().respond_with(sse(body)).mount(&server).await;
    let app = app(&server, &[("GS_COOKIE", "a,b")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(true))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"content\":\"Hello\""));
    assert!(!body.contains("finish_reason\":\"stop"));
    assert!(!body.contains("[DONE]"));

    assert_eq!(dispatched_cookies(&server).await.len(), 1);
}

#[tokio::test]
async fn test_answer_quoting_upstream_errors_is_returned() {
    let server = MockServer::start().await;
    let content = "The upstream says: Server overloaded, please try again later. See ACTION_QUOTA_EXCEEDED.";
    let body = format!(
        "data: {}\ndata: {}\n",
        json!({"type": "project_start", "id": "conv-1"}),
        json!({"type": "message_result", "content": content}),
    );
    ask().respond_with(sse(body)).expect(1).mount(&server).await;
    let app = app(&server, &[("GS_COOKIE", "a,b")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], content);
}

#[tokio::test]
async fn test_single_credential_exhausted() {
    let server = MockServer::start().await;
    ask()
        .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(&server, &[]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");

    // The credential is cooling down, so the pool is now empty.
    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_challenge_page_is_fatal() {
    let server = MockServer::start().await;
    ask()
        .respond_with(ResponseTemplate::new(403).set_body_string(CHALLENGE_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(&server, &[("GS_COOKIE", "a,b,c")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(true))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "upstream_error");
}

#[tokio::test]
async fn test_unclassified_status_is_fatal() {
    let server = MockServer::start().await;
    ask()
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(&server, &[("GS_COOKIE", "a,b")]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(false))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_empty_messages_rejected() {
    let server = MockServer::start().await;
    let app = app(&server, &[]);

    let response = send(
        &app,
        post_json(
            "/v1/chat/completions",
            &json!({"model": "gpt-4o", "messages": []}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_image_generation_polls_tasks() {
    let server = MockServer::start().await;
    ask()
        .and(body_partial_json(json!({"type": "COPILOT_MOA_IMAGE"})))
        .respond_with(sse(image_dispatch_body("img-conv", &["t1"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/spark/image_generation_task_status"))
        .and(query_param("task_id", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"status": "PENDING", "image_urls_nowatermark": []}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/spark/image_generation_task_status"))
        .and(query_param("task_id", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"status": "SUCCESS", "image_urls_nowatermark": ["https://img.test/1.png"]}
        })))
        .mount(&server)
        .await;
    let app = app(&server, &[]);

    let response = send(
        &app,
        post_json(
            "/v1/images/generations",
            &json!({"model": "dall-e-3", "prompt": "a cat"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["url"], "https://img.test/1.png");
    assert_eq!(body["data"][0]["revised_prompt"], "a cat");
}

#[tokio::test]
async fn test_image_without_task_ids_exhausts() {
    let server = MockServer::start().await;
    ask()
        .respond_with(sse(image_dispatch_body("img-conv", &[])))
        .expect(2)
        .mount(&server)
        .await;
    let app = app(&server, &[("GS_COOKIE", "a,b")]);

    let response = send(
        &app,
        post_json(
            "/v1/images/generations",
            &json!({"model": "flux", "prompt": "a dog"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
