//! Caller disconnects in the middle of a committed stream.

mod common;

use common::*;
use futures::StreamExt;
use genspark_proxy::core::get_metrics;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn disconnects() -> u64 {
    get_metrics()
        .client_disconnects
        .with_label_values(&["/v1/chat/completions"])
        .get()
}

#[tokio::test]
async fn test_disconnect_mid_stream_is_counted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/copilot/ask"))
        .respond_with(ResponseTemplate::new(200).set_body_string(hello_world_stream("conv-1")))
        .mount(&server)
        .await;
    let app = app(&server, &[]);
    let before = disconnects();

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(true))).await;
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("Hello"));
    drop(body);

    assert_eq!(disconnects(), before + 1);

    // Nothing was recorded because the answer never completed.
    app.state.orchestrator.background().idle().await;
    assert!(app.state.orchestrator.affinity().is_empty());
}

#[tokio::test]
async fn test_completed_stream_is_not_a_disconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/copilot/ask"))
        .respond_with(ResponseTemplate::new(200).set_body_string(hello_world_stream("conv-2")))
        .mount(&server)
        .await;
    let app = app(&server, &[]);

    let response = send(&app, post_json("/v1/chat/completions", &chat_request(true))).await;
    let body = body_string(response).await;
    assert!(body.ends_with("data: [DONE]\n\n"));

    app.state.orchestrator.background().idle().await;
    assert_eq!(app.state.orchestrator.affinity().len(), 1);
}
