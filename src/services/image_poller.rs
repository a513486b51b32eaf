//! Image generation task polling.
//!
//! An image dispatch answers with a body whose result message embeds the
//! asynchronous task ids. Each task is then polled at a fixed sub-second
//! interval until it reports success with at least one image URL. There is
//! no attempt cap here; the caller's overall timeout bounds the poll.

use crate::services::credential_pool::Credential;
use crate::services::upstream::GensparkClient;
use crate::transformer::stream::{strip_data_prefix, StreamEvent};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(800);

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImages {
    #[serde(default)]
    generated_images: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    #[serde(default)]
    task_id: Option<String>,
}

/// Pull the conversation id and every task id out of an image response body.
pub fn extract_task_ids(body: &str) -> (Option<String>, Vec<String>) {
    let mut conversation_id = None;
    let mut task_ids = Vec::new();

    for line in body.lines() {
        if let Some(StreamEvent::ProjectStart { id: Some(id) }) = StreamEvent::from_line(line) {
            if !id.is_empty() {
                conversation_id = Some(id);
            }
            continue;
        }

        if !line.contains("task_id") {
            continue;
        }
        let payload = strip_data_prefix(line).unwrap_or(line);
        let Ok(envelope) = serde_json::from_str::<ResultEnvelope>(payload) else {
            continue;
        };
        let Some(content) = envelope.content else {
            continue;
        };
        let Ok(inner) = serde_json::from_str::<GeneratedImages>(&content) else {
            continue;
        };
        task_ids.extend(
            inner
                .generated_images
                .into_iter()
                .filter_map(|image| image.task_id)
                .filter(|id| !id.is_empty()),
        );
    }

    (conversation_id, task_ids)
}

#[derive(Clone)]
pub struct ImageTaskPoller {
    client: GensparkClient,
    interval: Duration,
}

impl ImageTaskPoller {
    pub fn new(client: GensparkClient) -> Self {
        Self::with_interval(client, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(client: GensparkClient, interval: Duration) -> Self {
        Self { client, interval }
    }

    /// Poll one task until it yields image URLs.
    pub async fn poll_until_ready(&self, credential: &Credential, task_id: &str) -> Vec<String> {
        let mut polls: u64 = 0;
        loop {
            polls += 1;
            match self.client.task_status(credential, task_id).await {
                Ok(status) => {
                    if let Some(urls) = status.ready_urls() {
                        tracing::debug!(task_id = %task_id, polls = polls, "Image task ready");
                        return urls;
                    }
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "Image task status poll failed");
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Poll every task in order and concatenate their URLs.
    pub async fn poll_all(&self, credential: &Credential, task_ids: &[String]) -> Vec<String> {
        let mut urls = Vec::new();
        for task_id in task_ids {
            urls.extend(self.poll_until_ready(credential, task_id).await);
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn image_body(task_ids: &[&str]) -> String {
        let images: Vec<_> = task_ids.iter().map(|id| json!({"task_id": id})).collect();
        let content = json!({"generated_images": images}).to_string();
        let result = json!({"type": "message_result", "content": content});
        format!(
            "data: {}\ndata: {}\n",
            json!({"type": "project_start", "id": "img-conv"}),
            result
        )
    }

    #[test]
    fn test_extract_task_ids() {
        let (conversation_id, task_ids) = extract_task_ids(&image_body(&["t1", "t2"]));
        assert_eq!(conversation_id.as_deref(), Some("img-conv"));
        assert_eq!(task_ids, vec!["t1", "t2"]);
    }

    #[test]
    fn test_extract_task_ids_empty() {
        let (_, task_ids) = extract_task_ids(&image_body(&[]));
        assert!(task_ids.is_empty());

        let (conversation_id, task_ids) = extract_task_ids("Rate limit exceeded cf1");
        assert!(conversation_id.is_none());
        assert!(task_ids.is_empty());
    }

    #[test]
    fn test_malformed_task_lines_are_skipped() {
        let body = "data: {\"content\": \"task_id but not json\"}\ndata: task_id {{{\n";
        assert!(extract_task_ids(body).1.is_empty());
    }

    #[tokio::test]
    async fn test_poll_until_ready_waits_for_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/spark/image_generation_task_status"))
            .and(query_param("task_id", "t1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"status": "PENDING", "image_urls_nowatermark": []}})),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/spark/image_generation_task_status"))
            .and(query_param("task_id", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "SUCCESS", "image_urls_nowatermark": ["https://img/a.png"]}
            })))
            .mount(&server)
            .await;

        let poller = ImageTaskPoller::with_interval(
            GensparkClient::new(reqwest::Client::new(), &server.uri()),
            Duration::from_millis(10),
        );
        let urls = poller
            .poll_all(&Credential::new("session_id=a"), &["t1".to_string()])
            .await;
        assert_eq!(urls, vec!["https://img/a.png"]);
    }
}
