//! HTTP client for the Genspark upstream.
//!
//! Every call authenticates with a session cookie and presents itself with
//! the upstream's own `Origin`/`Referer`. The client carries no overall
//! request timeout; callers bound each call with `tokio::time::timeout`.

use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::services::credential_pool::Credential;
use crate::transformer::media::{MediaBackend, UploadTarget};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, ORIGIN, REFERER};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ASK_PATH: &str = "/api/copilot/ask";
const DELETE_PATH: &str = "/api/project/delete";
const UPLOAD_URL_PATH: &str = "/api/get_upload_personal_image_url";
const TASK_STATUS_PATH: &str = "/api/spark/image_generation_task_status";

pub const ACCEPT_EVENT_STREAM: &str = "text/event-stream";
pub const ACCEPT_JSON: &str = "application/json";
pub const ACCEPT_ANY: &str = "*/*";

/// Image task status as reported by the upstream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub data: TaskStatusData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStatusData {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub image_urls_nowatermark: Vec<String>,
}

impl TaskStatus {
    /// Image URLs once the task has succeeded with at least one image.
    pub fn ready_urls(self) -> Option<Vec<String>> {
        if self.data.status == "SUCCESS" && !self.data.image_urls_nowatermark.is_empty() {
            Some(self.data.image_urls_nowatermark)
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadUrlResponse {
    data: UploadUrlData,
}

#[derive(Debug, Deserialize)]
struct UploadUrlData {
    upload_image_url: String,
    private_storage_url: String,
}

#[derive(Clone)]
pub struct GensparkClient {
    http: reqwest::Client,
    base_url: String,
}

impl GensparkClient {
    /// Build the client from configuration, honouring `PROXY_URL`.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60));

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("Invalid PROXY_URL: {}", proxy_url))?;
            builder = builder.proxy(proxy);
            tracing::info!("Routing upstream traffic through configured proxy");
        }

        let http = builder.build().context("Failed to build HTTP client")?;
        Ok(Self::new(http, &config.upstream_base_url))
    }

    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authenticated(
        &self,
        request: reqwest::RequestBuilder,
        credential: &Credential,
        accept: &str,
    ) -> reqwest::RequestBuilder {
        request
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .header(ORIGIN, self.base_url.as_str())
            .header(REFERER, format!("{}/", self.base_url))
            .header(COOKIE, credential.expose())
    }

    /// POST a chat or image payload. The status is not checked here.
    pub async fn ask<T: Serialize + ?Sized>(
        &self,
        credential: &Credential,
        payload: &T,
        accept: &str,
    ) -> Result<reqwest::Response> {
        let request = self.authenticated(self.http.post(self.url(ASK_PATH)), credential, accept);
        Ok(request.json(payload).send().await?)
    }

    /// Delete an upstream conversation.
    pub async fn delete_conversation(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> anyhow::Result<()> {
        let response = self
            .authenticated(self.http.get(self.url(DELETE_PATH)), credential, ACCEPT_JSON)
            .query(&[("project_id", conversation_id)])
            .send()
            .await
            .context("delete request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("delete returned status {}", response.status());
        }
        Ok(())
    }

    /// Fetch the status of one image generation task.
    pub async fn task_status(&self, credential: &Credential, task_id: &str) -> Result<TaskStatus> {
        let response = self
            .http
            .get(self.url(TASK_STATUS_PATH))
            .header(COOKIE, credential.expose())
            .query(&[("task_id", task_id)])
            .send()
            .await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Download an arbitrary resource.
    pub async fn download(&self, url: &str) -> Result<Bytes> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamStatus {
                status: status.as_u16(),
                body: format!("download of {} failed", url),
            });
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl MediaBackend for GensparkClient {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.download(url).await
    }

    async fn request_upload_target(&self, credential: &Credential) -> Result<UploadTarget> {
        let response = self
            .authenticated(self.http.get(self.url(UPLOAD_URL_PATH)), credential, ACCEPT_ANY)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: UploadUrlResponse = serde_json::from_str(&body)?;
        Ok(UploadTarget {
            upload_url: parsed.data.upload_image_url,
            private_storage_url: parsed.data.private_storage_url,
        })
    }

    async fn upload(&self, target: &UploadTarget, bytes: Bytes) -> Result<()> {
        let response = self
            .http
            .put(&target.upload_url)
            .header(ACCEPT, ACCEPT_ANY)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(ORIGIN, self.base_url.as_str())
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|e| {
                tracing::warn!(status = status.as_u16(), error = %e, "Failed to read upload error body");
                String::new()
            });
            return Err(AppError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
