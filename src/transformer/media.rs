//! Inline media normalization.
//!
//! Every `image_url` item in a chat history (and the optional source image
//! of an image request) is resolved to bytes, either fetched over HTTP or
//! decoded from base64. Images are re-embedded as a JPEG data URL; anything
//! else is uploaded to the upstream's private blob storage and replaced by a
//! `private_file` descriptor. Any failure aborts the call.

use crate::api::models::ChatMessage;
use crate::core::error::{AppError, Result};
use crate::services::credential_pool::Credential;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde_json::{json, Value};

/// Blob upload destination issued by the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub upload_url: String,
    pub private_storage_url: String,
}

/// Network operations media normalization depends on.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Download a remote resource.
    async fn fetch(&self, url: &str) -> Result<Bytes>;

    /// Ask the upstream for a blob upload URL on behalf of `credential`.
    async fn request_upload_target(&self, credential: &Credential) -> Result<UploadTarget>;

    /// PUT `bytes` to the issued blob URL.
    async fn upload(&self, target: &UploadTarget, bytes: Bytes) -> Result<()>;
}

/// Result of normalizing one media reference.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedMedia {
    /// `data:image/jpeg;base64,...`
    InlineImage(String),
    /// Complete `private_file` content item.
    PrivateFile(Value),
}

impl NormalizedMedia {
    /// Content item to place in an upstream message.
    pub fn into_content_item(self) -> Value {
        match self {
            NormalizedMedia::InlineImage(url) => json!({
                "type": "image_url",
                "image_url": { "url": url },
            }),
            NormalizedMedia::PrivateFile(item) => item,
        }
    }
}

pub struct MediaNormalizer<'a> {
    backend: &'a dyn MediaBackend,
    credential: &'a Credential,
}

impl<'a> MediaNormalizer<'a> {
    pub fn new(backend: &'a dyn MediaBackend, credential: &'a Credential) -> Self {
        Self {
            backend,
            credential,
        }
    }

    /// Normalize every inline image reference in `messages`, in place.
    pub async fn normalize_messages(&self, messages: &mut [ChatMessage]) -> Result<()> {
        for message in messages.iter_mut() {
            let Some(items) = message.content.as_array_mut() else {
                continue;
            };
            for item in items.iter_mut() {
                let Some(reference) = image_reference(item) else {
                    continue;
                };
                let normalized = self.normalize_reference(&reference).await?;
                *item = normalized.into_content_item();
            }
        }
        Ok(())
    }

    /// Resolve and normalize a single URL or base64 reference.
    pub async fn normalize_reference(&self, reference: &str) -> Result<NormalizedMedia> {
        let bytes = self.resolve_bytes(reference).await?;
        let content_type = detect_content_type(&bytes);

        if content_type.starts_with("image/") {
            return Ok(NormalizedMedia::InlineImage(format!(
                "data:image/jpeg;base64,{}",
                STANDARD.encode(&bytes)
            )));
        }

        let target = self
            .backend
            .request_upload_target(self.credential)
            .await
            .map_err(|e| AppError::Translation(format!("upload url request failed: {}", e)))?;
        let size = bytes.len();
        self.backend
            .upload(&target, bytes)
            .await
            .map_err(|e| AppError::Translation(format!("blob upload failed: {}", e)))?;

        tracing::debug!(
            credential = %self.credential,
            content_type = %content_type,
            size = size,
            "Uploaded non-image attachment"
        );

        Ok(NormalizedMedia::PrivateFile(json!({
            "type": "private_file",
            "private_file": {
                "name": "file",
                "type": content_type,
                "size": size,
                "ext": extension_for(content_type),
                "private_storage_url": target.private_storage_url,
            }
        })))
    }

    async fn resolve_bytes(&self, reference: &str) -> Result<Bytes> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return self
                .backend
                .fetch(reference)
                .await
                .map_err(|e| AppError::Translation(format!("media fetch failed: {}", e)));
        }
        decode_base64(reference)
    }
}

fn image_reference(item: &Value) -> Option<String> {
    if item.get("type")?.as_str()? != "image_url" {
        return None;
    }
    item.get("image_url")?
        .get("url")?
        .as_str()
        .map(str::to_string)
}

/// Decode a bare base64 payload or a `data:...;base64,` URL.
pub fn decode_base64(reference: &str) -> Result<Bytes> {
    let payload = match reference.split_once(";base64,") {
        Some((_, data)) => data,
        None => reference,
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(cleaned.as_bytes())
        .map(Bytes::from)
        .map_err(|e| AppError::Translation(format!("base64 decode failed: {}", e)))
}

/// Sniff a content type from leading magic bytes.
pub fn detect_content_type(bytes: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"BM", "image/bmp"),
        (b"\x00\x00\x01\x00", "image/x-icon"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1F\x8B\x08", "application/x-gzip"),
    ];

    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "image/webp";
    }
    if let Some((_, content_type)) = SIGNATURES.iter().find(|(magic, _)| bytes.starts_with(magic))
    {
        return *content_type;
    }
    if std::str::from_utf8(bytes).is_ok() {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

fn extension_for(content_type: &str) -> &str {
    content_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .unwrap_or(content_type)
}
