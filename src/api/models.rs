//! API request and response models.
//!
//! OpenAI-compatible chat completion, image generation and model listing
//! shapes. Message content stays a raw JSON value so multimodal content
//! arrays pass through to media normalization untouched.

use crate::core::token_counter::TokenUsage;
use serde::{Deserialize, Serialize};

/// Chat completion request following OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model identifier
    pub model: String,

    /// Conversation messages
    pub messages: Vec<ChatMessage>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// String or array of content parts
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

impl ChatCompletionResponse {
    pub fn new(id: String, model: &str, content: String, usage: TokenUsage) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(usage),
        }
    }
}

/// Streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl StreamChunk {
    fn with(id: &str, model: &str, delta: Delta, finish_reason: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// Incremental assistant content.
    pub fn delta(id: &str, model: &str, content: &str) -> Self {
        Self::with(
            id,
            model,
            Delta {
                role: Some("assistant".to_string()),
                content: Some(content.to_string()),
            },
            None,
        )
    }

    /// Terminal chunk carrying `finish_reason = "stop"` and usage.
    pub fn stop(id: &str, model: &str, usage: TokenUsage) -> Self {
        let mut chunk = Self::with(id, model, Delta::default(), Some("stop".to_string()));
        chunk.usage = Some(usage);
        chunk
    }
}

/// `chatcmpl-<timestamp>` response identifier.
pub fn response_id() -> String {
    format!("chatcmpl-{}", chrono::Local::now().format("%Y%m%d%H%M%S"))
}

/// Image generation request following OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,

    /// Optional source image (URL or base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// "url" (default) or "b64_json"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

impl ImageGenerationRequest {
    pub fn wants_base64(&self) -> bool {
        self.response_format.as_deref() == Some("b64_json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}
