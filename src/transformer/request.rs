//! Upstream payload builders.

use crate::api::models::ChatMessage;
use crate::transformer::{upstream_image_model, upstream_models, REASONING_MODEL};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CHAT_TYPE: &str = "COPILOT_MOA_CHAT";
pub const IMAGE_TYPE: &str = "COPILOT_MOA_IMAGE";

/// Language model the upstream uses to drive image generation.
const IMAGE_LLM_MODEL: &str = "gpt-4o";

/// Per-attempt continuation context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatContext {
    /// Existing upstream conversation to continue; `None` starts fresh.
    pub conversation_id: Option<String>,
}

impl ChatContext {
    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn continuing(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_prompt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<SessionState>,
}

impl From<ChatMessage> for UpstreamMessage {
    fn from(message: ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            is_prompt: None,
            session_state: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatExtraData {
    pub models: Vec<String>,
    pub run_with_another_model: bool,
    #[serde(rename = "writingContent")]
    pub writing_content: Option<String>,
}

/// Body of a chat dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub current_query_string: String,
    pub messages: Vec<UpstreamMessage>,
    pub action_params: Map<String, Value>,
    pub extra_data: ChatExtraData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub aspect_ratio: String,
    pub use_personalized_models: bool,
    pub fashion_profile_id: Option<String>,
    pub hd: bool,
    pub reflection_enabled: bool,
    pub style: String,
}

impl ModelConfig {
    fn for_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            aspect_ratio: "auto".to_string(),
            use_personalized_models: false,
            fashion_profile_id: None,
            hd: false,
            reflection_enabled: false,
            style: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageExtraData {
    pub model_configs: Vec<ModelConfig>,
    pub llm_model: String,
    #[serde(rename = "imageModelMap")]
    pub image_model_map: Map<String, Value>,
    #[serde(rename = "writingContent")]
    pub writing_content: Option<String>,
}

/// Body of an image dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub current_query_string: String,
    pub messages: Vec<UpstreamMessage>,
    pub user_s_input: String,
    pub action_params: Map<String, Value>,
    pub extra_data: ImageExtraData,
}

fn query_string(conversation_id: Option<&str>, kind: &str) -> String {
    match conversation_id {
        Some(id) => format!("id={}&type={}", id, kind),
        None => format!("type={}", kind),
    }
}

/// Keep only the messages from the last `user` message onward.
pub fn trim_to_last_user(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    match messages.iter().rposition(|m| m.role == "user") {
        Some(index) => messages.into_iter().skip(index).collect(),
        None => messages,
    }
}

/// Reasoning model quirks: no system role, assistant turns are tagged.
fn apply_reasoning_fixups(messages: &mut [UpstreamMessage], model: &str) {
    for message in messages.iter_mut() {
        match message.role.as_str() {
            "system" => message.role = "user".to_string(),
            "assistant" => {
                message.is_prompt = Some(false);
                message.session_state = Some(SessionState {
                    models: vec![model.to_string()],
                });
            }
            _ => {}
        }
    }
}

/// Build the chat payload for one attempt.
///
/// `messages` must already be media-normalized.
pub fn build_chat_payload(
    messages: Vec<ChatMessage>,
    model: &str,
    context: &ChatContext,
) -> ChatPayload {
    let messages = match context.conversation_id {
        Some(_) => trim_to_last_user(messages),
        None => messages,
    };
    let mut messages: Vec<UpstreamMessage> = messages.into_iter().map(Into::into).collect();
    if model == REASONING_MODEL {
        apply_reasoning_fixups(&mut messages, model);
    }

    ChatPayload {
        kind: CHAT_TYPE.to_string(),
        current_query_string: query_string(context.conversation_id.as_deref(), "chat"),
        messages,
        action_params: Map::new(),
        extra_data: ChatExtraData {
            models: upstream_models(model),
            run_with_another_model: false,
            writing_content: None,
        },
    }
}

/// Build the image payload for one attempt.
///
/// `source` is the already-normalized content item of the source image.
pub fn build_image_payload(
    prompt: &str,
    model: &str,
    conversation_id: Option<&str>,
    source: Option<Value>,
) -> ImagePayload {
    let content = match source {
        Some(item) => serde_json::json!([item, { "type": "text", "text": prompt }]),
        None => Value::String(prompt.to_string()),
    };

    ImagePayload {
        kind: IMAGE_TYPE.to_string(),
        current_query_string: query_string(conversation_id, IMAGE_TYPE),
        messages: vec![UpstreamMessage {
            role: "user".to_string(),
            content,
            is_prompt: None,
            session_state: None,
        }],
        user_s_input: prompt.to_string(),
        action_params: Map::new(),
        extra_data: ImageExtraData {
            model_configs: vec![ModelConfig::for_model(upstream_image_model(model))],
            llm_model: IMAGE_LLM_MODEL.to_string(),
            image_model_map: Map::new(),
            writing_content: None,
        },
    }
}
