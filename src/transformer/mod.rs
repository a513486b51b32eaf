//! Translation between the OpenAI-compatible surface and the Genspark
//! upstream.
//!
//! ```text
//! ChatCompletionRequest / ImageGenerationRequest
//!     ↓
//! [media]      ← inline images fetched/decoded, other files uploaded
//!     ↓
//! [request]    ← upstream payload (COPILOT_MOA_CHAT / COPILOT_MOA_IMAGE)
//!     ↓
//! Genspark /api/copilot/ask
//!     ↓
//! [signatures] ← failure pages and sentinels
//! [stream]     ← StreamEvent decode, classifier state machine
//!     ↓
//! OpenAI chunks / aggregate response
//! ```

pub mod media;
pub mod request;
pub mod signatures;
pub mod stream;

pub use media::{MediaBackend, MediaNormalizer, UploadTarget};
pub use request::{build_chat_payload, build_image_payload, ChatContext};
pub use signatures::classify_failure;
pub use stream::{Classified, StreamClassifier, StreamEvent};

/// Logical chat models accepted by this proxy.
pub const CHAT_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "o1-preview",
    "claude-3-5-sonnet",
    "claude-3-5-haiku",
    "gemini-1.5-pro",
    "gemini-1.5-flash",
    "deep-seek-v3",
    "deep-seek-r1",
];

/// Models the upstream can answer on their own. Anything else goes to the
/// ensemble.
pub const DIRECT_MODELS: &[&str] = CHAT_MODELS;

/// Upstream model list used for logical models outside [`DIRECT_MODELS`].
pub const ENSEMBLE_MODELS: &[&str] = &["gpt-4o", "claude-3-5-sonnet", "gemini-1.5-pro"];

/// Logical image models accepted by this proxy.
pub const IMAGE_MODELS: &[&str] = &[
    "dall-e-3",
    "flux",
    "flux-speed",
    "flux-pro/ultra",
    "ideogram",
    "recraft-v3",
];

/// Model with reasoning-specific message handling.
pub const REASONING_MODEL: &str = "deep-seek-r1";

/// Every model exposed on `/v1/models`.
pub fn supported_models() -> impl Iterator<Item = &'static str> {
    CHAT_MODELS.iter().chain(IMAGE_MODELS.iter()).copied()
}

/// Upstream model list for a logical chat model.
pub fn upstream_models(model: &str) -> Vec<String> {
    if DIRECT_MODELS.contains(&model) {
        vec![model.to_string()]
    } else {
        ENSEMBLE_MODELS.iter().map(|m| m.to_string()).collect()
    }
}

/// Upstream name for a logical image model.
pub fn upstream_image_model(model: &str) -> &str {
    match model {
        "dall-e-3" => "dalle-3",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_model_dispatch() {
        assert_eq!(upstream_models("claude-3-5-sonnet"), vec!["claude-3-5-sonnet"]);
    }

    #[test]
    fn test_unknown_model_uses_ensemble() {
        assert_eq!(
            upstream_models("gpt-5-ultra"),
            vec!["gpt-4o", "claude-3-5-sonnet", "gemini-1.5-pro"]
        );
    }

    #[test]
    fn test_image_alias() {
        assert_eq!(upstream_image_model("dall-e-3"), "dalle-3");
        assert_eq!(upstream_image_model("flux"), "flux");
    }

    #[test]
    fn test_supported_models_lists_both_kinds() {
        let models: Vec<_> = supported_models().collect();
        assert!(models.contains(&"gpt-4o"));
        assert!(models.contains(&"dall-e-3"));
    }
}
