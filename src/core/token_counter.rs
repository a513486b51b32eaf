//! Advisory token accounting.
//!
//! Prompt tokens are counted over the serialized upstream payload and
//! completion tokens over the answer text, both with the `cl100k_base`
//! encoding. The numbers are reported as OpenAI `usage` metadata only.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!(error = %e, "Failed to load cl100k_base encoding, token usage disabled");
        None
    }
});

/// Count tokens in `text`. Returns 0 when the encoding is unavailable.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    CL100K
        .as_ref()
        .map(|bpe| bpe.encode_with_special_tokens(text).len())
        .unwrap_or(0)
}

/// OpenAI-shaped usage block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Accumulates answer text for one call and produces the final usage.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    model: String,
    prompt_tokens: usize,
    output: String,
}

impl TokenCounter {
    /// Start counting for a call whose serialized payload is `prompt`.
    pub fn new(model: impl Into<String>, prompt: &str) -> Self {
        Self {
            model: model.into(),
            prompt_tokens: count_tokens(prompt),
            output: String::new(),
        }
    }

    pub fn accumulate(&mut self, content: &str) {
        self.output.push_str(content);
    }

    /// Replace accumulated output with the authoritative aggregate text.
    pub fn set_output(&mut self, content: &str) {
        self.output.clear();
        self.output.push_str(content);
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Compute usage and record it in the token metrics.
    pub fn finalize(&self) -> TokenUsage {
        let completion_tokens = count_tokens(&self.output);
        let usage = TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens,
            total_tokens: self.prompt_tokens + completion_tokens,
        };

        let metrics = crate::core::metrics::get_metrics();
        metrics
            .token_usage
            .with_label_values(&[&self.model, "prompt"])
            .inc_by(usage.prompt_tokens as u64);
        metrics
            .token_usage
            .with_label_values(&[&self.model, "completion"])
            .inc_by(usage.completion_tokens as u64);

        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_empty() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_count_tokens_non_empty() {
        assert!(count_tokens("Hello world") > 0);
    }

    #[test]
    fn test_finalize_sums_tokens() {
        let mut counter = TokenCounter::new("gpt-4o", r#"{"messages":[]}"#);
        counter.accumulate("Hello");
        counter.accumulate(" world");

        let usage = counter.finalize();
        assert!(usage.prompt_tokens > 0);
        assert!(usage.completion_tokens > 0);
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
    }

    #[test]
    fn test_set_output_replaces_accumulated_text() {
        let mut counter = TokenCounter::new("gpt-4o", "");
        counter.accumulate("partial");
        counter.set_output("Hello world");
        assert_eq!(counter.output(), "Hello world");
    }
}
