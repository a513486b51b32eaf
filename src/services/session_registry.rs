//! Session affinity: (credential, logical model) -> upstream conversation id.
//!
//! Backed by a sharded `DashMap`, so lookups for one key never wait on
//! writes to an unrelated key. Entries have no TTL. Concurrent calls on the
//! same key may both open a conversation; the last `record` wins.

use crate::services::credential_pool::Credential;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AffinityKey {
    credential: Credential,
    model: String,
}

#[derive(Default)]
pub struct SessionAffinityRegistry {
    entries: DashMap<AffinityKey, String>,
}

impl SessionAffinityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(credential: &Credential, model: &str) -> AffinityKey {
        AffinityKey {
            credential: credential.clone(),
            model: model.to_string(),
        }
    }

    /// Remember the conversation used for `(credential, model)`, overwriting.
    pub fn record(&self, credential: &Credential, model: &str, conversation_id: &str) {
        let previous = self
            .entries
            .insert(Self::key(credential, model), conversation_id.to_string());
        tracing::debug!(
            credential = %credential,
            model = %model,
            conversation_id = %conversation_id,
            replaced = ?previous,
            "Recorded session affinity"
        );
    }

    pub fn lookup(&self, credential: &Credential, model: &str) -> Option<String> {
        self.entries
            .get(&Self::key(credential, model))
            .map(|entry| entry.value().clone())
    }

    pub fn forget(&self, credential: &Credential, model: &str) {
        self.entries.remove(&Self::key(credential, model));
    }

    /// Every conversation currently associated with `credential`.
    pub fn list_conversations(&self, credential: &Credential) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.key().credential == *credential)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_then_lookup() {
        let registry = SessionAffinityRegistry::new();
        let credential = Credential::new("a");

        registry.record(&credential, "gpt-4o", "conv-1");
        assert_eq!(registry.lookup(&credential, "gpt-4o").as_deref(), Some("conv-1"));
        assert_eq!(registry.lookup(&credential, "claude-3-5-sonnet"), None);
        assert_eq!(registry.lookup(&Credential::new("b"), "gpt-4o"), None);
    }

    #[test]
    fn test_forget_then_lookup() {
        let registry = SessionAffinityRegistry::new();
        let credential = Credential::new("a");

        registry.record(&credential, "gpt-4o", "conv-1");
        registry.forget(&credential, "gpt-4o");
        assert_eq!(registry.lookup(&credential, "gpt-4o"), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_last_record_wins() {
        let registry = SessionAffinityRegistry::new();
        let credential = Credential::new("a");

        registry.record(&credential, "gpt-4o", "conv-1");
        registry.record(&credential, "gpt-4o", "conv-2");
        assert_eq!(registry.lookup(&credential, "gpt-4o").as_deref(), Some("conv-2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_conversations_filters_by_credential() {
        let registry = SessionAffinityRegistry::new();
        let a = Credential::new("a");
        let b = Credential::new("b");

        registry.record(&a, "gpt-4o", "conv-1");
        registry.record(&a, "deep-seek-r1", "conv-2");
        registry.record(&b, "gpt-4o", "conv-3");

        let mut conversations = registry.list_conversations(&a);
        conversations.sort();
        assert_eq!(conversations, vec!["conv-1", "conv-2"]);
    }

    #[tokio::test]
    async fn test_concurrent_records_on_distinct_keys() {
        let registry = Arc::new(SessionAffinityRegistry::new());
        let credential = Credential::new("a");

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                let credential = credential.clone();
                tokio::spawn(async move {
                    registry.record(&credential, &format!("model-{}", i), &format!("conv-{}", i));
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 32);
        assert_eq!(
            registry.lookup(&credential, "model-7").as_deref(),
            Some("conv-7")
        );
    }
}
