//! Pre-provisioned image conversations, one per credential.
//!
//! The table is loaded from configuration and only changes through explicit
//! `add`/`remove`. Draws share the credential pool's cursor semantics.

use crate::services::credential_pool::{Credential, DrawStrategy, PoolError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<Credential, String>,
    keys: Vec<Credential>,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct ImageSessionMap {
    inner: Mutex<Inner>,
}

impl ImageSessionMap {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut inner = Inner::default();
        for (credential, conversation_id) in entries {
            let credential = Credential::new(credential);
            if inner
                .map
                .insert(credential.clone(), conversation_id.into())
                .is_none()
            {
                inner.keys.push(credential);
            }
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry under the cursor, without moving it.
    #[cfg(test)]
    pub fn current(&self) -> Result<(Credential, String), PoolError> {
        let inner = self.lock();
        let credential = inner.keys.get(inner.cursor).ok_or(PoolError::Empty)?;
        let conversation_id = inner.map.get(credential).ok_or(PoolError::Empty)?;
        Ok((credential.clone(), conversation_id.clone()))
    }

    /// Draw an entry using the same semantics as the credential pool.
    pub fn draw(&self, strategy: DrawStrategy) -> Result<(Credential, String), PoolError> {
        let mut inner = self.lock();
        if inner.keys.is_empty() {
            return Err(PoolError::Empty);
        }
        let len = inner.keys.len();
        inner.cursor = match strategy {
            DrawStrategy::Sequential => (inner.cursor + 1) % len,
            DrawStrategy::Random => rand::thread_rng().gen_range(0..len),
        };
        let credential = inner.keys[inner.cursor].clone();
        let conversation_id = inner.map.get(&credential).cloned().ok_or(PoolError::Empty)?;
        Ok((credential, conversation_id))
    }

    pub fn next(&self) -> Result<(Credential, String), PoolError> {
        self.draw(DrawStrategy::Sequential)
    }

    pub fn random(&self) -> Result<(Credential, String), PoolError> {
        self.draw(DrawStrategy::Random)
    }

    /// Add or replace the conversation for `credential`.
    pub fn add(&self, credential: Credential, conversation_id: impl Into<String>) {
        let mut inner = self.lock();
        if inner
            .map
            .insert(credential.clone(), conversation_id.into())
            .is_none()
        {
            inner.keys.push(credential);
        }
    }

    /// Remove `credential`, clamping the cursor to the last entry.
    pub fn remove(&self, credential: &Credential) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if inner.map.remove(credential).is_none() {
            return Err(PoolError::NotFound);
        }
        inner.keys.retain(|k| k != credential);
        if inner.cursor >= inner.keys.len() {
            inner.cursor = inner.keys.len().saturating_sub(1);
        }
        Ok(())
    }

    pub fn contains_conversation(&self, conversation_id: &str) -> bool {
        self.lock().map.values().any(|id| id == conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample() -> ImageSessionMap {
        ImageSessionMap::new([("a", "conv-a"), ("b", "conv-b"), ("c", "conv-c")])
    }

    #[test]
    fn test_next_round_robin() {
        let map = sample();
        let drawn: Vec<String> = (0..3).map(|_| map.next().unwrap().1).collect();
        assert_eq!(drawn, vec!["conv-b", "conv-c", "conv-a"]);
    }

    #[test]
    fn test_current_does_not_advance() {
        let map = sample();
        assert_eq!(map.current().unwrap().1, "conv-a");
        assert_eq!(map.current().unwrap().1, "conv-a");
    }

    #[test]
    fn test_random_then_next_continues() {
        let map = sample();
        let (first, _) = map.random().unwrap();
        let (second, _) = map.next().unwrap();
        assert_ne!(first, second);
        let all: HashSet<_> = ["a", "b", "c"].iter().map(Credential::new).collect();
        assert!(all.contains(&first));
    }

    #[test]
    fn test_remove_clamps_cursor() {
        let map = sample();
        map.next().unwrap();
        map.next().unwrap();
        map.remove(&Credential::new("c")).unwrap();
        assert_eq!(map.current().unwrap().1, "conv-b");
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(&Credential::new("c")), Err(PoolError::NotFound));
    }

    #[test]
    fn test_add_and_contains() {
        let map = ImageSessionMap::default();
        assert_eq!(map.next(), Err(PoolError::Empty));
        assert_eq!(map.current(), Err(PoolError::Empty));

        map.add(Credential::new("a"), "conv-a");
        map.add(Credential::new("a"), "conv-a2");
        assert_eq!(map.len(), 1);
        assert!(map.contains_conversation("conv-a2"));
        assert!(!map.contains_conversation("conv-a"));
    }
}
