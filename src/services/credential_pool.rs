//! Upstream session credentials and their rate-limit cooldowns.
//!
//! [`CredentialStore`] is the long-lived, shared owner of the credential
//! list and the cooldown side table. Each call takes a point-in-time
//! [`CredentialPool`] snapshot from it, which excludes credentials under a
//! live cooldown and carries its own draw cursor.

use crate::core::error::AppError;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Opaque upstream session token. Identity is the token value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    /// Raw token, for the upstream `Cookie` header only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short stable identifier that is safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.fingerprint())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// How the next credential is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStrategy {
    Sequential,
    Random,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("credential pool is empty")]
    Empty,
    #[error("credential not found in pool")]
    NotFound,
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Empty => AppError::NoCredentials,
            PoolError::NotFound => AppError::Internal(err.to_string()),
        }
    }
}

/// Shared credential list plus the cooldown side table.
pub struct CredentialStore {
    credentials: RwLock<Vec<Credential>>,
    cooldowns: DashMap<Credential, Instant>,
}

impl CredentialStore {
    pub fn new<I, S>(credentials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            credentials: RwLock::new(credentials.into_iter().map(Credential::new).collect()),
            cooldowns: DashMap::new(),
        }
    }

    /// Number of configured credentials, cooldowns included.
    pub fn len(&self) -> usize {
        self.credentials.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a pool of the credentials without a live cooldown.
    pub fn snapshot(&self) -> CredentialPool {
        let all = match self.credentials.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let available: Vec<Credential> = all
            .into_iter()
            .filter(|c| !self.is_rate_limited(c))
            .collect();
        CredentialPool::new(available)
    }

    /// Whether `credential` is under a live cooldown.
    ///
    /// An expired entry is purged on inspection.
    pub fn is_rate_limited(&self, credential: &Credential) -> bool {
        let now = Instant::now();
        let expired = match self.cooldowns.get(credential) {
            Some(expires_at) if *expires_at > now => return true,
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cooldowns.remove_if(credential, |_, expires_at| *expires_at <= now);
            tracing::debug!(credential = %credential, "Credential cooldown expired");
        }
        false
    }

    /// Exclude `credential` from snapshots for `cooldown`.
    pub fn mark_rate_limited(&self, credential: &Credential, cooldown: Duration) {
        self.cooldowns
            .insert(credential.clone(), Instant::now() + cooldown);
        tracing::info!(
            credential = %credential,
            cooldown_secs = cooldown.as_secs(),
            "Credential placed under cooldown"
        );
    }

    /// Drop `credential` from the store entirely.
    pub fn remove(&self, credential: &Credential) -> Result<(), PoolError> {
        let mut guard = match self.credentials.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let index = guard
            .iter()
            .position(|c| c == credential)
            .ok_or(PoolError::NotFound)?;
        guard.remove(index);
        self.cooldowns.remove(credential);
        tracing::warn!(credential = %credential, remaining = guard.len(), "Credential removed");
        Ok(())
    }
}

/// Point-in-time ordered sequence of usable credentials with a draw cursor.
///
/// Owned by a single call; never shared.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: usize,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Draw the next credential.
    ///
    /// Sequential draws advance the cursor modulo the pool size before
    /// reading it. Random draws move the cursor to the drawn index so a
    /// following sequential draw continues from there.
    pub fn draw(&mut self, strategy: DrawStrategy) -> Result<Credential, PoolError> {
        if self.credentials.is_empty() {
            return Err(PoolError::Empty);
        }
        match strategy {
            DrawStrategy::Sequential => {
                self.cursor = (self.cursor + 1) % self.credentials.len();
            }
            DrawStrategy::Random => {
                self.cursor = rand::thread_rng().gen_range(0..self.credentials.len());
            }
        }
        Ok(self.credentials[self.cursor].clone())
    }

    /// Remove `credential` from this snapshot and reset the cursor.
    pub fn remove(&mut self, credential: &Credential) -> Result<(), PoolError> {
        let index = self
            .credentials
            .iter()
            .position(|c| c == credential)
            .ok_or(PoolError::NotFound)?;
        self.credentials.remove(index);
        self.cursor = 0;
        Ok(())
    }
}
