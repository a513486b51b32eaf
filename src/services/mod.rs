//! Business logic services for the Genspark proxy.
//!
//! Credential rotation, conversation bookkeeping, the upstream client and
//! the failover orchestrator that ties them together.

pub mod chat_stream;
pub mod credential_pool;
pub mod image_poller;
pub mod image_sessions;
pub mod orchestrator;
pub mod session_registry;
pub mod upstream;

// Re-export commonly used types
pub use chat_stream::{ChatStream, StreamItem};
pub use credential_pool::{Credential, CredentialPool, CredentialStore, DrawStrategy, PoolError};
pub use image_poller::ImageTaskPoller;
pub use image_sessions::ImageSessionMap;
pub use orchestrator::Orchestrator;
pub use session_registry::SessionAffinityRegistry;
pub use upstream::GensparkClient;
