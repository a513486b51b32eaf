//! Genspark Proxy Server - an OpenAI-compatible front for Genspark
//!
//! This library exposes `/v1/chat/completions`, `/v1/images/generations` and
//! `/v1/models` on top of the Genspark web backend, with features including:
//!
//! - **Credential Rotation**: A pool of session cookies with per-credential cooldowns
//! - **Failover**: Recoverable upstream failures retry on the next credential
//! - **Session Affinity**: Follow-up calls reuse the upstream conversation
//! - **Streaming Support**: Upstream events translated to OpenAI SSE chunks
//! - **Image Generation**: Task dispatch and polling until images are ready
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! The codebase is organized into four layers:
//!
//! - [`core`]: Core functionality (config, errors, logging, metrics, middleware)
//! - [`services`]: Credential pool, registries, upstream client, orchestrator
//! - [`transformer`]: Payload building, media normalization, stream classification
//! - [`api`]: HTTP handlers, SSE rendering and request/response models
//!
//! # Configuration
//!
//! The server requires the following environment variable:
//! - `GS_COOKIE`: Comma separated Genspark session cookies
//!
//! Optional environment variables:
//! - `API_SECRET`: Comma separated bearer secrets (empty disables auth)
//! - `HOST` / `PORT`: Server bind address (default: 0.0.0.0:7055)
//! - `REQUEST_OUT_TIME` / `STREAM_REQUEST_OUT_TIME`: Timeouts in seconds (default: 300)
//! - `PROXY_URL`: Outbound proxy for upstream traffic

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

// Re-export commonly used types for convenience
pub use crate::api::{build_router, AppState, ChatCompletionRequest, ChatCompletionResponse};
pub use crate::core::{AppConfig, AppError, BackgroundTasks, Result};
pub use crate::services::{GensparkClient, Orchestrator};
