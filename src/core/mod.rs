//! Core functionality for the Genspark proxy server.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging context and metrics collection
//! - HTTP middleware
//! - Background job execution

pub mod background;
pub mod cancel;
pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod token_counter;

// Re-export commonly used types
pub use background::BackgroundTasks;
pub use cancel::StreamCancelHandle;
pub use config::{AppConfig, ConversationPolicy, ServerConfig};
pub use error::{AppError, Result};
pub use error_types::FailureReason;
pub use logging::{get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{access_control_middleware, request_id_middleware, AccessControl, MetricsMiddleware};
pub use rate_limiter::RateLimiter;
