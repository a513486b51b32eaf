//! API layer for the Genspark proxy server.
//!
//! This module contains all HTTP handlers, request/response models,
//! streaming support and the router that wires them together.

pub mod disconnect;
pub mod handlers;
pub mod models;
pub mod streaming;

use crate::core::middleware::{access_control_middleware, request_id_middleware, MetricsMiddleware};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// Re-export commonly used types
pub use handlers::{
    chat_completions, health, images_generations, list_models, metrics_handler, AppState,
};
pub use models::{
    ChatCompletionRequest, ChatCompletionResponse, ImageGenerationRequest,
    ImageGenerationResponse, ModelList,
};
pub use streaming::sse_response;

/// Build the full router.
///
/// The OpenAI-compatible routes live under the configured route prefix and
/// sit behind access control; `/health` and `/metrics` are always at the root.
pub fn build_router(state: Arc<AppState>) -> Router {
    let prefix = state.config.server.route_prefix.clone();

    let api_routes = Router::new()
        .route(&format!("{}/v1/chat/completions", prefix), post(chat_completions))
        .route(
            &format!("{}/v1/images/generations", prefix),
            post(images_generations),
        )
        .route(&format!("{}/v1/models", prefix), get(list_models))
        .layer(axum::middleware::from_fn_with_state(
            state.access.clone(),
            access_control_middleware,
        ))
        .layer(axum::middleware::from_fn(MetricsMiddleware::track_metrics));

    Router::new()
        .merge(api_routes)
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
