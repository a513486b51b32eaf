//! HTTP request handlers for the Genspark proxy API.
//!
//! This module contains all endpoint handlers including chat completions,
//! image generation, model listing, health checks, and metrics.

use crate::api::models::*;
use crate::api::streaming::sse_response;
use crate::core::config::AppConfig;
use crate::core::logging::get_request_id;
use crate::core::middleware::{AccessControl, ModelName};
use crate::core::{AppError, Result};
use crate::services::Orchestrator;
use crate::transformer::supported_models;
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Fixed creation timestamp reported for every listed model.
const MODEL_CREATED: i64 = 1_626_777_600;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Orchestrator,
    pub access: Arc<AccessControl>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Orchestrator) -> Self {
        let access = Arc::new(AccessControl::from_config(&config));
        Self {
            config: Arc::new(config),
            orchestrator,
            access,
            started_at: Instant::now(),
        }
    }
}

fn with_model(mut response: Response, model: &str) -> Response {
    response
        .extensions_mut()
        .insert(ModelName(model.to_string()));
    response
}

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses.
#[tracing::instrument(
    skip(state, uri, payload),
    fields(model = %payload.model, stream = payload.stream)
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Json(payload): Json<ChatCompletionRequest>,
) -> Result<Response> {
    if payload.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".to_string()));
    }

    let model = payload.model.clone();
    tracing::debug!(
        request_id = %get_request_id(),
        messages = payload.messages.len(),
        "Processing chat completion request"
    );

    if payload.stream {
        let stream = state.orchestrator.chat_stream(payload).await?;
        return Ok(sse_response(stream, uri.path()));
    }

    let response = state.orchestrator.chat_completion(payload).await?;
    Ok(with_model(Json(response).into_response(), &model))
}

/// Handle image generation requests.
#[tracing::instrument(skip(state, payload), fields(model = %payload.model))]
pub async fn images_generations(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImageGenerationRequest>,
) -> Result<Response> {
    if payload.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("prompt must not be empty".to_string()));
    }

    let model = payload.model.clone();
    let response = state.orchestrator.generate_images(payload).await?;
    tracing::debug!(
        request_id = %get_request_id(),
        images = response.data.len(),
        "Image generation completed"
    );
    Ok(with_model(Json(response).into_response(), &model))
}

/// List available models.
pub async fn list_models() -> Json<ModelList> {
    let mut data: Vec<ModelInfo> = supported_models()
        .map(|id| ModelInfo {
            id: id.to_string(),
            object: "model".to_string(),
            created: MODEL_CREATED,
            owned_by: "genspark".to_string(),
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Basic health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = state.orchestrator.store();
    let available = store.snapshot().len();

    Json(json!({
        "status": if available > 0 { "ok" } else { "degraded" },
        "credentials": {
            "total": store.len(),
            "available": available,
        },
        "image_sessions": state.orchestrator.image_sessions().len(),
        "affinity_entries": state.orchestrator.affinity().len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(buffer.into())
        .map_err(|e| AppError::Internal(e.to_string()))
}
