//! HTTP middleware for request ids, access control and metrics.
//!
//! Layer order in the router is request id outermost, then metrics, then
//! access control, so rejected calls are still counted and every log line
//! carries the request id.

use crate::core::config::AppConfig;
use crate::core::error::AppError;
use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use crate::core::rate_limiter::RateLimiter;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Key used for rate limiting callers when no secret is presented.
const ANONYMOUS_KEY: &str = "anonymous";

/// Extension type for storing model name in response
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Run the rest of the stack inside a fresh [`REQUEST_ID`] scope.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = generate_request_id();
    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Shared-secret authentication plus per-caller rate limiting.
pub struct AccessControl {
    secrets: Vec<String>,
    limiter: RateLimiter,
}

impl AccessControl {
    pub fn new(secrets: Vec<String>, limiter: RateLimiter) -> Self {
        Self { secrets, limiter }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.api_secrets.clone(), RateLimiter::new(&config.rate_limit))
    }

    pub fn auth_enabled(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Validate the caller and return its rate-limit key.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<String, AppError> {
        let presented = extract_bearer(headers);

        if !self.auth_enabled() {
            return Ok(ANONYMOUS_KEY.to_string());
        }

        match presented {
            Some(secret) if self.secrets.iter().any(|s| s == secret) => Ok(secret.to_string()),
            _ => Err(AppError::Unauthorized),
        }
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let key = self.authorize(headers)?;
        self.limiter.check_rate_limit(&key)
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Reject unauthenticated or over-limit callers before they reach a handler.
pub async fn access_control_middleware(
    State(access): State<Arc<AccessControl>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = access.check(request.headers()) {
        return e.into_response();
    }
    next.run(request).await
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Count requests and observe their duration by endpoint, model and status.
    ///
    /// For streaming responses the duration covers the time until headers
    /// were produced, which is when the stream committed.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().to_string();

        if endpoint.ends_with("/metrics") {
            return next.run(request).await;
        }

        let metrics = get_metrics();
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();

        let model = response
            .extensions()
            .get::<ModelName>()
            .map(|m| m.0.as_str())
            .unwrap_or("unknown");

        metrics
            .request_count
            .with_label_values(&[&method, &endpoint, model, &status_code])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method, &endpoint, model])
            .observe(duration);
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .dec();

        if model != "unknown" {
            tracing::info!(
                "{} {} model={} status={} duration={:.3}s",
                method,
                endpoint,
                model,
                status_code,
                duration
            );
        }

        response
    }
}
