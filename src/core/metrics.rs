//! Prometheus metrics for monitoring the proxy.
//!
//! This module provides a centralized metrics registry for tracking inbound
//! requests, upstream attempts, credential failover and token usage.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, model and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Upstream dispatch attempts by call kind and outcome
    pub upstream_attempts: IntCounterVec,

    /// Credential switches after a recoverable failure
    pub credential_failovers: IntCounterVec,

    /// Classified upstream failures by reason
    pub upstream_failures: IntCounterVec,

    /// Total token usage by model and token type
    pub token_usage: IntCounterVec,

    /// Callers that went away before their stream finished
    pub client_disconnects: IntCounterVec,

    /// Detached background jobs that failed
    pub background_failures: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "genspark_proxy_requests_total",
            "Total number of requests",
            &["method", "endpoint", "model", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "genspark_proxy_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "model"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "genspark_proxy_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let upstream_attempts = register_int_counter_vec!(
            "genspark_proxy_upstream_attempts_total",
            "Upstream dispatch attempts",
            &["kind", "outcome"]
        )
        .expect("Failed to register upstream_attempts metric");

        let credential_failovers = register_int_counter_vec!(
            "genspark_proxy_credential_failovers_total",
            "Credential switches after recoverable upstream failures",
            &["kind", "reason"]
        )
        .expect("Failed to register credential_failovers metric");

        let upstream_failures = register_int_counter_vec!(
            "genspark_proxy_upstream_failures_total",
            "Classified upstream failures",
            &["reason"]
        )
        .expect("Failed to register upstream_failures metric");

        let token_usage = register_int_counter_vec!(
            "genspark_proxy_tokens_total",
            "Total number of tokens used",
            &["model", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        let client_disconnects = register_int_counter_vec!(
            "genspark_proxy_client_disconnects_total",
            "Streams abandoned by the caller",
            &["endpoint"]
        )
        .expect("Failed to register client_disconnects metric");

        let background_failures = register_int_counter_vec!(
            "genspark_proxy_background_failures_total",
            "Failed detached background jobs",
            &["job"]
        )
        .expect("Failed to register background_failures metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            upstream_attempts,
            credential_failovers,
            upstream_failures,
            token_usage,
            client_disconnects,
            background_failures,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
