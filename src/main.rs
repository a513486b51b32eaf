//! Genspark Proxy Server - Main entry point
//!
//! This binary creates and runs the HTTP server with all configured routes and middleware.
//! Configuration is loaded from the environment (and an optional `.env` file).

use anyhow::Result;
use chrono::Local;
use genspark_proxy::{
    build_router,
    core::{init_metrics, AppConfig, BackgroundTasks},
    AppState, GensparkClient, Orchestrator,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or_else(num_cpus_fallback));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing(debug: bool) {
    // Check if NO_COLOR environment variable is set (for file logging without ANSI codes)
    let no_color = std::env::var("NO_COLOR").is_ok();

    let default_filter = if debug {
        "info,genspark_proxy=debug"
    } else {
        "info"
    };
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    // Always suppress noisy HTTP library logs regardless of RUST_LOG setting
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    if no_color {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }
}

async fn async_main() -> Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(config.debug);

    init_metrics();

    tracing::info!(
        credentials = config.credentials.len(),
        image_sessions = config.image_session_map.len(),
        fixed_conversations = config.model_chat_map.len(),
        auth = !config.api_secrets.is_empty(),
        auto_record = config.conversation_policy.auto_record,
        auto_delete = config.conversation_policy.auto_delete,
        "Configuration loaded"
    );

    let client = GensparkClient::from_config(&config)?;
    let background = BackgroundTasks::start();
    let orchestrator = Orchestrator::new(&config, client, background.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let prefix = config.server.route_prefix.clone();
    let state = Arc::new(AppState::new(config, orchestrator));
    let app = build_router(state);

    tracing::info!("Starting Genspark Proxy on {}", addr);
    tracing::info!(
        "OpenAI API: {p}/v1/chat/completions, {p}/v1/images/generations, {p}/v1/models",
        p = prefix
    );
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(pending = background.pending(), "Draining background jobs");
    background.idle().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // Try cgroup v2 first
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // Fallback to cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 {
        let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
        println!("Detected CPU limit from cgroup v1: {} cores", cores);
        Some(cores)
    } else {
        None
    }
}
