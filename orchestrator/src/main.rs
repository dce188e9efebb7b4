use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use orchestrator::api;
use orchestrator::config::OrchestratorConfig;
use orchestrator::registry::{SessionRegistry, StoragePolicy};
use orchestrator::runner::{HttpSandboxRunner, NoopRunner, SharedSandboxRunner};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;
    tracing::info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        lease_ttl_secs = config.lease_ttl.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        session_idle_secs = config.session_idle_timeout.as_secs(),
        "Starting session orchestrator"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

    let runner: SharedSandboxRunner = match &config.runner_url {
        Some(url) => {
            tracing::info!(runner_url = %url, "Dispatching executions over HTTP");
            Arc::new(HttpSandboxRunner::new(url.clone()))
        }
        None => {
            tracing::warn!("ORCHESTRATOR_RUNNER_URL not set; runners must poll for work");
            Arc::new(NoopRunner)
        }
    };

    let registry = SessionRegistry::new(
        StoragePolicy::Directory(config.data_dir.clone()),
        runner,
        config.session_settings()?,
    );

    // Spawn idle watchdog
    tokio::spawn(registry.clone().run_idle_watchdog());

    let allowed_origins = config
        .cors_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS origin {origin}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    let app = api::router()
        .with_state(api::ApiState {
            registry: registry.clone(),
        })
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Starting HTTP server on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down session actors");
    registry.shutdown().await;
    Ok(())
}
