//! `mengla-collector` entry point: loads configuration, wires the shared
//! dependency container, recovers stale sync-task logs from a prior
//! process, starts the fixed job table, and serves the webhook + admin
//! HTTP surface until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use mengla_collector::config::Config;
use mengla_collector::{admin, webhook, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load();
    tracing::info!(version = mengla_collector::VERSION, env = %config.env, "starting {}", mengla_collector::NAME);

    let state = Arc::new(AppState::build(config.clone()).await?);

    match state.scheduler.recover_on_startup().await {
        Ok(n) if n > 0 => tracing::warn!(recovered = n, "recovered stale sync-task logs from a prior process"),
        Ok(_) => {}
        Err(err) => tracing::error!(%err, "startup recovery failed"),
    }

    let _job_handles = state.scheduler.clone().spawn_all(&config);

    let cors = build_cors(&config);

    let app = axum::Router::new()
        .merge(webhook::router())
        .merge(admin::build(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", std::env::var("PORT").unwrap_or_else(|_| "8080".into()))
        .parse()
        .expect("PORT must be a valid port number");
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

fn build_cors(config: &Config) -> CorsLayer {
    let origins = config.cors_origins();
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new().allow_origin(parsed).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
