mod config;
mod error;
mod gateway;
mod handlers;
mod memory;
mod utils;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    Router,
    http::HeaderName,
    routing::{get, post},
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};

use crate::{config::Config, gateway::HttpGateway, memory::SessionManager};

#[derive(Debug, Parser)]
#[command(name = "llama-recall", version, about = "Chat session server with cross-session memory")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// Socket address to bind to, overrides the configured host and port
    #[arg(long)]
    socket_addr: Option<SocketAddr>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

pub(crate) struct AppState {
    pub manager: Arc<SessionManager>,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .route(
            "/v1/sessions",
            post(handlers::create_session_handler).get(handlers::list_sessions_handler),
        )
        .route("/v1/sessions/current", get(handlers::current_session_handler))
        .route("/v1/sessions/{id}", get(handlers::get_session_handler))
        .route("/v1/sessions/{id}/turns", post(handlers::submit_turn_handler))
        .route("/v1/sessions/{id}/close", post(handlers::close_session_handler))
        .route("/v1/sessions/{id}/summary", post(handlers::retry_summary_handler))
        .route(
            "/v1/memory",
            get(handlers::memory_handler).delete(handlers::clear_memory_handler),
        )
        .route(
            "/v1/memory/mode",
            get(handlers::memory_mode_handler).put(handlers::set_memory_mode_handler),
        )
        .route("/v1/stats", get(handlers::stats_handler))
        .route("/v1/health", get(handlers::health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(PropagateRequestIdLayer::new(x_request_id))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = utils::init_logging(&cli.log_level, cli.log_file.as_deref())?;

    dual_info!("llama-recall version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    dual_info!(
        "Completion service: {} (model: {}, timeout: {}s)",
        config.gateway.base_url,
        config.gateway.model,
        config.gateway.timeout_secs
    );
    dual_info!(
        "Memory: {}, history limit: {}",
        if config.memory.enable { "on" } else { "off" },
        config.session.history_limit
    );

    let cancel_token = CancellationToken::new();
    let gateway = Arc::new(HttpGateway::new(&config.gateway, cancel_token.clone()));
    let manager = SessionManager::new(gateway, &config.memory, &config.session);
    let state = Arc::new(AppState {
        manager: Arc::new(manager),
    });

    let addr = match cli.socket_addr {
        Some(addr) => addr,
        None => format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid server address {}:{}",
                    config.server.host, config.server.port
                )
            })?,
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    dual_info!("Listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await
        .context("Server error")?;

    dual_info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        dual_error!("Failed to listen for the shutdown signal: {}", e);
    }

    dual_info!("Shutdown signal received, cancelling in-flight completions");
    cancel_token.cancel();
}
