//! Control surface: Axum web server for operating the engine.
//!
//! Serves status views and start/stop/configure endpoints over JSON.
//! CORS is open so a local UI shell can call it.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use routes::AppState;

/// Bind `port` and serve the control surface in a background task.
pub async fn spawn_dashboard(state: AppState, port: u16) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control surface on port {port}"))?;
    info!(port, "Control surface listening on http://localhost:{port}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Control surface server error");
        }
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Views
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .route("/api/equity", get(routes::get_equity))
        .route("/api/logs", get(routes::get_logs))
        .route("/api/positions", get(routes::get_positions))
        .route("/api/trades", get(routes::get_trades))
        .route(
            "/api/broker-config",
            get(routes::get_broker_config).post(routes::post_broker_config),
        )
        // Control
        .route("/api/test-connection", post(routes::post_test_connection))
        .route("/api/engine/start", post(routes::post_engine_start))
        .route("/api/engine/stop", post(routes::post_engine_stop))
        .route("/api/scheduler", post(routes::post_scheduler))
        .route("/api/kill-switch/reset", post(routes::post_reset_kill_switch))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
