//! Axum HTTP server: router, listener, graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use netrelay::RelayClient;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::forward;
use crate::stats::ProxyStats;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub relay_client: RelayClient,
    pub stats: ProxyStats,
    pub capture_enabled: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/stats", get(handle_get_stats))
        .route("/api/capture", get(handle_get_capture).put(handle_set_capture))
        .fallback(handle_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "netrelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("netrelay shut down gracefully");
    Ok(())
}

/// Forward any request not matching an explicit route to the upstream.
async fn handle_fallback(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!(
        "{}{path}{query}",
        state.config.upstream.url.trim_end_matches('/')
    );

    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), state.config.server.max_request_bytes).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let captured = state.capture_enabled.load(Ordering::Relaxed);
    let span = netrelay_tracing::proxy_request_span!(&method, &path);
    span.record("captured", captured);

    async {
        if captured {
            forward::forward_relayed(&state.relay_client, method, &url, &headers, body).await
        } else {
            state.stats.inc_passthrough();
            forward::forward_passthrough(state.relay_client.client(), method, &url, &headers, body)
                .await
        }
    }
    .instrument(span)
    .await
}

async fn handle_get_stats(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(state.stats.snapshot()).into_response()
}

async fn handle_get_capture(State(state): State<Arc<AppState>>) -> Response {
    let enabled = state.capture_enabled.load(Ordering::Relaxed);
    axum::Json(serde_json::json!({ "enabled": enabled })).into_response()
}

async fn handle_set_capture(
    State(state): State<Arc<AppState>>,
    axum::Json(payload): axum::Json<serde_json::Value>,
) -> Response {
    let enabled = match payload.get("enabled").and_then(|v| v.as_bool()) {
        Some(e) => e,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({ "error": "missing 'enabled' boolean field" })),
            )
                .into_response();
        }
    };
    state.capture_enabled.store(enabled, Ordering::Relaxed);
    tracing::info!(enabled, "Capture toggled");
    axum::Json(serde_json::json!({ "enabled": enabled })).into_response()
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
