use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::store::{SnapshotStore, StoreError};
use crate::view::{html, AggregatedView, AggregationView};

/// Shared state for axum handlers.
struct AppState {
    view: AggregationView,
    store: Arc<SnapshotStore>,
    health: Arc<HealthMetrics>,
}

/// One entry of `/api/snapshots`.
#[derive(Debug, Serialize)]
struct SnapshotSummary {
    timestamp: String,
    relays: usize,
}

/// HTTP surface: status page, JSON API, metrics and health probe.
pub struct StatusServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl StatusServer {
    pub fn new(
        addr: impl Into<String>,
        view: AggregationView,
        store: Arc<SnapshotStore>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            addr: addr.into(),
            state: Arc::new(AppState {
                view,
                store,
                health,
            }),
            shutdown: Mutex::new(None),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/", get(status_page_handler))
            .route("/api/status", get(status_json_handler))
            .route("/api/snapshots", get(snapshots_handler))
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the listener and serve in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = self.router();

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "status server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "status server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Render off the async workers; reads hit sled.
async fn render(state: &AppState) -> Result<AggregatedView, StoreError> {
    let view = state.view.clone();
    match tokio::task::spawn_blocking(move || view.render()).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Corrupt {
            key: String::new(),
            reason: format!("render task failed: {e}"),
        }),
    }
}

fn unavailable(e: &StoreError) -> Response {
    tracing::error!(error = %e, "reading snapshot store");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "snapshot storage unavailable".to_string(),
    )
        .into_response()
}

/// GET / - HTML status table.
async fn status_page_handler(State(state): State<Arc<AppState>>) -> Response {
    match render(&state).await {
        Ok(view) => Html(html::render_page(&view)).into_response(),
        Err(e) => unavailable(&e),
    }
}

/// GET /api/status - aggregated view as JSON.
async fn status_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match render(&state).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => unavailable(&e),
    }
}

/// GET /api/snapshots - stored cycles, oldest first.
async fn snapshots_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = Arc::clone(&state.store);
    let index = match tokio::task::spawn_blocking(move || store.index()).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Corrupt {
            key: String::new(),
            reason: format!("index task failed: {e}"),
        }),
    };

    match index {
        Ok(index) => {
            let summaries: Vec<SnapshotSummary> = index
                .into_iter()
                .map(|(timestamp, relays)| SnapshotSummary { timestamp, relays })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => unavailable(&e),
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.health.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
