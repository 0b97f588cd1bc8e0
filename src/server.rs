//! HTTP endpoint
//!
//! `GET /metrics` first scrapes every target concurrently on the blocking
//! pool, then gathers the registry. The registry collects one collector at a
//! time, so the collectors only replay the prefetched results.

use crate::collectors::{prefetch, PrometheusAdapter};
use crate::config::listen_address;
use crate::reconcile::{Reconciler, TargetStatus};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct ServerState {
    pub registry: Registry,
    pub engine: Arc<Reconciler<PrometheusAdapter>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Scrape all targets concurrently, then gather the registry
pub async fn gather(state: &ServerState) -> Result<Vec<MetricFamily>> {
    // Taking the handles can wait on a reconcile pass, keep it off the workers
    let engine = Arc::clone(&state.engine);
    let collectors = tokio::task::spawn_blocking(move || engine.handles())
        .await
        .context("listing collectors failed")?;
    prefetch(collectors).await;

    let registry = state.registry.clone();
    tokio::task::spawn_blocking(move || registry.gather())
        .await
        .context("gathering metrics failed")
}

async fn metrics(State(state): State<ServerState>) -> Response {
    let families = match gather(&state).await {
        Ok(families) => families,
        Err(e) => {
            error!("Failed to gather metrics: {:#}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to gather metrics").into_response();
        }
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<ServerState>) -> Json<Vec<TargetStatus>> {
    Json(state.engine.snapshot())
}

/// Bind the listener for a `bind` setting such as `:9123` or `127.0.0.1:9123`
pub async fn bind(bind: &str) -> Result<TcpListener> {
    let address = listen_address(bind);
    TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to listen on {}", address))
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr().context("listener has no local address")?;
    info!("Starting metrics server on http://{}", local);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("metrics server failed")
}
