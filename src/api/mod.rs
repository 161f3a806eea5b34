//! HTTP surface.
//!
//! Handlers receive their dependencies through [`AppState`]; nothing here
//! owns background work. Read endpoints answer from the store and in-memory
//! status and never trigger upstream fetches.

pub mod routes;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::ensemble::ModelManager;
use crate::explain::ExplanationService;
use crate::ingest::cache::ResponseCache;
use crate::ingest::engine::IngestionStatusHandle;
use crate::ingest::governor::RateGovernor;
use crate::store::ProjectionStore;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ProjectionStore>,
    pub ingestion: IngestionStatusHandle,
    pub governor: Arc<RateGovernor>,
    pub cache: Arc<ResponseCache>,
    pub manager: Arc<ModelManager>,
    pub explainer: Arc<ExplanationService>,
    pub config: Arc<Config>,
    pub started_at: Instant,
    /// Set by the supervisor once the listener is bound.
    pub bound_port: Arc<AtomicU16>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    pub fn set_port(&self, port: u16) {
        self.bound_port.store(port, Ordering::Release);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status/training", get(routes::status_training))
        .route("/status/ingestion", get(routes::status_ingestion))
        .route("/api/prizepicks/projections", get(routes::get_projections))
        .route(
            "/api/predictions/prizepicks/enhanced",
            get(routes::get_enhanced_predictions),
        )
        .route("/api/propollama/chat", post(routes::propollama_chat))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

/// Request log line with method, path, status, and latency. `/health` is the
/// discovery probe target and stays out of the logs.
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let start = std::time::Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        warn!(%method, path, status, latency_ms, "request failed");
    } else {
        info!(%method, path, status, latency_ms, "request completed");
    }
    response
}
