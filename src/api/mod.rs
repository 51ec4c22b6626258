//! HTTP API layer, built on Axum.
//!
//! # Endpoints
//!
//! ## RAG (`/api/rag`)
//! - `POST /api/rag/ask` - Answer a question with the adaptive pipeline
//! - `POST /api/rag/ask-stream` - Same, streaming answer deltas
//! - `POST /api/rag/feedback` - Rate a previous answer by `query_id`
//! - `POST /api/rag/ingest` - Index pre-chunked records
//! - `GET /api/rag/cache/stats` - Answer/classification cache counters
//! - `POST /api/rag/cache/clear` - Drop the answer cache
//! - `GET /api/rag/bandit` - Bandit arm posteriors and cold-start flag
//!
//! ## Health
//! - `GET /healthz` - Liveness check

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the application router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/rag/ask", post(handlers::ask))
        .route("/api/rag/ask-stream", post(handlers::ask_stream))
        .route("/api/rag/feedback", post(handlers::feedback))
        .route("/api/rag/ingest", post(handlers::ingest))
        .route("/api/rag/cache/stats", get(handlers::cache_stats))
        .route("/api/rag/cache/clear", post(handlers::cache_clear))
        .route("/api/rag/bandit", get(handlers::bandit_status))
        .route("/healthz", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
