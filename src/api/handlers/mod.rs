//! API request handlers.

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;

use crate::types::{
    AskRequest, AskResponse, FeedbackRequest, FeedbackResponse, IngestRequest, IngestResponse,
    Result,
};
use crate::AppState;

/// `POST /api/rag/ask`
pub async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>> {
    state.pipeline.ask(request).await.map(Json)
}

/// `POST /api/rag/ask-stream`
///
/// Streams answer deltas as plain text chunks.
pub async fn ask_stream(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<impl IntoResponse> {
    let stream = state.pipeline.ask_stream(request).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    ))
}

/// `POST /api/rag/feedback`
pub async fn feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>> {
    state.feedback.submit(&request).map(Json)
}

/// `POST /api/rag/ingest`
pub async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>> {
    state.pipeline.ingest(request.chunks).await.map(Json)
}

/// `GET /api/rag/cache/stats`
pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "answer_cache": state.pipeline.answer_cache().stats(),
        "classification_cache": state.classification_cache.stats(),
    }))
}

/// `POST /api/rag/cache/clear`
pub async fn cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.pipeline.answer_cache().clear();
    Json(serde_json::json!({ "cleared": true }))
}

/// `GET /api/rag/bandit`
pub async fn bandit_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let router = state.pipeline.router();
    let arms: serde_json::Map<String, serde_json::Value> = router
        .arm_stats()
        .into_iter()
        .map(|(arm, stats)| {
            (
                arm.as_str().to_string(),
                serde_json::json!({
                    "alpha": stats.alpha,
                    "beta": stats.beta,
                    "mean": stats.mean(),
                    "trials": stats.trials(),
                }),
            )
        })
        .collect();

    Json(serde_json::json!({
        "enabled": router.is_enabled(),
        "cold_start": router.is_cold_start(),
        "arms": arms,
    }))
}

/// `GET /healthz`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
