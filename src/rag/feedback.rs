//! User feedback service.
//!
//! Closes the learning loop: a rating on a strategy-served answer blends
//! into the bandit update for the recorded arm, while a negative rating on
//! a cache-served answer invalidates the cached entry instead. Each query
//! id accepts at most one rating.

use std::sync::Arc;

use crate::rag::answer_cache::AnswerCache;
use crate::rag::history::QueryHistory;
use crate::rag::router::{StrategyArm, StrategyRouter};
use crate::types::{AppError, FeedbackRequest, FeedbackResponse, Result};

/// Rating below which a cached answer is treated as wrong and evicted.
const NEGATIVE_RATING_THRESHOLD: f32 = 0.5;

/// Routes user ratings to the bandit or the answer cache.
pub struct FeedbackService {
    history: Arc<QueryHistory>,
    router: Arc<StrategyRouter>,
    cache: Arc<AnswerCache>,
}

impl FeedbackService {
    /// Wire the service over the shared state handles.
    pub fn new(
        history: Arc<QueryHistory>,
        router: Arc<StrategyRouter>,
        cache: Arc<AnswerCache>,
    ) -> Self {
        Self {
            history,
            router,
            cache,
        }
    }

    /// Apply one feedback submission.
    pub fn submit(&self, request: &FeedbackRequest) -> Result<FeedbackResponse> {
        if !(0.0..=1.0).contains(&request.rating) {
            return Err(AppError::InvalidInput(format!(
                "rating must be in [0, 1], got {}",
                request.rating
            )));
        }

        let entry = self.history.get(&request.query_id).ok_or_else(|| {
            AppError::NotFound(format!(
                "query_id '{}' not found (expired from history?)",
                request.query_id
            ))
        })?;

        if entry.user_rating.is_some() {
            return Ok(FeedbackResponse {
                query_id: request.query_id.clone(),
                rating: request.rating,
                strategy_updated: false,
                bandit_updated: false,
                message: "Feedback already recorded for this query".to_string(),
            });
        }

        self.history.annotate_rating(&request.query_id, request.rating);

        if entry.is_cached {
            return Ok(self.handle_cached(request, &entry.question, entry.cache_layer));
        }

        let arm: StrategyArm = entry.strategy.parse().map_err(|_| {
            AppError::Internal(format!(
                "history entry holds unknown arm '{}'",
                entry.strategy
            ))
        })?;

        self.router
            .update_with_feedback(arm, entry.automated_reward, request.rating);

        Ok(FeedbackResponse {
            query_id: request.query_id.clone(),
            rating: request.rating,
            strategy_updated: true,
            bandit_updated: true,
            message: format!(
                "Feedback applied to {} (blended with automated reward {:.2})",
                arm.display_name(),
                entry.automated_reward
            ),
        })
    }

    fn handle_cached(
        &self,
        request: &FeedbackRequest,
        question: &str,
        cache_layer: Option<u8>,
    ) -> FeedbackResponse {
        if request.rating < NEGATIVE_RATING_THRESHOLD {
            let removed = self.cache.invalidate(question);
            let message = if removed {
                format!(
                    "Cached answer (layer {}) cleared; the next ask will re-run the pipeline",
                    cache_layer.unwrap_or(0)
                )
            } else {
                "Cached answer was already gone".to_string()
            };
            FeedbackResponse {
                query_id: request.query_id.clone(),
                rating: request.rating,
                strategy_updated: false,
                bandit_updated: false,
                message,
            }
        } else {
            FeedbackResponse {
                query_id: request.query_id.clone(),
                rating: request.rating,
                strategy_updated: false,
                bandit_updated: false,
                message: "Positive feedback on cached answer acknowledged".to_string(),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::answer_cache::CachedAnswer;
    use crate::rag::embedding::{HashingEmbedder, LexicalReranker, ModelAdapter, ModelPair};
    use crate::types::Citation;

    fn service() -> (FeedbackService, Arc<QueryHistory>, Arc<StrategyRouter>, Arc<AnswerCache>) {
        let history = Arc::new(QueryHistory::new(10));
        let router = Arc::new(StrategyRouter::new(true));
        let models = Arc::new(ModelAdapter::new(
            ModelPair {
                embed: Arc::new(HashingEmbedder::new(32)),
                rerank: Arc::new(LexicalReranker),
            },
            None,
            5000.0,
        ));
        let cache = Arc::new(AnswerCache::new(models, 0.88, 0.30, 100, 72));
        let service = FeedbackService::new(history.clone(), router.clone(), cache.clone());
        (service, history, router, cache)
    }

    fn request(query_id: &str, rating: f32) -> FeedbackRequest {
        FeedbackRequest {
            query_id: query_id.to_string(),
            rating,
            comment: None,
        }
    }

    #[test]
    fn test_unknown_query_id_is_not_found() {
        let (service, _, _, _) = service();
        let err = service.submit(&request("ghost", 0.5)).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_out_of_range_rating_rejected() {
        let (service, _, _, _) = service();
        let err = service.submit(&request("any", 1.5)).unwrap_err();
        assert_eq!(err.kind(), "input_validation");
    }

    #[test]
    fn test_strategy_feedback_updates_bandit() {
        let (service, history, router, _) = service();
        history.record_strategy("q1", "hybrid", 0.9, "who wrote it");

        let response = service.submit(&request("q1", 0.0)).unwrap();
        assert!(response.bandit_updated);
        assert!(response.strategy_updated);

        // final = 0.7 * 0.0 + 0.3 * 0.9 = 0.27
        let stats = router.arm_stats()[&StrategyArm::Hybrid];
        assert!((stats.alpha - 1.27).abs() < 1e-6);
    }

    #[test]
    fn test_double_feedback_ignored() {
        let (service, history, router, _) = service();
        history.record_strategy("q1", "graph", 0.5, "question");

        service.submit(&request("q1", 1.0)).unwrap();
        let second = service.submit(&request("q1", 0.0)).unwrap();
        assert!(!second.bandit_updated);

        // Only the first rating counted.
        let stats = router.arm_stats()[&StrategyArm::Graph];
        assert!((stats.trials() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_negative_feedback_on_cached_invalidates() {
        let (service, history, _, cache) = service();

        let cached = CachedAnswer {
            answer: "stale".into(),
            citations: vec![Citation {
                source: "s".into(),
                content: "c".into(),
                score: 0.9,
                metadata: None,
            }],
            confidence: 0.9,
            num_chunks_retrieved: 1,
            selected_strategy: "Hybrid RAG".into(),
            strategy_reason: "r".into(),
        };
        cache.store("who wrote the skating book", cached).await;
        history.record_cached("q1", 1, "who wrote the skating book");

        let response = service.submit(&request("q1", 0.0)).unwrap();
        assert!(!response.bandit_updated);
        assert!(response.message.contains("cleared"));
        assert!(cache
            .find("who wrote the skating book")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_positive_feedback_on_cached_is_ack() {
        let (service, history, router, _) = service();
        history.record_cached("q1", 2, "question text");

        let response = service.submit(&request("q1", 0.9)).unwrap();
        assert!(!response.bandit_updated);
        assert!(response.message.contains("acknowledged"));

        // No posterior moved.
        for (_, stats) in router.arm_stats() {
            assert!((stats.trials()).abs() < 1e-9);
        }
    }
}
