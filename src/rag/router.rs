//! Strategy router: Thompson-sampling bandit over four retrieval arms.
//!
//! Selection narrows the arm set by query type, forces specialized arms on
//! strong cues, then Thompson-samples the remaining arms with an
//! exploration bonus for under-tried ones. Rewards blend retrieval
//! confidence, coverage, and a latency penalty; updates persist atomically
//! to `bandit_state.json`. State loads from the runtime file, then a
//! pre-warmed default file, then cold-start uniform priors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::rag::classifier::{cue_hits, Classification, GRAPH_CUES};
use crate::types::{AppError, QueryType, Result};

/// Exploration bonus weight for under-tried arms.
const EXPLORATION_BONUS: f64 = 0.2;

/// Table cues used for arm forcing, narrower than the classifier's list.
const TABLE_FORCE_CUES: &[&str] = &["table", "表格", "数据", "统计", "列", "行"];

// ============================================================================
// Arms
// ============================================================================

/// One selectable retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyArm {
    /// BM25 + vector fusion with rerank.
    Hybrid,
    /// Iterative self-reflective retrieval.
    Iterative,
    /// Just-in-time entity graph.
    Graph,
    /// Structured-data table assembly.
    Table,
}

impl StrategyArm {
    /// All four arms.
    pub fn all() -> [StrategyArm; 4] {
        [Self::Hybrid, Self::Iterative, Self::Graph, Self::Table]
    }

    /// Snake-case name used in persisted state and history entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Iterative => "iterative",
            Self::Graph => "graph",
            Self::Table => "table",
        }
    }

    /// Human-readable strategy name used in responses.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Hybrid => "Hybrid RAG",
            Self::Iterative => "Iterative Self-RAG",
            Self::Graph => "Graph RAG",
            Self::Table => "Table RAG",
        }
    }
}

impl FromStr for StrategyArm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(Self::Hybrid),
            "iterative" => Ok(Self::Iterative),
            "graph" => Ok(Self::Graph),
            "table" => Ok(Self::Table),
            other => Err(AppError::InvalidInput(format!("unknown arm '{}'", other))),
        }
    }
}

impl std::fmt::Display for StrategyArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Beta posterior of one arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ArmStats {
    /// Successes + 1.
    pub alpha: f64,
    /// Failures + 1.
    pub beta: f64,
}

impl Default for ArmStats {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

impl ArmStats {
    /// Observed trials; priors start at (1, 1).
    pub fn trials(&self) -> f64 {
        self.alpha + self.beta - 2.0
    }

    /// Posterior mean.
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

// ============================================================================
// Routing Decision
// ============================================================================

/// Outcome of routing one question.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Chosen arm.
    pub arm: StrategyArm,
    /// Why it was chosen.
    pub reason: String,
    /// True when cues forced the arm regardless of posteriors.
    pub forced: bool,
}

// ============================================================================
// Router
// ============================================================================

/// Thompson-sampling router with persistent arm state.
pub struct StrategyRouter {
    state: RwLock<HashMap<StrategyArm, ArmStats>>,
    cold_start: AtomicBool,
    enabled: bool,
    state_path: Option<PathBuf>,
}

impl StrategyRouter {
    /// Create a router with uniform priors and no persistence.
    pub fn new(enabled: bool) -> Self {
        let state = StrategyArm::all()
            .into_iter()
            .map(|arm| (arm, ArmStats::default()))
            .collect();
        Self {
            state: RwLock::new(state),
            cold_start: AtomicBool::new(true),
            enabled,
            state_path: None,
        }
    }

    /// Load arm state: runtime file first, then the pre-warmed default,
    /// otherwise cold-start priors. Updates persist to `state_path`.
    pub fn load(enabled: bool, state_path: &Path, default_path: &Path) -> Self {
        for (path, is_default) in [(state_path, false), (default_path, true)] {
            if let Some(state) = Self::read_state_file(path) {
                tracing::info!(path = %path.display(), warmed = is_default, "loaded bandit state");
                let router = Self {
                    state: RwLock::new(state),
                    cold_start: AtomicBool::new(false),
                    enabled,
                    state_path: Some(state_path.to_path_buf()),
                };
                if is_default {
                    // Promote the default into the runtime location.
                    router.persist();
                }
                return router;
            }
        }

        tracing::warn!(
            "no bandit state found, starting with cold uniform priors; a warm-up sweep is advised"
        );
        let mut router = Self::new(enabled);
        router.state_path = Some(state_path.to_path_buf());
        router
    }

    fn read_state_file(path: &Path) -> Option<HashMap<StrategyArm, ArmStats>> {
        let raw = std::fs::read_to_string(path).ok()?;
        let by_name: HashMap<String, ArmStats> = serde_json::from_str(&raw).ok()?;
        let mut state: HashMap<StrategyArm, ArmStats> = StrategyArm::all()
            .into_iter()
            .map(|arm| (arm, ArmStats::default()))
            .collect();
        for (name, stats) in by_name {
            if let Ok(arm) = name.parse::<StrategyArm>() {
                if stats.alpha >= 1.0 && stats.beta >= 1.0 {
                    state.insert(arm, stats);
                }
            }
        }
        Some(state)
    }

    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = self.state.read();
        let by_name: HashMap<&str, ArmStats> =
            state.iter().map(|(arm, s)| (arm.as_str(), *s)).collect();
        drop(state);

        let json = match serde_json::to_string_pretty(&by_name) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize bandit state");
                return;
            }
        };

        // Atomic replace: write beside the target, then rename over it.
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("json.tmp");
        if let Err(err) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, path)) {
            tracing::warn!(error = %err, "failed to persist bandit state");
        }
    }

    /// Whether no prior state existed at load time.
    pub fn is_cold_start(&self) -> bool {
        self.cold_start.load(Ordering::Relaxed)
    }

    /// Whether bandit selection is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshot of the arm posteriors.
    pub fn arm_stats(&self) -> HashMap<StrategyArm, ArmStats> {
        self.state.read().clone()
    }

    /// Arms eligible for a query type.
    pub fn available_arms(query_type: QueryType) -> Vec<StrategyArm> {
        match query_type {
            QueryType::FactualDetail => vec![StrategyArm::Hybrid],
            QueryType::ComplexAnalysis => vec![StrategyArm::Hybrid, StrategyArm::Iterative],
            QueryType::RelationshipQuery => vec![StrategyArm::Graph],
            QueryType::StructuredData => vec![StrategyArm::Table],
            QueryType::General => StrategyArm::all().to_vec(),
        }
    }

    /// Thompson-sample one arm from `available`, with an exploration bonus
    /// `0.2 * (1 - trials_i / max_trials)` favoring under-tried arms.
    pub fn select_arm(&self, available: &[StrategyArm]) -> StrategyArm {
        assert!(!available.is_empty(), "arm set must not be empty");
        if available.len() == 1 {
            return available[0];
        }

        let state = self.state.read();
        let max_trials = available
            .iter()
            .map(|arm| state.get(arm).copied().unwrap_or_default().trials())
            .fold(1.0f64, f64::max);

        let mut rng = rand::rng();
        let mut best = available[0];
        let mut best_score = f64::MIN;
        for arm in available {
            let stats = state.get(arm).copied().unwrap_or_default();
            let base_sample = match Beta::new(stats.alpha, stats.beta) {
                Ok(dist) => dist.sample(&mut rng),
                Err(_) => rng.random::<f64>(),
            };
            let bonus = EXPLORATION_BONUS * (1.0 - stats.trials() / max_trials);
            let score = base_sample + bonus;
            if score > best_score {
                best_score = score;
                best = *arm;
            }
        }
        best
    }

    /// Route one question given its classification.
    pub fn route(&self, question: &str, classification: &Classification) -> RoutingDecision {
        let q_lower = question.to_lowercase();
        let graph_hits = cue_hits(&q_lower, GRAPH_CUES);
        let table_hits = cue_hits(&q_lower, TABLE_FORCE_CUES);

        let use_graph = classification.use_graph || !graph_hits.is_empty();
        let use_table = classification.use_table;
        let query_type = classification.query_type;

        // Strong signals force the specialized arms outright.
        let force_table = !table_hits.is_empty() && use_table;
        let force_graph =
            graph_hits.len() >= 2 || (use_graph && !graph_hits.is_empty() && !use_table);

        if force_table {
            return RoutingDecision {
                arm: StrategyArm::Table,
                reason: format!("Forced by table cues {:?}; query type: {}", table_hits, query_type),
                forced: true,
            };
        }
        if force_graph {
            return RoutingDecision {
                arm: StrategyArm::Graph,
                reason: format!("Forced by graph cues {:?}; query type: {}", graph_hits, query_type),
                forced: true,
            };
        }

        let mut arm = if self.enabled {
            let available = Self::available_arms(query_type);
            let chosen = self.select_arm(&available);
            tracing::info!(chosen = %chosen, ?available, %query_type, "bandit selected arm");
            chosen
        } else if use_table {
            StrategyArm::Table
        } else if use_graph {
            StrategyArm::Graph
        } else if query_type == QueryType::FactualDetail {
            StrategyArm::Hybrid
        } else {
            StrategyArm::Iterative
        };

        // Safety net: cue-bearing queries escalate out of the basic arms,
        // except fast factual lookups.
        let basic = matches!(arm, StrategyArm::Hybrid | StrategyArm::Iterative);
        if basic && query_type != QueryType::FactualDetail {
            if !graph_hits.is_empty() && table_hits.is_empty() {
                tracing::info!(from = %arm, "escalating to graph on cues after selection");
                arm = StrategyArm::Graph;
            } else if !table_hits.is_empty() {
                tracing::info!(from = %arm, "escalating to table on cues after selection");
                arm = StrategyArm::Table;
            }
        }

        RoutingDecision {
            arm,
            reason: format!(
                "Chosen by bandit; query type: {}. {}",
                query_type, classification.description
            ),
            forced: false,
        }
    }

    /// Compute the automated reward for a completed strategy run.
    ///
    /// `0.4 * confidence + 0.3 * coverage + 0.3 * latency_penalty`, with
    /// coverage = 1 iff any chunk came back and the penalty linear in the
    /// latency budget.
    pub fn automated_reward(
        confidence: f32,
        num_chunks: usize,
        total_time_ms: f64,
        latency_budget_ms: f64,
    ) -> f32 {
        let conf = confidence.clamp(0.0, 1.0) as f64;
        let coverage = if num_chunks > 0 { 1.0 } else { 0.0 };
        let latency_penalty = (1.0 - total_time_ms / latency_budget_ms).max(0.0);
        (0.4 * conf + 0.3 * coverage + 0.3 * latency_penalty) as f32
    }

    /// Apply a reward in [0, 1]: `alpha += r`, `beta += 1 - r`, persisted
    /// atomically.
    pub fn update(&self, arm: StrategyArm, reward: f32) {
        let r = reward.clamp(0.0, 1.0) as f64;
        {
            let mut state = self.state.write();
            let stats = state.entry(arm).or_default();
            stats.alpha += r;
            stats.beta += 1.0 - r;
        }
        self.cold_start.store(false, Ordering::Relaxed);
        tracing::info!(arm = %arm, reward = r, "bandit update");
        self.persist();
    }

    /// Blend a user rating into the recorded automated reward and apply it.
    /// User feedback dominates: 70% rating, 30% automated.
    pub fn update_with_feedback(&self, arm: StrategyArm, automated_reward: f32, user_rating: f32) {
        let blended = 0.7 * user_rating.clamp(0.0, 1.0) + 0.3 * automated_reward.clamp(0.0, 1.0);
        tracing::info!(
            arm = %arm,
            user_rating,
            automated_reward,
            blended,
            "bandit update with user feedback"
        );
        self.update(arm, blended);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::classifier::QueryClassifier;

    #[test]
    fn test_update_preserves_invariants() {
        let router = StrategyRouter::new(true);
        for reward in [0.0f32, 0.3, 0.9, 1.0, 1.7, -0.5] {
            router.update(StrategyArm::Hybrid, reward);
        }
        let stats = router.arm_stats()[&StrategyArm::Hybrid];
        assert!(stats.alpha >= 1.0);
        assert!(stats.beta >= 1.0);
        // Each update adds exactly one trial.
        assert!((stats.trials() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_available_arms_by_type() {
        assert_eq!(
            StrategyRouter::available_arms(QueryType::FactualDetail),
            vec![StrategyArm::Hybrid]
        );
        assert_eq!(
            StrategyRouter::available_arms(QueryType::ComplexAnalysis),
            vec![StrategyArm::Hybrid, StrategyArm::Iterative]
        );
        assert_eq!(StrategyRouter::available_arms(QueryType::General).len(), 4);
    }

    #[test]
    fn test_relationship_cues_force_graph() {
        let router = StrategyRouter::new(true);
        let question = "Show me the relationship between Elizabeth and Darcy";
        let classification = QueryClassifier::classify_keyword(question);
        let decision = router.route(question, &classification);
        assert_eq!(decision.arm, StrategyArm::Graph);
        assert!(decision.forced);
    }

    #[test]
    fn test_factual_stays_on_hybrid() {
        let router = StrategyRouter::new(true);
        let question = "Who wrote Daddy Take Me Skating?";
        let classification = QueryClassifier::classify_keyword(question);
        let decision = router.route(question, &classification);
        assert_eq!(decision.arm, StrategyArm::Hybrid);
        assert!(!decision.forced);
    }

    #[test]
    fn test_bandit_convergence_under_stationary_rewards() {
        let router = StrategyRouter::new(true);
        for _ in 0..200 {
            router.update(StrategyArm::Hybrid, 0.9);
            router.update(StrategyArm::Iterative, 0.1);
        }

        let stats = router.arm_stats();
        assert!(stats[&StrategyArm::Hybrid].mean() > stats[&StrategyArm::Iterative].mean());

        // Free choice between the two trained arms overwhelmingly picks the
        // better one.
        let available = [StrategyArm::Hybrid, StrategyArm::Iterative];
        let hybrid_picks = (0..100)
            .filter(|_| router.select_arm(&available) == StrategyArm::Hybrid)
            .count();
        assert!(hybrid_picks >= 95, "hybrid picked only {}/100", hybrid_picks);
    }

    #[test]
    fn test_automated_reward_weights() {
        // Full confidence, coverage, and zero latency: reward 1.0.
        let r = StrategyRouter::automated_reward(1.0, 3, 0.0, 8000.0);
        assert!((r - 1.0).abs() < 1e-6);

        // No chunks and blown budget: only the confidence term remains.
        let r = StrategyRouter::automated_reward(0.5, 0, 20_000.0, 8000.0);
        assert!((r - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("bandit_state.json");
        let default_path = dir.path().join("default_bandit_state.json");

        {
            let router = StrategyRouter::load(true, &state_path, &default_path);
            assert!(router.is_cold_start());
            router.update(StrategyArm::Graph, 0.8);
        }

        let reloaded = StrategyRouter::load(true, &state_path, &default_path);
        assert!(!reloaded.is_cold_start());
        let stats = reloaded.arm_stats()[&StrategyArm::Graph];
        assert!((stats.alpha - 1.8).abs() < 1e-9);
        assert!((stats.beta - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_default_state_promoted_to_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("bandit_state.json");
        let default_path = dir.path().join("default_bandit_state.json");

        std::fs::write(
            &default_path,
            r#"{"hybrid": {"alpha": 5.0, "beta": 2.0}}"#,
        )
        .unwrap();

        let router = StrategyRouter::load(true, &state_path, &default_path);
        assert!(!router.is_cold_start());
        assert!((router.arm_stats()[&StrategyArm::Hybrid].alpha - 5.0).abs() < 1e-9);
        assert!(state_path.exists());
    }

    #[test]
    fn test_feedback_blend() {
        let router = StrategyRouter::new(true);
        router.update_with_feedback(StrategyArm::Table, 0.9, 0.0);
        let stats = router.arm_stats()[&StrategyArm::Table];
        // final = 0.7 * 0.0 + 0.3 * 0.9 = 0.27
        assert!((stats.alpha - 1.27).abs() < 1e-6);
        assert!((stats.beta - 1.73).abs() < 1e-6);
    }
}
