//! Risk-tiered governance tracking.
//!
//! Every operation gets a `GovernanceContext` carrying an ordered, append-only
//! checkpoint log. The operation type maps to a risk tier (R0-R3), the tier
//! selects the active criteria (G1-G12), and each checkpoint emits a labeled
//! metric. On completion the context is sealed into a `GovernanceSummary`
//! that rides back in the response.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Risk Tiers and Criteria
// ============================================================================

/// Risk tier of an operation, coarse control over mandatory checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskTier {
    /// Internal productivity, lowest control burden.
    R0,
    /// External, customer-facing content.
    R1,
    /// Operations decision support with a human in the loop.
    R2,
    /// Automated closed-loop actions.
    R3,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::R0 => "R0",
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::R3 => "R3",
        };
        write!(f, "{}", name)
    }
}

/// The closed set of governance criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// G1 - Safety case: hazard identification and risk assessment.
    G1SafetyCase,
    /// G2 - Risk tiering: policy gates per capability tier.
    G2RiskTiering,
    /// G3 - Evidence contract: verifiable citations.
    G3EvidenceContract,
    /// G4 - Permission layers: pre-retrieval access control.
    G4PermissionLayers,
    /// G5 - Privacy control: PII detection and masking.
    G5PrivacyControl,
    /// G6 - Version control: model/prompt/policy versioning.
    G6VersionControl,
    /// G7 - Observability: audit trail with trace ids.
    G7Observability,
    /// G8 - Evaluation system: SLO monitoring.
    G8EvaluationSystem,
    /// G9 - Data governance: quality and lineage tracking.
    G9DataGovernance,
    /// G10 - Domain isolation: retrieval routing and filtering.
    G10DomainIsolation,
    /// G11 - Reliability: fallbacks and failure accounting.
    G11Reliability,
    /// G12 - Dashboard: operational visibility.
    G12Dashboard,
}

impl Criterion {
    /// Stable label used in metrics and serialized summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::G1SafetyCase => "g1_safety_case",
            Self::G2RiskTiering => "g2_risk_tiering",
            Self::G3EvidenceContract => "g3_evidence_contract",
            Self::G4PermissionLayers => "g4_permission_layers",
            Self::G5PrivacyControl => "g5_privacy_control",
            Self::G6VersionControl => "g6_version_control",
            Self::G7Observability => "g7_observability",
            Self::G8EvaluationSystem => "g8_evaluation_system",
            Self::G9DataGovernance => "g9_data_governance",
            Self::G10DomainIsolation => "g10_domain_isolation",
            Self::G11Reliability => "g11_reliability",
            Self::G12Dashboard => "g12_dashboard",
        }
    }
}

/// Outcome of a single checkpoint evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Control evaluated and satisfied.
    Passed,
    /// Control evaluated with a concern that does not fail the operation.
    Warning,
    /// Control failed.
    Failed,
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Passed => "passed",
            Self::Warning => "warning",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Checkpoints and Context
// ============================================================================

/// One appended control evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Criterion being evaluated.
    pub criterion: Criterion,
    /// Outcome.
    pub status: CheckpointStatus,
    /// Human-readable detail.
    pub message: String,
    /// Structured detail for the audit record.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When the checkpoint was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Per-operation governance state. Sealed into a summary on completion.
#[derive(Debug, Clone)]
pub struct GovernanceContext {
    /// Trace id shared with logs.
    pub trace_id: String,
    /// Operation type (`rag`, `self_rag`, `code`, ...).
    pub operation_type: String,
    /// Assigned risk tier.
    pub risk_tier: RiskTier,
    /// Criteria active for this tier.
    pub active_criteria: BTreeSet<Criterion>,
    /// Ordered checkpoint log.
    pub checkpoints: Vec<Checkpoint>,
    /// Operation start time.
    pub started_at: DateTime<Utc>,
    /// Set on completion.
    pub ended_at: Option<DateTime<Utc>>,
}

impl GovernanceContext {
    fn add_checkpoint(
        &mut self,
        criterion: Criterion,
        status: CheckpointStatus,
        message: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        let checkpoint = Checkpoint {
            criterion,
            status,
            message: message.into(),
            metadata,
            timestamp: Utc::now(),
        };

        counter!(
            "sage_governance_checkpoints_total",
            "criterion" => criterion.label(),
            "status" => status.to_string(),
            "risk_tier" => self.risk_tier.to_string(),
        )
        .increment(1);

        self.checkpoints.push(checkpoint);
    }
}

/// Sealed summary of a completed operation, embedded in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceSummary {
    /// Trace id of the operation.
    pub trace_id: String,
    /// Operation type.
    pub operation_type: String,
    /// Risk tier.
    pub risk_tier: RiskTier,
    /// Criteria that were active.
    pub active_criteria: Vec<Criterion>,
    /// Full ordered checkpoint log.
    pub checkpoints: Vec<Checkpoint>,
    /// Count of passed checkpoints.
    pub passed_checkpoints: usize,
    /// Count of warning checkpoints.
    pub warning_checkpoints: usize,
    /// Count of failed checkpoints.
    pub failed_checkpoints: usize,
    /// Wall-clock duration of the operation in milliseconds.
    pub duration_ms: f64,
}

// ============================================================================
// Tracker
// ============================================================================

/// SLO target for R1 operations in milliseconds.
const SLO_R1_MS: f64 = 10_000.0;
/// SLO target for R2 and above in milliseconds.
const SLO_R2_PLUS_MS: f64 = 15_000.0;

/// Tracks governance contexts for in-flight operations.
pub struct GovernanceTracker {
    active: Mutex<HashMap<String, GovernanceContext>>,
}

impl Default for GovernanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernanceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Map an operation type to its risk tier.
    pub fn risk_tier_for(operation_type: &str) -> RiskTier {
        match operation_type {
            "rag" | "self_rag" | "chat" => RiskTier::R1,
            "code" | "statistics" => RiskTier::R0,
            _ => RiskTier::R0,
        }
    }

    /// Criteria active for a tier.
    pub fn criteria_for(tier: RiskTier) -> BTreeSet<Criterion> {
        use Criterion::*;
        let base: &[Criterion] = &[
            G1SafetyCase,
            G2RiskTiering,
            G6VersionControl,
            G7Observability,
            G11Reliability,
        ];
        let r1_extra: &[Criterion] = &[
            G3EvidenceContract,
            G4PermissionLayers,
            G5PrivacyControl,
            G8EvaluationSystem,
            G9DataGovernance,
            G10DomainIsolation,
            G12Dashboard,
        ];
        let mut set: BTreeSet<Criterion> = base.iter().copied().collect();
        if tier != RiskTier::R0 {
            set.extend(r1_extra.iter().copied());
        }
        set
    }

    /// Begin tracking a new operation. Returns the trace id.
    pub fn start_operation(&self, operation_type: &str) -> String {
        let trace_id = Uuid::new_v4().to_string();
        let risk_tier = Self::risk_tier_for(operation_type);

        counter!(
            "sage_governance_operations_total",
            "operation_type" => operation_type.to_string(),
            "risk_tier" => risk_tier.to_string(),
        )
        .increment(1);

        let context = GovernanceContext {
            trace_id: trace_id.clone(),
            operation_type: operation_type.to_string(),
            risk_tier,
            active_criteria: Self::criteria_for(risk_tier),
            checkpoints: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        };

        tracing::debug!(trace_id = %trace_id, operation_type, tier = %risk_tier, "governance tracking started");
        self.active.lock().insert(trace_id.clone(), context);
        trace_id
    }

    fn with_context<F>(&self, trace_id: &str, f: F)
    where
        F: FnOnce(&mut GovernanceContext),
    {
        let mut active = self.active.lock();
        if let Some(context) = active.get_mut(trace_id) {
            f(context);
        }
    }

    /// Record the policy-gate decision (G2). Emitted exactly once per request.
    pub fn checkpoint_policy_gate(&self, trace_id: &str, allowed: bool, reason: &str) {
        self.with_context(trace_id, |ctx| {
            let status = if allowed {
                CheckpointStatus::Passed
            } else {
                CheckpointStatus::Failed
            };
            ctx.add_checkpoint(
                Criterion::G2RiskTiering,
                status,
                format!("Policy gate: {}", reason),
                serde_json::Map::new(),
            );
        });
    }

    /// Record the permission-layer decision (G4).
    pub fn checkpoint_permission(&self, trace_id: &str, user_role: &str, authorized: bool) {
        self.with_context(trace_id, |ctx| {
            let status = if authorized {
                CheckpointStatus::Passed
            } else {
                CheckpointStatus::Failed
            };
            let mut meta = serde_json::Map::new();
            meta.insert("user_role".into(), user_role.into());
            ctx.add_checkpoint(
                Criterion::G4PermissionLayers,
                status,
                format!("Permission check for role '{}'", user_role),
                meta,
            );
        });
    }

    /// Record the privacy scan result (G5).
    pub fn checkpoint_privacy(&self, trace_id: &str, pii_types: &[String], masked: bool) {
        self.with_context(trace_id, |ctx| {
            let (status, message) = if pii_types.is_empty() {
                (CheckpointStatus::Passed, "No PII detected in query".to_string())
            } else if masked {
                (
                    CheckpointStatus::Passed,
                    format!("PII detected and masked: {}", pii_types.join(", ")),
                )
            } else {
                (
                    CheckpointStatus::Warning,
                    format!("PII detected, not masked: {}", pii_types.join(", ")),
                )
            };
            let mut meta = serde_json::Map::new();
            meta.insert(
                "pii_types".into(),
                serde_json::Value::Array(pii_types.iter().map(|t| t.clone().into()).collect()),
            );
            ctx.add_checkpoint(Criterion::G5PrivacyControl, status, message, meta);
        });
    }

    /// Record data source lineage (G9).
    pub fn checkpoint_data_governance(&self, trace_id: &str, data_sources: &[String]) {
        self.with_context(trace_id, |ctx| {
            let mut meta = serde_json::Map::new();
            meta.insert(
                "data_sources".into(),
                serde_json::Value::Array(data_sources.iter().map(|s| s.clone().into()).collect()),
            );
            ctx.add_checkpoint(
                Criterion::G9DataGovernance,
                CheckpointStatus::Passed,
                format!("Data lineage tracked over {} source(s)", data_sources.len()),
                meta,
            );
        });
    }

    /// Record dashboard/metrics export (G12).
    pub fn checkpoint_dashboard(&self, trace_id: &str) {
        self.with_context(trace_id, |ctx| {
            ctx.add_checkpoint(
                Criterion::G12Dashboard,
                CheckpointStatus::Passed,
                "Operation metrics exported",
                serde_json::Map::new(),
            );
        });
    }

    /// Record a retrieval pass (G10). At least one per strategy execution.
    pub fn checkpoint_retrieval(&self, trace_id: &str, num_chunks: usize, collection: &str) {
        self.with_context(trace_id, |ctx| {
            let mut meta = serde_json::Map::new();
            meta.insert("num_chunks".into(), num_chunks.into());
            meta.insert("collection".into(), collection.into());
            ctx.add_checkpoint(
                Criterion::G10DomainIsolation,
                CheckpointStatus::Passed,
                format!("Retrieved {} chunk(s) from '{}'", num_chunks, collection),
                meta,
            );
        });
    }

    /// Record the evidence contract evaluation (G3).
    ///
    /// On R1, zero citations is still a pass with a note: cache hits and
    /// synthesized answers are legitimate.
    pub fn checkpoint_evidence(&self, trace_id: &str, num_citations: usize) {
        self.with_context(trace_id, |ctx| {
            let message = if ctx.risk_tier == RiskTier::R1 && num_citations == 0 {
                "Answer produced with 0 citations (cache hit or synthesis)".to_string()
            } else {
                format!("Evidence validated: {} citation(s)", num_citations)
            };
            let mut meta = serde_json::Map::new();
            meta.insert("num_citations".into(), num_citations.into());
            ctx.add_checkpoint(
                Criterion::G3EvidenceContract,
                CheckpointStatus::Passed,
                message,
                meta,
            );
        });
    }

    /// Record the generation step with model/prompt versions (G6).
    pub fn checkpoint_generation(&self, trace_id: &str, model: &str, prompt_version: &str) {
        self.with_context(trace_id, |ctx| {
            let mut meta = serde_json::Map::new();
            meta.insert("model".into(), model.into());
            meta.insert("prompt_version".into(), prompt_version.into());
            ctx.add_checkpoint(
                Criterion::G6VersionControl,
                CheckpointStatus::Passed,
                format!("Response generated: model={}, prompt={}", model, prompt_version),
                meta,
            );
        });
    }

    /// Record the latency SLO evaluation (G8). Overrun warns, never fails.
    pub fn checkpoint_quality(&self, trace_id: &str, latency_ms: f64, quality_score: f32) {
        self.with_context(trace_id, |ctx| {
            let slo_target_ms = if ctx.risk_tier == RiskTier::R1 {
                SLO_R1_MS
            } else {
                SLO_R2_PLUS_MS
            };
            let slo_met = latency_ms < slo_target_ms;
            let status = if slo_met {
                CheckpointStatus::Passed
            } else {
                CheckpointStatus::Warning
            };
            let mut meta = serde_json::Map::new();
            meta.insert("latency_ms".into(), latency_ms.into());
            meta.insert("slo_target_ms".into(), slo_target_ms.into());
            meta.insert("quality_score".into(), (quality_score as f64).into());
            ctx.add_checkpoint(
                Criterion::G8EvaluationSystem,
                status,
                format!("Latency {:.0}ms (SLO < {:.0}ms)", latency_ms, slo_target_ms),
                meta,
            );
        });
    }

    /// Record the audit-trail step (G7). Emitted exactly once per request.
    pub fn checkpoint_audit(&self, trace_id: &str) {
        self.with_context(trace_id, |ctx| {
            let mut meta = serde_json::Map::new();
            meta.insert("trace_id".into(), trace_id.into());
            ctx.add_checkpoint(
                Criterion::G7Observability,
                CheckpointStatus::Passed,
                format!("Audit trail logged (trace_id: {})", trace_id),
                meta,
            );
        });
    }

    /// Record a reliability outcome (G11), pass or fail with a message.
    pub fn checkpoint_reliability(&self, trace_id: &str, status: CheckpointStatus, message: &str) {
        self.with_context(trace_id, |ctx| {
            ctx.add_checkpoint(
                Criterion::G11Reliability,
                status,
                message,
                serde_json::Map::new(),
            );
        });
    }

    /// Record a per-iteration observability checkpoint (G7), used by the
    /// iterative strategy.
    pub fn checkpoint_iteration(&self, trace_id: &str, iteration: usize, confidence: f32) {
        self.with_context(trace_id, |ctx| {
            let mut meta = serde_json::Map::new();
            meta.insert("iteration".into(), iteration.into());
            meta.insert("confidence".into(), (confidence as f64).into());
            ctx.add_checkpoint(
                Criterion::G7Observability,
                CheckpointStatus::Passed,
                format!("Iteration {} completed (confidence {:.2})", iteration, confidence),
                meta,
            );
        });
    }

    /// Seal the context: observe the latency histogram, set compliance
    /// gauges, and return the summary. Always the last step of a request.
    pub fn complete_operation(&self, trace_id: &str) -> Option<GovernanceSummary> {
        let mut context = self.active.lock().remove(trace_id)?;
        let ended_at = Utc::now();
        context.ended_at = Some(ended_at);

        let duration_ms = (ended_at - context.started_at)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1000.0;

        histogram!(
            "sage_operation_duration_ms",
            "operation_type" => context.operation_type.clone(),
            "risk_tier" => context.risk_tier.to_string(),
        )
        .record(duration_ms);

        // Compliance gauge per criterion: 1 only if every checkpoint for
        // that criterion passed.
        for criterion in &context.active_criteria {
            let evaluated: Vec<&Checkpoint> = context
                .checkpoints
                .iter()
                .filter(|c| c.criterion == *criterion)
                .collect();
            if evaluated.is_empty() {
                continue;
            }
            let all_passed = evaluated
                .iter()
                .all(|c| c.status == CheckpointStatus::Passed);
            gauge!(
                "sage_governance_compliance",
                "criterion" => criterion.label(),
                "risk_tier" => context.risk_tier.to_string(),
            )
            .set(if all_passed { 1.0 } else { 0.0 });
        }

        let passed = context
            .checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::Passed)
            .count();
        let warning = context
            .checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::Warning)
            .count();
        let failed = context
            .checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::Failed)
            .count();

        Some(GovernanceSummary {
            trace_id: context.trace_id,
            operation_type: context.operation_type,
            risk_tier: context.risk_tier,
            active_criteria: context.active_criteria.into_iter().collect(),
            checkpoints: context.checkpoints,
            passed_checkpoints: passed,
            warning_checkpoints: warning,
            failed_checkpoints: failed,
            duration_ms,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_tier_mapping() {
        assert_eq!(GovernanceTracker::risk_tier_for("rag"), RiskTier::R1);
        assert_eq!(GovernanceTracker::risk_tier_for("self_rag"), RiskTier::R1);
        assert_eq!(GovernanceTracker::risk_tier_for("code"), RiskTier::R0);
        assert_eq!(GovernanceTracker::risk_tier_for("unknown"), RiskTier::R0);
    }

    #[test]
    fn test_r0_criteria_subset_of_r1() {
        let r0 = GovernanceTracker::criteria_for(RiskTier::R0);
        let r1 = GovernanceTracker::criteria_for(RiskTier::R1);
        assert!(r0.is_subset(&r1));
        assert_eq!(r0.len(), 5);
        assert_eq!(r1.len(), 12);
    }

    #[test]
    fn test_checkpoint_ordering_and_counts() {
        let tracker = GovernanceTracker::new();
        let trace = tracker.start_operation("rag");

        tracker.checkpoint_policy_gate(&trace, true, "citations required");
        tracker.checkpoint_retrieval(&trace, 3, "docs");
        tracker.checkpoint_evidence(&trace, 2);
        tracker.checkpoint_quality(&trace, 123.0, 0.9);
        tracker.checkpoint_audit(&trace);

        let summary = tracker.complete_operation(&trace).unwrap();
        assert_eq!(summary.checkpoints.len(), 5);
        assert_eq!(summary.passed_checkpoints, 5);
        assert_eq!(summary.failed_checkpoints, 0);

        let policy_gates = summary
            .checkpoints
            .iter()
            .filter(|c| c.criterion == Criterion::G2RiskTiering)
            .count();
        assert_eq!(policy_gates, 1);

        // Timestamps never go backwards.
        for pair in summary.checkpoints.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_slo_overrun_is_warning_not_failure() {
        let tracker = GovernanceTracker::new();
        let trace = tracker.start_operation("rag");
        tracker.checkpoint_quality(&trace, 12_000.0, 0.5);
        let summary = tracker.complete_operation(&trace).unwrap();
        assert_eq!(summary.warning_checkpoints, 1);
        assert_eq!(summary.failed_checkpoints, 0);
    }

    #[test]
    fn test_zero_citations_on_r1_passes() {
        let tracker = GovernanceTracker::new();
        let trace = tracker.start_operation("rag");
        tracker.checkpoint_evidence(&trace, 0);
        let summary = tracker.complete_operation(&trace).unwrap();
        assert_eq!(summary.passed_checkpoints, 1);
        assert!(summary.checkpoints[0].message.contains("0 citations"));
    }

    #[test]
    fn test_complete_unknown_trace_is_none() {
        let tracker = GovernanceTracker::new();
        assert!(tracker.complete_operation("nope").is_none());
    }
}
