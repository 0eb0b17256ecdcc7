//! One end-to-end attempt to validate and deploy a hypothesis.
//!
//! ## Lifecycle
//!
//! ```text
//! pending -> sandboxed -> validated -> deploying -> completed
//!                                               \-> rolled_back
//! (any non-terminal) -> failed
//! ```
//!
//! Terminal states are `completed`, `failed` and `rolled_back`.  Any attempt
//! to leave a terminal state is an [`ModelError::InvalidTransition`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::model::deployment::StrategyKind;
use crate::model::hypothesis::ImprovementHypothesis;
use crate::model::is_unit;

// ---------------------------------------------------------------------------
// EvolutionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStatus {
    Pending,
    Sandboxed,
    Validated,
    Deploying,
    Completed,
    Failed,
    RolledBack,
}

impl EvolutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EvolutionStatus::Completed | EvolutionStatus::Failed | EvolutionStatus::RolledBack)
    }

    pub fn can_transition_to(self, to: EvolutionStatus) -> bool {
        use EvolutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (Pending, Sandboxed)
                | (Sandboxed, Validated)
                | (Validated, Deploying)
                | (Deploying, Completed)
                | (Deploying, RolledBack)
                | (_, Failed)
        )
    }
}

impl std::fmt::Display for EvolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvolutionStatus::Pending => "pending",
            EvolutionStatus::Sandboxed => "sandboxed",
            EvolutionStatus::Validated => "validated",
            EvolutionStatus::Deploying => "deploying",
            EvolutionStatus::Completed => "completed",
            EvolutionStatus::Failed => "failed",
            EvolutionStatus::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Evolution payload types
// ---------------------------------------------------------------------------

/// One file edit proposed by the code generator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodeChange {
    pub file: String,
    pub before: String,
    pub after: String,
    pub diff: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: bool,
    pub total: u32,
    pub passed_count: u32,
    pub failed_count: u32,
}

impl TestResults {
    pub fn from_counts(passed_count: u32, failed_count: u32) -> Self {
        Self {
            passed: failed_count == 0 && passed_count > 0,
            total: passed_count + failed_count,
            passed_count,
            failed_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationResults {
    pub api_compat: bool,
    pub backward_compat: bool,
    pub security_ok: bool,
    /// `true` when the candidate made some measured path slower.
    pub perf_regression: bool,
}

impl Default for ValidationResults {
    fn default() -> Self {
        Self { api_compat: true, backward_compat: true, security_ok: true, perf_regression: false }
    }
}

/// Before/after measurement of the metric the hypothesis targets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvolutionMetrics {
    pub metric: String,
    pub before: f64,
    pub after: f64,
    pub improvement_pct: f64,
}

impl EvolutionMetrics {
    /// Build a measurement for a lower-is-better metric (latency, error rate,
    /// memory).  A zero baseline yields zero improvement.
    pub fn lower_is_better(metric: impl Into<String>, before: f64, after: f64) -> Self {
        let improvement_pct = if before > 0.0 { (before - after) / before * 100.0 } else { 0.0 };
        Self { metric: metric.into(), before, after, improvement_pct }
    }
}

/// Audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: EvolutionStatus,
    pub to: EvolutionStatus,
    pub at_ms: u64,
}

// ---------------------------------------------------------------------------
// Evolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evolution {
    pub id: String,
    pub hypothesis: ImprovementHypothesis,
    pub status: EvolutionStatus,
    pub changes: Vec<CodeChange>,
    pub test_results: TestResults,
    pub validation_results: ValidationResults,
    pub metrics: EvolutionMetrics,
    pub risk_level: f64,
    pub strategy: Option<StrategyKind>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub duration_ms: Option<u64>,
}

impl Evolution {
    /// A fresh `pending` evolution for `hypothesis`.  The risk level is
    /// derived from the hypothesis.
    pub fn new(hypothesis: ImprovementHypothesis, now_ms: u64) -> Self {
        let risk_level = hypothesis.risk_level();
        Self {
            id: format!("evo-{}", Uuid::new_v4()),
            hypothesis,
            status: EvolutionStatus::Pending,
            changes: Vec::new(),
            test_results: TestResults::default(),
            validation_results: ValidationResults::default(),
            metrics: EvolutionMetrics::default(),
            risk_level,
            strategy: None,
            failure_reason: None,
            history: Vec::new(),
            created_at_ms: now_ms,
            completed_at_ms: None,
            duration_ms: None,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.id.is_empty() {
            return Err(ModelError::schema("evolution", &self.id, "id must not be empty"));
        }
        self.hypothesis.validate()?;
        if !is_unit(self.risk_level) {
            return Err(ModelError::schema(
                "evolution",
                &self.id,
                format!("risk_level must be in [0, 1], got {}", self.risk_level),
            ));
        }
        if let Some(change) = self.changes.iter().find(|c| c.file.trim().is_empty()) {
            return Err(ModelError::schema(
                "evolution",
                &self.id,
                format!("change with empty file path (rationale: {})", change.rationale),
            ));
        }
        if !self.metrics.improvement_pct.is_finite() {
            return Err(ModelError::schema("evolution", &self.id, "improvement_pct is not finite"));
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`, recording the change.  Entering a terminal state stamps
    /// `completed_at_ms` and `duration_ms`.
    pub fn transition(&mut self, to: EvolutionStatus, now_ms: u64) -> Result<(), ModelError> {
        if !self.status.can_transition_to(to) {
            return Err(ModelError::InvalidTransition { id: self.id.clone(), from: self.status, to });
        }
        self.history.push(StatusChange { from: self.status, to, at_ms: now_ms });
        self.status = to;
        if to.is_terminal() {
            self.completed_at_ms = Some(now_ms);
            self.duration_ms = Some(now_ms.saturating_sub(self.created_at_ms));
        }
        Ok(())
    }

    /// Mark the evolution failed with `reason`.
    pub fn fail(&mut self, reason: impl Into<String>, now_ms: u64) -> Result<(), ModelError> {
        self.transition(EvolutionStatus::Failed, now_ms)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Whether the evolution ended in a successful deployment.
    pub fn succeeded(&self) -> bool {
        self.status == EvolutionStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::hypothesis::{Category, ExpectedImpact};
    use rstest::rstest;

    fn evolution() -> Evolution {
        let h = ImprovementHypothesis {
            id: "h1".into(),
            sequence: 0,
            category: Category::BugFix,
            description: "retry flaky fetch".into(),
            expected_impact: vec![ExpectedImpact {
                metric: "error_rate".into(),
                current: 0.2,
                target: 0.1,
                change_pct: 50.0,
            }],
            confidence: 0.8,
            risks: vec![],
            dependencies: vec![],
            tools: vec!["fetch".into()],
            source_pattern: None,
            created_at_ms: 0,
        };
        Evolution::new(h, 1_000)
    }

    #[test]
    fn test_new_evolution_is_pending_with_derived_risk() {
        let e = evolution();
        assert_eq!(e.status, EvolutionStatus::Pending);
        assert!(e.id.starts_with("evo-"));
        assert!((e.risk_level - 0.2).abs() < 1e-9);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_happy_path_reaches_completed() {
        let mut e = evolution();
        for (i, s) in [
            EvolutionStatus::Sandboxed,
            EvolutionStatus::Validated,
            EvolutionStatus::Deploying,
            EvolutionStatus::Completed,
        ]
        .into_iter()
        .enumerate()
        {
            e.transition(s, 2_000 + i as u64).unwrap();
        }
        assert!(e.succeeded());
        assert_eq!(e.completed_at_ms, Some(2_003));
        assert_eq!(e.duration_ms, Some(1_003));
        assert_eq!(e.history.len(), 4);
    }

    #[rstest]
    #[case(EvolutionStatus::Pending, EvolutionStatus::Validated)]
    #[case(EvolutionStatus::Pending, EvolutionStatus::Deploying)]
    #[case(EvolutionStatus::Sandboxed, EvolutionStatus::Completed)]
    #[case(EvolutionStatus::Validated, EvolutionStatus::RolledBack)]
    fn skipping_states_is_rejected(#[case] from: EvolutionStatus, #[case] to: EvolutionStatus) {
        assert!(!from.can_transition_to(to));
    }

    #[rstest]
    #[case(EvolutionStatus::Pending)]
    #[case(EvolutionStatus::Sandboxed)]
    #[case(EvolutionStatus::Validated)]
    #[case(EvolutionStatus::Deploying)]
    fn any_non_terminal_state_may_fail(#[case] from: EvolutionStatus) {
        assert!(from.can_transition_to(EvolutionStatus::Failed));
    }

    #[test]
    fn test_terminal_state_cannot_be_left() {
        let mut e = evolution();
        e.fail("gate rejected", 5).unwrap();
        let err = e.transition(EvolutionStatus::Pending, 6).unwrap_err();
        assert!(err.to_string().contains("failed -> pending"));
        assert!(e.fail("again", 7).is_err());
        assert_eq!(e.failure_reason.as_deref(), Some("gate rejected"));
    }

    #[test]
    fn test_lower_is_better_improvement() {
        let m = EvolutionMetrics::lower_is_better("latency", 200.0, 150.0);
        assert!((m.improvement_pct - 25.0).abs() < 1e-9);
        assert_eq!(EvolutionMetrics::lower_is_better("x", 0.0, 5.0).improvement_pct, 0.0);
    }

    #[test]
    fn test_results_from_counts() {
        let r = TestResults::from_counts(10, 0);
        assert!(r.passed);
        assert_eq!(r.total, 10);
        assert!(!TestResults::from_counts(9, 1).passed);
        assert!(!TestResults::from_counts(0, 0).passed);
    }

    #[test]
    fn test_empty_change_path_rejected() {
        let mut e = evolution();
        e.changes.push(CodeChange { rationale: "oops".into(), ..Default::default() });
        assert!(e.validate().is_err());
    }
}
