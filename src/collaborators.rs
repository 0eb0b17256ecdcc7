//! Narrow interfaces to the collaborators the pipeline calls but does not
//! implement: the code-generation model and the human approval step.
//!
//! The remaining collaborator traits live next to the code that drives them:
//! [`crate::telemetry::TelemetrySource`], [`crate::sandbox::SandboxRunner`],
//! [`crate::deploy::FeatureFlagStore`], [`crate::deploy::HealthProbe`],
//! [`crate::deploy::EnvironmentManager`] and [`crate::store::EvolutionStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::model::{Category, Evolution, ImprovementHypothesis};

/// Constraints attached to every request.
const BASE_CONSTRAINTS: [&str; 3] =
    ["preserve public API", "keep existing tests passing", "no new external dependencies"];

/// What the code generator is asked to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionRequest {
    pub kind: Category,
    pub target_files: Vec<String>,
    /// Free-text description of the problem.
    pub context: String,
    pub constraints: Vec<String>,
    /// Current value of each metric the change should move.
    pub metrics: BTreeMap<String, f64>,
    pub hypothesis: ImprovementHypothesis,
}

impl EvolutionRequest {
    pub fn from_hypothesis(hypothesis: &ImprovementHypothesis) -> Self {
        let mut constraints: Vec<String> = BASE_CONSTRAINTS.iter().map(|s| s.to_string()).collect();
        constraints.extend(hypothesis.risks.iter().map(|r| format!("mitigate: {r}")));
        Self {
            kind: hypothesis.category,
            target_files: hypothesis.tools.iter().map(|t| format!("tools/{t}")).collect(),
            context: hypothesis.description.clone(),
            constraints,
            metrics: hypothesis.expected_impact.iter().map(|i| (i.metric.clone(), i.current)).collect(),
            hypothesis: hypothesis.clone(),
        }
    }
}

/// Produces a candidate change for a hypothesis.  The caller bounds the
/// call with `codegen_timeout_ms`.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn request_evolution(&self, request: EvolutionRequest) -> Result<Evolution, CollaboratorError>;
}

/// Manual sign-off for evolutions that do not qualify for auto-approval.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// `Ok(true)` approves, `Ok(false)` denies.
    async fn request_approval(&self, evolution: &Evolution) -> Result<bool, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExpectedImpact;

    #[test]
    fn test_request_carries_hypothesis_context() {
        let h = ImprovementHypothesis {
            id: "h1".into(),
            sequence: 3,
            category: Category::Performance,
            description: "memoise search results".into(),
            expected_impact: vec![ExpectedImpact {
                metric: "avg_exec_time_ms".into(),
                current: 1600.0,
                target: 1120.0,
                change_pct: 30.0,
            }],
            confidence: 0.9,
            risks: vec!["stale cache".into()],
            dependencies: Vec::new(),
            tools: vec!["search".into()],
            source_pattern: Some("pat-hotspot-search".into()),
            created_at_ms: 0,
        };
        let req = EvolutionRequest::from_hypothesis(&h);
        assert_eq!(req.kind, Category::Performance);
        assert_eq!(req.target_files, vec!["tools/search".to_string()]);
        assert_eq!(req.metrics["avg_exec_time_ms"], 1600.0);
        assert!(req.constraints.iter().any(|c| c == "mitigate: stale cache"));
        assert_eq!(req.constraints.len(), 4);
    }
}
