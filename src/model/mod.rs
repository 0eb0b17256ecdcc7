//! # Module: model
//!
//! The pipeline's data model.  Every entity that crosses a component or
//! collaborator boundary lives here and carries an explicit `validate()`.
//!
//! ## Sub-modules
//! - [`pattern`]: recurring inefficiencies mined from telemetry
//! - [`hypothesis`]: proposed improvements with expected impact and risk
//! - [`evolution`]: one end-to-end attempt and its lifecycle state machine
//! - [`deployment`]: rollout records, stages and health snapshots

pub mod deployment;
pub mod evolution;
pub mod hypothesis;
pub mod pattern;

pub use deployment::{
    Deployment, DeploymentMetrics, DeploymentPhase, Environments, HealthStatus, StageMetrics,
    StageRecord, StrategyKind,
};
pub use evolution::{
    CodeChange, Evolution, EvolutionMetrics, EvolutionStatus, StatusChange, TestResults,
    ValidationResults,
};
pub use hypothesis::{Category, ExpectedImpact, ImprovementHypothesis};
pub use pattern::{Pattern, PatternContext, PatternImpact, PatternKind};

/// `true` when `value` is a finite number in `[0, 1]`.
pub(crate) fn is_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}
