//! # Module: error
//!
//! Error enums for every layer of the pipeline.  Each concern owns one enum;
//! `TaskError` is the union an evolution task can fail with, and it never
//! crosses the task boundary (the orchestrator records it on the evolution).

use std::time::Duration;

use thiserror::Error;

use crate::model::EvolutionStatus;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a [`crate::config::PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field: field.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Schema and state-machine violations at the data-model boundary.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid {entity} '{id}': {reason}")]
    Schema { entity: &'static str, id: String, reason: String },

    #[error("invalid transition for evolution '{id}': {from} -> {to}")]
    InvalidTransition { id: String, from: EvolutionStatus, to: EvolutionStatus },
}

impl ModelError {
    pub(crate) fn schema(entity: &'static str, id: &str, reason: impl Into<String>) -> Self {
        ModelError::Schema { entity, id: id.to_string(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to read telemetry: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed telemetry record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Infrastructure failures of the sandbox itself.
///
/// A candidate that runs and fails, or runs past its deadline, is *not* a
/// `SandboxError`: those are reported as [`crate::sandbox::TrialResult`]
/// variants so callers can tell them apart.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("failed to prepare sandbox: {0}")]
    Setup(#[source] std::io::Error),

    #[error("failed to spawn candidate: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed while waiting for candidate: {0}")]
    Wait(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlagError {
    #[error(
        "flag for evolution '{evolution_id}' changed concurrently: expected {expected}%, found {actual}%"
    )]
    Conflict { evolution_id: String, expected: u8, actual: u8 },

    #[error("routing percentage {0} is outside 0..=100")]
    OutOfRange(u8),

    #[error("flag store lock poisoned")]
    LockPoisoned,
}

// ---------------------------------------------------------------------------
// External collaborators
// ---------------------------------------------------------------------------

/// Failures reported by an external collaborator (code generator, approval
/// UI, health probe, environment manager).
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("code generation failed: {0}")]
    CodeGen(String),

    #[error("approval request failed: {0}")]
    Approval(String),

    #[error("health probe failed: {0}")]
    Health(String),

    #[error("environment operation failed: {0}")]
    Environment(String),
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

/// Errors surfaced by a deployment strategy.  Strategies never roll back on
/// their own; these go to the caller, which decides whether to call
/// `rollback`.
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("health breach at {percentage}% for deployment '{deployment_id}': {reason}")]
    Breach { deployment_id: String, percentage: u8, reason: String },

    #[error("smoke tests failed for deployment '{deployment_id}': [{}]", .failed.join(", "))]
    SmokeTestFailed { deployment_id: String, failed: Vec<String> },

    #[error("deployment '{deployment_id}' cannot execute from phase {phase}")]
    InvalidPhase { deployment_id: String, phase: String },

    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl DeploymentError {
    /// `true` when the rollout failed before any traffic reached the change.
    pub fn is_pre_traffic(&self) -> bool {
        matches!(self, DeploymentError::SmokeTestFailed { .. } | DeploymentError::InvalidPhase { .. })
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialise record: {0}")]
    Serde(#[from] serde_json::Error),

    #[cfg(feature = "sqlite-store")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    LockPoisoned,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("orchestrator is not running")]
    NotRunning,

    #[error("no active evolution with id '{0}'")]
    UnknownEvolution(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Any failure inside one evolution task.  Caught at the task boundary,
/// counted in `failure_count`, and recorded as the evolution's failure reason.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("code generation timed out after {0:?}")]
    CodeGenTimeout(Duration),

    #[error("code generator returned a candidate for hypothesis '{got}', expected '{expected}'")]
    HypothesisMismatch { expected: String, got: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("evolution task panicked: {0}")]
    Panicked(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
