//! Autonomous improvement pipeline.
//!
//! Telemetry is mined for recurring inefficiencies, each one becomes a ranked
//! improvement hypothesis, and admitted hypotheses run as independent
//! evolutions: candidate generation, a sandboxed trial, a validation gate,
//! approval, and a staged rollout that is rolled back on a health breach.
//! [`orchestrator::Orchestrator`] drives the loop; every external system sits
//! behind a trait in [`collaborators`], [`deploy`], [`sandbox`],
//! [`telemetry`] or [`store`].

pub mod analysis;
pub mod cli;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod deploy;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod rollback;
pub mod sandbox;
pub mod simulation;
pub mod store;
pub mod telemetry;

pub use config::PipelineConfig;
pub use error::{OrchestratorError, TaskError};
pub use orchestrator::{CycleReport, Orchestrator, OrchestratorStatus, PipelineComponents};
