//! Rollout records.  A [`Deployment`] is owned by the strategy executing it
//! and mutated in place as stages advance.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which rollout strategy a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Direct,
    Canary,
    BlueGreen,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [StrategyKind::Direct, StrategyKind::Canary, StrategyKind::BlueGreen];
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Direct => write!(f, "direct"),
            StrategyKind::Canary => write!(f, "canary"),
            StrategyKind::BlueGreen => write!(f, "blue-green"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Idle,
    Provisioning,
    SmokeTesting,
    /// Canary stages in progress.
    Rolling,
    /// Direct rollout live.
    Active,
    /// Blue-green switched; watching the new environment.
    Soaking,
    Completed,
    RollingBack,
    RolledBack,
    /// Stopped before any traffic moved.
    Aborted,
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentPhase::Idle => "idle",
            DeploymentPhase::Provisioning => "provisioning",
            DeploymentPhase::SmokeTesting => "smoke_testing",
            DeploymentPhase::Rolling => "rolling",
            DeploymentPhase::Active => "active",
            DeploymentPhase::Soaking => "soaking",
            DeploymentPhase::Completed => "completed",
            DeploymentPhase::RollingBack => "rolling_back",
            DeploymentPhase::RolledBack => "rolled_back",
            DeploymentPhase::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Worst observations during one stage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageMetrics {
    pub worst_error_rate: f64,
    pub worst_response_time_ms: f64,
    pub samples: u32,
}

impl StageMetrics {
    pub fn observe(&mut self, health: &HealthStatus) {
        self.worst_error_rate = self.worst_error_rate.max(health.error_rate);
        self.worst_response_time_ms = self.worst_response_time_ms.max(health.response_time_ms);
        self.samples += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub percentage: u8,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    pub success: Option<bool>,
    pub metrics: StageMetrics,
}

impl StageRecord {
    pub fn planned(percentage: u8) -> Self {
        Self { percentage, started_at_ms: None, ended_at_ms: None, success: None, metrics: StageMetrics::default() }
    }
}

/// Blue-green environment bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Environments {
    pub blue: Option<String>,
    pub green: Option<String>,
    pub old_decommissioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    pub affected_users: u64,
    pub duration_ms: u64,
}

/// Point-in-time health of the code serving an evolution's traffic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub user_feedback: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub evolution_id: String,
    pub strategy: StrategyKind,
    pub phase: DeploymentPhase,
    pub stages: Vec<StageRecord>,
    pub current_stage_index: usize,
    pub environments: Environments,
    pub last_health: Option<HealthStatus>,
    /// Percentage of traffic this deployment last routed to the change.
    pub routed_percentage: u8,
    /// Percentages written while ramping down, in order.
    pub rollback_steps: Vec<u8>,
    pub metrics: DeploymentMetrics,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl Deployment {
    pub fn new(evolution_id: impl Into<String>, strategy: StrategyKind, now_ms: u64) -> Self {
        Self {
            id: format!("dep-{}", Uuid::new_v4()),
            evolution_id: evolution_id.into(),
            strategy,
            phase: DeploymentPhase::Idle,
            stages: Vec::new(),
            current_stage_index: 0,
            environments: Environments::default(),
            last_health: None,
            routed_percentage: 0,
            rollback_steps: Vec::new(),
            metrics: DeploymentMetrics::default(),
            created_at_ms: now_ms,
            completed_at_ms: None,
        }
    }

    /// Stamp completion time and total duration.
    pub fn finish(&mut self, now_ms: u64) {
        self.completed_at_ms = Some(now_ms);
        self.metrics.duration_ms = now_ms.saturating_sub(self.created_at_ms);
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            DeploymentPhase::Completed | DeploymentPhase::RolledBack | DeploymentPhase::Aborted
        )
    }
}
