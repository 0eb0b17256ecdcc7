//! # Stage: Deployment
//!
//! ## Responsibility
//! Roll a validated evolution out to production traffic through one of three
//! strategies, watch its health, and reverse it on request.
//!
//! ```text
//! Direct     idle ─► active(100%) ─► completed
//! Canary     idle ─► rolling(10%) ─► rolling(50%) ─► rolling(100%) ─► completed
//! BlueGreen  idle ─► provisioning ─► smoke_testing ─► soaking(100%) ─► completed
//!                                          └─► aborted (no traffic moved)
//! any live phase ─► rolling_back ─► rolled_back
//! ```
//!
//! ## Guarantees
//! - Every routing write is a compare-and-set against the percentage the
//!   deployment last wrote, so a concurrent writer is detected, never
//!   overwritten.
//! - Routed percentage only rises during `execute` and only falls during
//!   `rollback`.
//! - Strategies never roll back inside `execute`; the caller decides.
//! - All waiting goes through the injected [`Clock`].

pub mod blue_green;
pub mod canary;
pub mod direct;
pub mod flags;
pub mod health;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ConfigError, DeploymentError, FlagError};
use crate::model::{Deployment, DeploymentPhase, HealthStatus, StageMetrics, StrategyKind};

pub use blue_green::{BlueGreenConfig, BlueGreenStrategy, EnvironmentManager, SmokeCheck, SmokeCheckKind};
pub use canary::{CanaryConfig, CanaryStage, CanaryStrategy};
pub use direct::DirectStrategy;
pub use flags::{FeatureFlagStore, FlagState, FlagUpdate, InMemoryFlagStore};
pub use health::{HealthProbe, HealthSample, HealthThresholds};

/// Conflicting writes tolerated while ramping down before giving up.
const MAX_RAMP_CONFLICTS: usize = 8;

// ---------------------------------------------------------------------------
// DeployContext
// ---------------------------------------------------------------------------

/// Collaborators every strategy needs.
#[derive(Clone)]
pub struct DeployContext {
    pub flags: Arc<dyn FeatureFlagStore>,
    pub probe: Arc<dyn HealthProbe>,
    pub clock: Arc<dyn Clock>,
    pub thresholds: HealthThresholds,
}

impl DeployContext {
    /// CAS the flag from the deployment's last written percentage to `pct`.
    pub(crate) async fn route_to(&self, d: &mut Deployment, update: FlagUpdate) -> Result<(), FlagError> {
        let pct = update.percentage.unwrap_or(d.routed_percentage);
        self.flags.compare_and_set(&d.evolution_id, d.routed_percentage, update).await?;
        d.routed_percentage = pct;
        tracing::debug!(
            target: "evolution::deploy",
            deployment_id = %d.id,
            evolution_id = %d.evolution_id,
            percentage = pct,
            "traffic routed"
        );
        Ok(())
    }

    /// Take one health sample and record it on the deployment.
    pub(crate) async fn probe(&self, d: &mut Deployment) -> Result<HealthStatus, DeploymentError> {
        let sample = self.probe.sample(&d.evolution_id, d.routed_percentage).await?;
        let status = self.thresholds.assess(&sample);
        d.metrics.affected_users = d.metrics.affected_users.saturating_add(sample.affected_users);
        d.last_health = Some(status.clone());
        Ok(status)
    }

    /// Sample every `poll` for `hold`, tracking worst values in `stage_metrics`
    /// of the current stage.  Returns the breach reason as soon as the worst
    /// observation crosses a ceiling.
    pub(crate) async fn hold(
        &self,
        d: &mut Deployment,
        hold: Duration,
        poll: Duration,
    ) -> Result<Option<String>, DeploymentError> {
        let mut elapsed = Duration::ZERO;
        loop {
            let wait = poll.min(hold.saturating_sub(elapsed));
            if !wait.is_zero() {
                self.clock.sleep(wait).await;
                elapsed += wait;
            }
            let status = self.probe(d).await?;
            let idx = d.current_stage_index;
            let metrics: StageMetrics = match d.stages.get_mut(idx) {
                Some(stage) => {
                    stage.metrics.observe(&status);
                    stage.metrics
                }
                None => StageMetrics::default(),
            };
            if let Some(reason) = self.thresholds.breach_reason(metrics.worst_error_rate, metrics.worst_response_time_ms) {
                return Ok(Some(reason));
            }
            if elapsed >= hold {
                return Ok(None);
            }
        }
    }

    /// Walk traffic down to zero in `step` decrements with `pause` between
    /// writes, then disable the flag.  Conflicting writers are re-read and
    /// the ramp continues from the observed percentage.
    pub(crate) async fn ramp_down(&self, d: &mut Deployment, step: u8, pause: Duration) -> Result<(), DeploymentError> {
        d.phase = DeploymentPhase::RollingBack;
        let step = step.max(1);
        let mut conflicts = 0;
        while d.routed_percentage > 0 {
            let next = d.routed_percentage.saturating_sub(step);
            match self.flags.compare_and_set(&d.evolution_id, d.routed_percentage, FlagUpdate::route(next)).await {
                Ok(_) => {
                    d.routed_percentage = next;
                    d.rollback_steps.push(next);
                    if next > 0 {
                        self.clock.sleep(pause).await;
                    }
                }
                Err(FlagError::Conflict { actual, .. }) if conflicts < MAX_RAMP_CONFLICTS => {
                    conflicts += 1;
                    tracing::warn!(
                        target: "evolution::deploy",
                        deployment_id = %d.id,
                        expected = d.routed_percentage,
                        actual,
                        "flag changed underneath rollback; continuing from observed percentage"
                    );
                    d.routed_percentage = actual;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.flags.update_flag(&d.evolution_id, FlagUpdate::disable()).await?;
        d.phase = DeploymentPhase::RolledBack;
        d.finish(self.clock.now_ms());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StrategySelection
// ---------------------------------------------------------------------------

/// Risk bands mapping an evolution's risk level to a rollout strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySelection {
    pub direct_max_risk: f64,
    pub canary_max_risk: f64,
}

impl Default for StrategySelection {
    fn default() -> Self {
        Self { direct_max_risk: 0.3, canary_max_risk: 0.5 }
    }
}

impl StrategySelection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.direct_max_risk) || !(0.0..=1.0).contains(&self.canary_max_risk) {
            return Err(ConfigError::invalid("strategy", "risk bands must be in [0, 1]"));
        }
        if self.direct_max_risk > self.canary_max_risk {
            return Err(ConfigError::invalid("strategy.direct_max_risk", "must not exceed canary_max_risk"));
        }
        Ok(())
    }

    pub fn select(&self, risk_level: f64) -> StrategyKind {
        if risk_level <= self.direct_max_risk {
            StrategyKind::Direct
        } else if risk_level <= self.canary_max_risk {
            StrategyKind::Canary
        } else {
            StrategyKind::BlueGreen
        }
    }
}

// ---------------------------------------------------------------------------
// DeploymentStrategy
// ---------------------------------------------------------------------------

pub enum DeploymentStrategy {
    Direct(DirectStrategy),
    Canary(CanaryStrategy),
    BlueGreen(BlueGreenStrategy),
}

impl DeploymentStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            DeploymentStrategy::Direct(_) => StrategyKind::Direct,
            DeploymentStrategy::Canary(_) => StrategyKind::Canary,
            DeploymentStrategy::BlueGreen(_) => StrategyKind::BlueGreen,
        }
    }

    fn context(&self) -> &DeployContext {
        match self {
            DeploymentStrategy::Direct(s) => &s.ctx,
            DeploymentStrategy::Canary(s) => &s.ctx,
            DeploymentStrategy::BlueGreen(s) => &s.ctx,
        }
    }

    pub async fn execute(&self, deployment: &mut Deployment) -> Result<(), DeploymentError> {
        if deployment.phase != DeploymentPhase::Idle {
            return Err(DeploymentError::InvalidPhase {
                deployment_id: deployment.id.clone(),
                phase: deployment.phase.to_string(),
            });
        }
        tracing::info!(
            target: "evolution::deploy",
            deployment_id = %deployment.id,
            evolution_id = %deployment.evolution_id,
            strategy = %self.kind(),
            "rollout starting"
        );
        let result = match self {
            DeploymentStrategy::Direct(s) => s.execute(deployment).await,
            DeploymentStrategy::Canary(s) => s.execute(deployment).await,
            DeploymentStrategy::BlueGreen(s) => s.execute(deployment).await,
        };
        match &result {
            Ok(()) => tracing::info!(
                target: "evolution::deploy",
                deployment_id = %deployment.id,
                duration_ms = deployment.metrics.duration_ms,
                "rollout completed"
            ),
            Err(e) => tracing::warn!(
                target: "evolution::deploy",
                deployment_id = %deployment.id,
                phase = %deployment.phase,
                error = %e,
                "rollout stopped"
            ),
        }
        result
    }

    /// One health sample of whatever is serving the change right now.
    pub async fn monitor(&self, deployment: &mut Deployment) -> Result<HealthStatus, DeploymentError> {
        self.context().probe(deployment).await
    }

    /// Reverse the rollout.  Idempotent: a rolled-back deployment is left alone.
    pub async fn rollback(&self, deployment: &mut Deployment) -> Result<(), DeploymentError> {
        if deployment.phase == DeploymentPhase::RolledBack {
            return Ok(());
        }
        let result = match self {
            DeploymentStrategy::Direct(s) => s.rollback(deployment).await,
            DeploymentStrategy::Canary(s) => s.rollback(deployment).await,
            DeploymentStrategy::BlueGreen(s) => s.rollback(deployment).await,
        };
        match &result {
            Ok(()) => tracing::info!(
                target: "evolution::deploy",
                deployment_id = %deployment.id,
                steps = ?deployment.rollback_steps,
                "rollback completed"
            ),
            Err(e) => tracing::error!(
                target: "evolution::deploy",
                deployment_id = %deployment.id,
                error = %e,
                "rollback failed"
            ),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

/// Builds the strategy for an evolution's risk level.
pub struct Deployer {
    ctx: DeployContext,
    canary: CanaryConfig,
    blue_green: BlueGreenConfig,
    environments: Arc<dyn EnvironmentManager>,
    selection: StrategySelection,
}

impl Deployer {
    pub fn new(
        ctx: DeployContext,
        canary: CanaryConfig,
        blue_green: BlueGreenConfig,
        environments: Arc<dyn EnvironmentManager>,
        selection: StrategySelection,
    ) -> Self {
        Self { ctx, canary, blue_green, environments, selection }
    }

    pub fn context(&self) -> &DeployContext {
        &self.ctx
    }

    pub fn select(&self, risk_level: f64) -> StrategyKind {
        self.selection.select(risk_level)
    }

    pub fn strategy(&self, kind: StrategyKind) -> DeploymentStrategy {
        match kind {
            StrategyKind::Direct => DeploymentStrategy::Direct(DirectStrategy::new(self.ctx.clone())),
            StrategyKind::Canary => {
                DeploymentStrategy::Canary(CanaryStrategy::new(self.ctx.clone(), self.canary.clone()))
            }
            StrategyKind::BlueGreen => DeploymentStrategy::BlueGreen(BlueGreenStrategy::new(
                self.ctx.clone(),
                self.blue_green.clone(),
                Arc::clone(&self.environments),
            )),
        }
    }

    /// A fresh deployment record plus the strategy that will drive it.
    pub fn plan(&self, evolution_id: &str, kind: StrategyKind) -> (Deployment, DeploymentStrategy) {
        (Deployment::new(evolution_id, kind, self.ctx.clock.now_ms()), self.strategy(kind))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
