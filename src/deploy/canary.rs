//! Canary rollout: widen traffic stage by stage, holding each stage under
//! health watch before advancing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::{DeployContext, FlagUpdate};
use crate::error::{ConfigError, DeploymentError};
use crate::model::{Deployment, DeploymentPhase, StageRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryStage {
    pub percentage: u8,
    pub hold_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Strictly increasing percentages ending at 100.
    pub stages: Vec<CanaryStage>,
    pub poll_interval_ms: u64,
    /// Decrement applied per rollback step.
    pub rollback_step_pct: u8,
    pub rollback_pause_ms: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                CanaryStage { percentage: 10, hold_ms: 5 * 60_000 },
                CanaryStage { percentage: 50, hold_ms: 10 * 60_000 },
                CanaryStage { percentage: 100, hold_ms: 15 * 60_000 },
            ],
            poll_interval_ms: 30_000,
            rollback_step_pct: 25,
            rollback_pause_ms: 10_000,
        }
    }
}

impl CanaryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::invalid("canary.stages", "at least one stage is required"));
        }
        let mut prev = 0u8;
        for s in &self.stages {
            if s.percentage <= prev || s.percentage > 100 {
                return Err(ConfigError::invalid(
                    "canary.stages",
                    format!("percentages must strictly increase within 1..=100 (got {} after {})", s.percentage, prev),
                ));
            }
            prev = s.percentage;
        }
        if prev != 100 {
            return Err(ConfigError::invalid("canary.stages", "the last stage must route 100%"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("canary.poll_interval_ms", "must be > 0"));
        }
        if self.rollback_step_pct == 0 || self.rollback_step_pct > 100 {
            return Err(ConfigError::invalid("canary.rollback_step_pct", "must be in 1..=100"));
        }
        Ok(())
    }
}

pub struct CanaryStrategy {
    pub(crate) ctx: DeployContext,
    config: CanaryConfig,
}

impl CanaryStrategy {
    pub fn new(ctx: DeployContext, config: CanaryConfig) -> Self {
        Self { ctx, config }
    }

    pub(crate) async fn execute(&self, d: &mut Deployment) -> Result<(), DeploymentError> {
        d.stages = self.config.stages.iter().map(|s| StageRecord::planned(s.percentage)).collect();
        d.phase = DeploymentPhase::Rolling;
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        for (idx, stage) in self.config.stages.iter().enumerate() {
            d.current_stage_index = idx;
            d.stages[idx].started_at_ms = Some(self.ctx.clock.now_ms());
            self.ctx.route_to(d, FlagUpdate::route(stage.percentage)).await?;

            let breach = self.ctx.hold(d, Duration::from_millis(stage.hold_ms), poll).await?;
            let ended = self.ctx.clock.now_ms();
            let record = &mut d.stages[idx];
            record.ended_at_ms = Some(ended);
            record.success = Some(breach.is_none());

            if let Some(reason) = breach {
                tracing::warn!(
                    target: "evolution::deploy",
                    deployment_id = %d.id,
                    stage = idx,
                    percentage = stage.percentage,
                    reason = %reason,
                    "canary stage failed"
                );
                return Err(DeploymentError::Breach {
                    deployment_id: d.id.clone(),
                    percentage: stage.percentage,
                    reason,
                });
            }
            tracing::info!(
                target: "evolution::deploy",
                deployment_id = %d.id,
                stage = idx,
                percentage = stage.percentage,
                "canary stage passed"
            );
        }

        d.phase = DeploymentPhase::Completed;
        d.finish(self.ctx.clock.now_ms());
        Ok(())
    }

    pub(crate) async fn rollback(&self, d: &mut Deployment) -> Result<(), DeploymentError> {
        self.ctx
            .ramp_down(d, self.config.rollback_step_pct, Duration::from_millis(self.config.rollback_pause_ms))
            .await
    }
}
