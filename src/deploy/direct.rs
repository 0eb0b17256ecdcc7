//! Direct rollout: all traffic in one write, one health check.

use crate::deploy::{DeployContext, FlagUpdate};
use crate::error::{DeploymentError, FlagError};
use crate::model::{Deployment, DeploymentPhase, StageRecord};

pub struct DirectStrategy {
    pub(crate) ctx: DeployContext,
}

impl DirectStrategy {
    pub fn new(ctx: DeployContext) -> Self {
        Self { ctx }
    }

    pub(crate) async fn execute(&self, d: &mut Deployment) -> Result<(), DeploymentError> {
        let now = self.ctx.clock.now_ms();
        d.stages = vec![StageRecord::planned(100)];
        d.current_stage_index = 0;
        d.stages[0].started_at_ms = Some(now);

        self.ctx.route_to(d, FlagUpdate::route(100)).await?;
        d.phase = DeploymentPhase::Active;

        let status = self.ctx.probe(d).await?;
        let ended = self.ctx.clock.now_ms();
        let stage = &mut d.stages[0];
        stage.metrics.observe(&status);
        stage.ended_at_ms = Some(ended);

        if let Some(reason) = self.ctx.thresholds.breach_reason(status.error_rate, status.response_time_ms) {
            stage.success = Some(false);
            return Err(DeploymentError::Breach { deployment_id: d.id.clone(), percentage: 100, reason });
        }
        stage.success = Some(true);
        d.phase = DeploymentPhase::Completed;
        d.finish(ended);
        Ok(())
    }

    /// Single compare-and-set back to 0 %, disabled.
    pub(crate) async fn rollback(&self, d: &mut Deployment) -> Result<(), DeploymentError> {
        d.phase = DeploymentPhase::RollingBack;
        match self.ctx.flags.compare_and_set(&d.evolution_id, d.routed_percentage, FlagUpdate::disable()).await {
            Ok(_) => {}
            Err(FlagError::Conflict { actual, .. }) => {
                tracing::warn!(
                    target: "evolution::deploy",
                    deployment_id = %d.id,
                    actual,
                    "flag changed before direct rollback; forcing disable"
                );
                self.ctx.flags.update_flag(&d.evolution_id, FlagUpdate::disable()).await?;
            }
            Err(e) => return Err(e.into()),
        }
        d.routed_percentage = 0;
        d.rollback_steps.push(0);
        d.phase = DeploymentPhase::RolledBack;
        d.finish(self.ctx.clock.now_ms());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::{context, sample, ScriptedProbe};
    use crate::deploy::{DeploymentStrategy, FeatureFlagStore};
    use crate::model::StrategyKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_healthy_direct_rollout_completes_at_100() {
        let (ctx, flags, _) = context(Arc::new(ScriptedProbe::healthy()));
        let strategy = DeploymentStrategy::Direct(DirectStrategy::new(ctx));
        let mut d = Deployment::new("evo-d", StrategyKind::Direct, 0);
        strategy.execute(&mut d).await.unwrap();
        assert_eq!(d.phase, DeploymentPhase::Completed);
        assert_eq!(flags.history("evo-d"), vec![100]);
        assert_eq!(d.stages[0].success, Some(true));
        assert_eq!(d.metrics.affected_users, 10);
    }

    #[tokio::test]
    async fn test_unhealthy_direct_rollout_breaches_without_rolling_back() {
        let (ctx, flags, _) = context(Arc::new(ScriptedProbe::new(vec![sample(0.2, 100.0)])));
        let strategy = DeploymentStrategy::Direct(DirectStrategy::new(ctx));
        let mut d = Deployment::new("evo-d", StrategyKind::Direct, 0);
        let err = strategy.execute(&mut d).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Breach { percentage: 100, .. }));
        assert_eq!(flags.get("evo-d").await.unwrap().unwrap().percentage, 100, "caller decides");

        strategy.rollback(&mut d).await.unwrap();
        assert_eq!(d.phase, DeploymentPhase::RolledBack);
        let state = flags.get("evo-d").await.unwrap().unwrap();
        assert_eq!(state.percentage, 0);
        assert!(!state.enabled);

        strategy.rollback(&mut d).await.unwrap();
        assert_eq!(flags.history("evo-d"), vec![100, 0], "second rollback is a no-op");
    }

    #[tokio::test]
    async fn test_execute_twice_is_invalid_phase() {
        let (ctx, _, _) = context(Arc::new(ScriptedProbe::healthy()));
        let strategy = DeploymentStrategy::Direct(DirectStrategy::new(ctx));
        let mut d = Deployment::new("evo-d", StrategyKind::Direct, 0);
        strategy.execute(&mut d).await.unwrap();
        let err = strategy.execute(&mut d).await.unwrap_err();
        assert!(err.is_pre_traffic());
    }
}
