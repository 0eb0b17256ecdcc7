//! Blue-green rollout: stand up a parallel environment, smoke-test it, switch
//! all traffic atomically, soak, then retire the old environment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deploy::{DeployContext, FlagUpdate};
use crate::error::{CollaboratorError, ConfigError, DeploymentError, FlagError};
use crate::model::{Deployment, DeploymentPhase, StageRecord};

const ENVIRONMENT_KEY: &str = "environment";

// ---------------------------------------------------------------------------
// Smoke checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmokeCheckKind {
    EndpointHealth,
    CriticalPath,
    DependencyConnectivity,
}

impl SmokeCheckKind {
    pub const REQUIRED: [SmokeCheckKind; 3] = [
        SmokeCheckKind::EndpointHealth,
        SmokeCheckKind::CriticalPath,
        SmokeCheckKind::DependencyConnectivity,
    ];
}

impl std::fmt::Display for SmokeCheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmokeCheckKind::EndpointHealth => write!(f, "endpoint-health"),
            SmokeCheckKind::CriticalPath => write!(f, "critical-path"),
            SmokeCheckKind::DependencyConnectivity => write!(f, "dependency-connectivity"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmokeCheck {
    pub name: String,
    pub kind: SmokeCheckKind,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Provisions and retires the environments a blue-green rollout switches
/// between.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Name of the environment currently serving traffic.
    async fn live_environment(&self) -> Result<String, CollaboratorError>;

    /// Stand up a new environment running `evolution_id`'s change.
    async fn provision(&self, evolution_id: &str) -> Result<String, CollaboratorError>;

    async fn smoke_test(&self, environment: &str) -> Result<Vec<SmokeCheck>, CollaboratorError>;

    async fn decommission(&self, environment: &str) -> Result<(), CollaboratorError>;
}

/// Names of failed checks plus every required kind that was not run.
fn failed_checks(checks: &[SmokeCheck]) -> Vec<String> {
    let mut failed: Vec<String> = checks.iter().filter(|c| !c.passed).map(|c| c.name.clone()).collect();
    for kind in SmokeCheckKind::REQUIRED {
        if !checks.iter().any(|c| c.kind == kind) {
            failed.push(format!("missing:{kind}"));
        }
    }
    failed
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenConfig {
    pub soak_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self { soak_ms: 10 * 60_000, poll_interval_ms: 30_000 }
    }
}

impl BlueGreenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("blue_green.poll_interval_ms", "must be > 0"));
        }
        Ok(())
    }
}

pub struct BlueGreenStrategy {
    pub(crate) ctx: DeployContext,
    config: BlueGreenConfig,
    environments: Arc<dyn EnvironmentManager>,
}

impl BlueGreenStrategy {
    pub fn new(ctx: DeployContext, config: BlueGreenConfig, environments: Arc<dyn EnvironmentManager>) -> Self {
        Self { ctx, config, environments }
    }

    pub(crate) async fn execute(&self, d: &mut Deployment) -> Result<(), DeploymentError> {
        d.phase = DeploymentPhase::Provisioning;
        let blue = self.environments.live_environment().await?;
        d.environments.blue = Some(blue.clone());
        let green = self.environments.provision(&d.evolution_id).await?;
        d.environments.green = Some(green.clone());

        d.phase = DeploymentPhase::SmokeTesting;
        let checks = self.environments.smoke_test(&green).await?;
        let failed = failed_checks(&checks);
        if !failed.is_empty() {
            d.phase = DeploymentPhase::Aborted;
            self.discard(&green).await;
            d.environments.green = None;
            d.finish(self.ctx.clock.now_ms());
            return Err(DeploymentError::SmokeTestFailed { deployment_id: d.id.clone(), failed });
        }

        d.stages = vec![StageRecord::planned(100)];
        d.current_stage_index = 0;
        d.stages[0].started_at_ms = Some(self.ctx.clock.now_ms());
        self.ctx.route_to(d, FlagUpdate::route(100).with_metadata(ENVIRONMENT_KEY, green.as_str())).await?;
        d.phase = DeploymentPhase::Soaking;
        tracing::info!(
            target: "evolution::deploy",
            deployment_id = %d.id,
            from = %blue,
            to = %green,
            "traffic switched"
        );

        let breach = self
            .ctx
            .hold(d, Duration::from_millis(self.config.soak_ms), Duration::from_millis(self.config.poll_interval_ms))
            .await?;
        let ended = self.ctx.clock.now_ms();
        d.stages[0].ended_at_ms = Some(ended);
        d.stages[0].success = Some(breach.is_none());
        if let Some(reason) = breach {
            return Err(DeploymentError::Breach { deployment_id: d.id.clone(), percentage: 100, reason });
        }

        match self.environments.decommission(&blue).await {
            Ok(()) => d.environments.old_decommissioned = true,
            Err(e) => tracing::warn!(
                target: "evolution::deploy",
                deployment_id = %d.id,
                environment = %blue,
                error = %e,
                "failed to decommission old environment"
            ),
        }
        d.phase = DeploymentPhase::Completed;
        d.finish(ended);
        Ok(())
    }

    /// Switch traffic back to blue and discard green.
    pub(crate) async fn rollback(&self, d: &mut Deployment) -> Result<(), DeploymentError> {
        d.phase = DeploymentPhase::RollingBack;
        if d.routed_percentage > 0 {
            let mut update = FlagUpdate::disable();
            if let Some(blue) = &d.environments.blue {
                update = update.with_metadata(ENVIRONMENT_KEY, blue.as_str());
            }
            match self.ctx.flags.compare_and_set(&d.evolution_id, d.routed_percentage, update.clone()).await {
                Ok(_) => {}
                Err(FlagError::Conflict { actual, .. }) => {
                    tracing::warn!(
                        target: "evolution::deploy",
                        deployment_id = %d.id,
                        actual,
                        "flag changed before switch-back; forcing"
                    );
                    self.ctx.flags.update_flag(&d.evolution_id, update).await?;
                }
                Err(e) => return Err(e.into()),
            }
            d.routed_percentage = 0;
            d.rollback_steps.push(0);
        }
        if let Some(green) = d.environments.green.take() {
            self.discard(&green).await;
        }
        d.phase = DeploymentPhase::RolledBack;
        d.finish(self.ctx.clock.now_ms());
        Ok(())
    }

    async fn discard(&self, environment: &str) {
        if let Err(e) = self.environments.decommission(environment).await {
            tracing::warn!(
                target: "evolution::deploy",
                environment = %environment,
                error = %e,
                "failed to discard environment"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::{context, sample, ScriptedProbe};
    use crate::deploy::{DeploymentStrategy, FeatureFlagStore, InMemoryFlagStore};
    use crate::model::StrategyKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEnvs {
        fail: Vec<SmokeCheckKind>,
        omit: Option<SmokeCheckKind>,
        decommissioned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EnvironmentManager for FakeEnvs {
        async fn live_environment(&self) -> Result<String, CollaboratorError> {
            Ok("blue".into())
        }

        async fn provision(&self, evolution_id: &str) -> Result<String, CollaboratorError> {
            Ok(format!("green-{evolution_id}"))
        }

        async fn smoke_test(&self, _environment: &str) -> Result<Vec<SmokeCheck>, CollaboratorError> {
            Ok(SmokeCheckKind::REQUIRED
                .into_iter()
                .filter(|k| Some(*k) != self.omit)
                .map(|kind| SmokeCheck { name: kind.to_string(), kind, passed: !self.fail.contains(&kind), detail: None })
                .collect())
        }

        async fn decommission(&self, environment: &str) -> Result<(), CollaboratorError> {
            self.decommissioned.lock().unwrap().push(environment.to_string());
            Ok(())
        }
    }

    fn strategy(envs: Arc<FakeEnvs>, probe: ScriptedProbe) -> (DeploymentStrategy, Arc<InMemoryFlagStore>) {
        let (ctx, flags, _) = context(Arc::new(probe));
        (DeploymentStrategy::BlueGreen(BlueGreenStrategy::new(ctx, BlueGreenConfig::default(), envs)), flags)
    }

    #[tokio::test]
    async fn test_successful_switch_decommissions_blue() {
        let envs = Arc::new(FakeEnvs::default());
        let (s, flags) = strategy(envs.clone(), ScriptedProbe::healthy());
        let mut d = Deployment::new("e1", StrategyKind::BlueGreen, 0);
        s.execute(&mut d).await.unwrap();
        assert_eq!(d.phase, DeploymentPhase::Completed);
        assert!(d.environments.old_decommissioned);
        assert_eq!(*envs.decommissioned.lock().unwrap(), vec!["blue".to_string()]);
        let state = flags.get("e1").await.unwrap().unwrap();
        assert_eq!(state.percentage, 100);
        assert_eq!(state.metadata.get("environment").map(String::as_str), Some("green-e1"));
    }

    #[tokio::test]
    async fn test_smoke_failure_aborts_without_traffic_change() {
        let envs = Arc::new(FakeEnvs { fail: vec![SmokeCheckKind::CriticalPath], ..Default::default() });
        let (s, flags) = strategy(envs.clone(), ScriptedProbe::healthy());
        let mut d = Deployment::new("e1", StrategyKind::BlueGreen, 0);
        let err = s.execute(&mut d).await.unwrap_err();
        assert!(err.is_pre_traffic());
        assert!(err.to_string().contains("critical-path"));
        assert_eq!(d.phase, DeploymentPhase::Aborted);
        assert!(flags.history("e1").is_empty());
        assert_eq!(*envs.decommissioned.lock().unwrap(), vec!["green-e1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_smoke_category_counts_as_failure() {
        let envs = Arc::new(FakeEnvs { omit: Some(SmokeCheckKind::DependencyConnectivity), ..Default::default() });
        let (s, _) = strategy(envs, ScriptedProbe::healthy());
        let mut d = Deployment::new("e1", StrategyKind::BlueGreen, 0);
        let err = s.execute(&mut d).await.unwrap_err();
        assert!(err.to_string().contains("missing:dependency-connectivity"));
    }

    #[tokio::test]
    async fn test_soak_breach_then_rollback_switches_back() {
        let envs = Arc::new(FakeEnvs::default());
        let (s, flags) = strategy(envs.clone(), ScriptedProbe::new(vec![sample(0.01, 100.0), sample(0.01, 800.0)]));
        let mut d = Deployment::new("e1", StrategyKind::BlueGreen, 0);
        let err = s.execute(&mut d).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Breach { percentage: 100, .. }));
        assert!(envs.decommissioned.lock().unwrap().is_empty(), "blue kept until soak passes");

        s.rollback(&mut d).await.unwrap();
        let state = flags.get("e1").await.unwrap().unwrap();
        assert_eq!(state.percentage, 0);
        assert_eq!(state.metadata.get("environment").map(String::as_str), Some("blue"));
        assert_eq!(*envs.decommissioned.lock().unwrap(), vec!["green-e1".to_string()]);

        s.rollback(&mut d).await.unwrap();
        assert_eq!(envs.decommissioned.lock().unwrap().len(), 1, "idempotent");
    }
}
