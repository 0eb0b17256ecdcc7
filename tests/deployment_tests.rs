//! Rollout strategies driven together with the rollback manager, through the
//! public deploy API only.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use evolution_pipeline::clock::{Clock, ManualClock};
use evolution_pipeline::deploy::{
    BlueGreenConfig, CanaryConfig, DeployContext, Deployer, FeatureFlagStore, FlagUpdate, HealthProbe,
    HealthSample, HealthThresholds, InMemoryFlagStore, StrategySelection,
};
use evolution_pipeline::error::{CollaboratorError, DeploymentError};
use evolution_pipeline::model::{
    Category, DeploymentPhase, Evolution, ImprovementHypothesis, StrategyKind,
};
use evolution_pipeline::rollback::{RollbackManager, RollbackOutcome};
use evolution_pipeline::simulation::SimulatedEnvironments;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Healthy for the first `healthy_samples` calls, then degraded.
struct DegradingProbe {
    healthy_samples: usize,
    seen: Mutex<Vec<u8>>,
}

impl DegradingProbe {
    fn new(healthy_samples: usize) -> Self {
        Self { healthy_samples, seen: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl HealthProbe for DegradingProbe {
    async fn sample(&self, _evolution_id: &str, percentage: u8) -> Result<HealthSample, CollaboratorError> {
        let mut seen = self.seen.lock().unwrap();
        seen.push(percentage);
        let error_rate = if seen.len() > self.healthy_samples { 0.12 } else { 0.01 };
        Ok(HealthSample { error_rate, response_time_ms: 90.0, affected_users: 5, ..Default::default() })
    }
}

struct Rig {
    deployer: Deployer,
    rollback: RollbackManager,
    flags: Arc<InMemoryFlagStore>,
    envs: Arc<SimulatedEnvironments>,
    probe: Arc<DegradingProbe>,
}

fn rig(probe: DegradingProbe, envs: SimulatedEnvironments) -> Rig {
    let flags = Arc::new(InMemoryFlagStore::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let probe = Arc::new(probe);
    let envs = Arc::new(envs);
    let ctx = DeployContext {
        flags: flags.clone(),
        probe: probe.clone(),
        clock: Arc::clone(&clock),
        thresholds: HealthThresholds::default(),
    };
    let deployer = Deployer::new(
        ctx,
        CanaryConfig::default(),
        BlueGreenConfig::default(),
        envs.clone(),
        StrategySelection::default(),
    );
    Rig { deployer, rollback: RollbackManager::new(flags.clone(), clock), flags, envs, probe }
}

fn evolution(category: Category) -> Evolution {
    Evolution::new(
        ImprovementHypothesis {
            id: "hyp-1".into(),
            sequence: 1,
            category,
            description: "cache search results".into(),
            expected_impact: Vec::new(),
            confidence: 0.8,
            risks: Vec::new(),
            dependencies: Vec::new(),
            tools: vec!["search".into()],
            source_pattern: None,
            created_at_ms: 0,
        },
        0,
    )
}

// ---------------------------------------------------------------------------
// Canary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_canary_breach_at_first_stage_restores_baseline() {
    let r = rig(DegradingProbe::new(3), SimulatedEnvironments::default());
    let evo = evolution(Category::Refactor);
    let baseline = FlagUpdate { user_groups: Some(vec!["beta".into()]), ..FlagUpdate::disable() };
    r.flags.update_flag(&evo.id, baseline).await.unwrap();
    r.rollback.capture(&evo).await.unwrap();

    let kind = r.deployer.select(evo.risk_level);
    assert_eq!(kind, StrategyKind::Canary);
    let (mut d, strategy) = r.deployer.plan(&evo.id, kind);

    let err = strategy.execute(&mut d).await.unwrap_err();
    assert!(matches!(err, DeploymentError::Breach { percentage: 10, .. }));
    assert!(r.probe.seen.lock().unwrap().iter().all(|&p| p == 10));

    strategy.rollback(&mut d).await.unwrap();
    assert_eq!(d.phase, DeploymentPhase::RolledBack);
    assert_eq!(r.rollback.rollback(&evo.id).await.unwrap(), RollbackOutcome::Restored);

    let flag = r.flags.get(&evo.id).await.unwrap().unwrap();
    assert!(!flag.enabled);
    assert_eq!(flag.percentage, 0);
    assert_eq!(flag.user_groups, vec!["beta".to_string()]);
    assert!(flag.metadata.is_empty());
    assert!(!r.flags.history(&evo.id).contains(&50));
    assert_eq!(r.rollback.quarantined().len(), 1);
}

#[tokio::test]
async fn test_rollback_is_idempotent() {
    let r = rig(DegradingProbe::new(0), SimulatedEnvironments::default());
    let evo = evolution(Category::Refactor);
    r.rollback.capture(&evo).await.unwrap();
    let (mut d, strategy) = r.deployer.plan(&evo.id, StrategyKind::Canary);
    strategy.execute(&mut d).await.unwrap_err();

    strategy.rollback(&mut d).await.unwrap();
    let writes = r.flags.history(&evo.id).len();
    strategy.rollback(&mut d).await.unwrap();
    assert_eq!(r.flags.history(&evo.id).len(), writes);

    assert_eq!(r.rollback.rollback(&evo.id).await.unwrap(), RollbackOutcome::Restored);
    assert_eq!(r.rollback.rollback(&evo.id).await.unwrap(), RollbackOutcome::AlreadyRolledBack);
    assert_eq!(r.rollback.rollback("evo-never").await.unwrap(), RollbackOutcome::NeverDeployed);
    assert_eq!(r.rollback.quarantined().len(), 1);
}

#[tokio::test]
async fn test_concurrent_rollouts_do_not_share_flags() {
    let r = rig(DegradingProbe::new(usize::MAX), SimulatedEnvironments::default());
    let a = evolution(Category::Refactor);
    let b = evolution(Category::Refactor);
    let (mut da, sa) = r.deployer.plan(&a.id, StrategyKind::Canary);
    let (mut db, sb) = r.deployer.plan(&b.id, StrategyKind::Direct);

    let (ra, rb) = tokio::join!(sa.execute(&mut da), sb.execute(&mut db));
    ra.unwrap();
    rb.unwrap();
    assert_eq!(r.flags.history(&a.id), vec![10, 50, 100]);
    assert_eq!(r.flags.history(&b.id), vec![100]);
}

// ---------------------------------------------------------------------------
// Blue-green
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_blue_green_switch_promotes_green() {
    let r = rig(DegradingProbe::new(usize::MAX), SimulatedEnvironments::default());
    let evo = evolution(Category::Feature);
    let (mut d, strategy) = r.deployer.plan(&evo.id, StrategyKind::BlueGreen);
    strategy.execute(&mut d).await.unwrap();

    assert_eq!(d.phase, DeploymentPhase::Completed);
    assert_eq!(d.environments.blue.as_deref(), Some("env-0"));
    assert_eq!(d.environments.green.as_deref(), Some("env-1"));
    assert!(d.environments.old_decommissioned);
    assert_eq!(r.envs.live(), "env-1");
    let flag = r.flags.get(&evo.id).await.unwrap().unwrap();
    assert_eq!(flag.percentage, 100);
    assert_eq!(flag.metadata.get("environment").map(String::as_str), Some("env-1"));
}

#[tokio::test]
async fn test_blue_green_smoke_failure_moves_no_traffic() {
    let r = rig(DegradingProbe::new(usize::MAX), SimulatedEnvironments::new(false));
    let evo = evolution(Category::Feature);
    let (mut d, strategy) = r.deployer.plan(&evo.id, StrategyKind::BlueGreen);

    let err = strategy.execute(&mut d).await.unwrap_err();
    assert!(err.is_pre_traffic());
    assert!(matches!(err, DeploymentError::SmokeTestFailed { ref failed, .. } if failed.len() == 3));
    assert_eq!(d.phase, DeploymentPhase::Aborted);
    assert!(r.flags.history(&evo.id).is_empty());
    assert_eq!(r.envs.live(), "env-0");
    assert!(r.probe.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_execute_twice_is_rejected() {
    let r = rig(DegradingProbe::new(usize::MAX), SimulatedEnvironments::default());
    let evo = evolution(Category::BugFix);
    let (mut d, strategy) = r.deployer.plan(&evo.id, StrategyKind::Direct);
    strategy.execute(&mut d).await.unwrap();
    let err = strategy.execute(&mut d).await.unwrap_err();
    assert!(matches!(err, DeploymentError::InvalidPhase { .. }));
    assert_eq!(r.flags.history(&evo.id), vec![100]);
}
