//! # Stage: Orchestrator
//!
//! ## Responsibility
//! Close the improvement loop:
//!
//! ```text
//! telemetry ─► PatternAnalyzer ─► Prioritizer ─► admission (cap + dedup)
//!                                                   │  one task per evolution
//!                                                   ▼
//!   CodeGenerator ─► SandboxRunner ─► ValidationGate ─► approval ─► rollout
//!                                                                     │
//!                         RollbackManager ◄── breach / operator ◄─────┘
//!                                   │
//!                 MetricsCollector + EvolutionStore (always)
//! ```
//!
//! ## Guarantees
//! - At most `max_concurrent_evolutions` evolutions are in flight; slots are
//!   reserved under one lock at admission time.
//! - The cycle timer never awaits an evolution; every admitted hypothesis
//!   runs in its own task.
//! - A failing or panicking evolution task marks that evolution `failed`,
//!   bumps `failure_count`, and affects nothing else.  If it died mid-rollout
//!   the flag is restored to its baseline first and the evolution ends
//!   `rolled_back`.
//! - `pause`/`resume`/`stop` only touch scheduling; in-flight evolutions run
//!   to completion.
//! - Config updates apply from the next tick; running evolutions keep the
//!   config they were admitted under.
//!
//! ## NOT Responsible For
//! - Producing candidate code (the [`CodeGenerator`] collaborator)
//! - The approval UI (the [`ApprovalGate`] collaborator)

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::analysis::{PatternAnalyzer, Prioritizer};
use crate::clock::Clock;
use crate::collaborators::{ApprovalGate, CodeGenerator, EvolutionRequest};
use crate::config::{OrchestratorConfig, PipelineConfig};
use crate::deploy::{DeployContext, Deployer, DeploymentStrategy, EnvironmentManager, FeatureFlagStore, HealthProbe};
use crate::error::{OrchestratorError, TaskError};
use crate::gate::ValidationGate;
use crate::metrics::{MetricsCollector, MetricsReport};
use crate::model::{Deployment, Evolution, EvolutionStatus, ImprovementHypothesis};
use crate::rollback::{QuarantinedArtifact, RollbackManager, RollbackOutcome};
use crate::sandbox::{Candidate, SandboxConfig, SandboxRunner, TrialResult};
use crate::store::EvolutionStore;
use crate::telemetry::TelemetrySource;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Every collaborator the orchestrator drives.
#[derive(Clone)]
pub struct PipelineComponents {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub code_generator: Arc<dyn CodeGenerator>,
    pub approval: Arc<dyn ApprovalGate>,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub flags: Arc<dyn FeatureFlagStore>,
    pub health: Arc<dyn HealthProbe>,
    pub environments: Arc<dyn EnvironmentManager>,
    pub store: Arc<dyn EvolutionStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub cycle_count: u64,
    pub failure_count: u64,
    pub active_evolution_count: usize,
}

/// What one call to [`Orchestrator::run_cycle`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// `true` when the orchestrator was paused and nothing ran.
    pub skipped: bool,
    pub patterns: usize,
    pub hypotheses: usize,
    /// Ids of the evolutions started this cycle, highest priority first.
    pub admitted: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopCommand {
    Run,
    Pause,
    Resume,
    Stop,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Slot {
    /// Latest snapshot, refreshed on every status transition.
    evolution: Evolution,
    dedup_key: String,
    rollback: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Slot>,
    keys: HashSet<String>,
}

struct Shared {
    components: PipelineComponents,
    analyzer: PatternAnalyzer,
    prioritizer: Prioritizer,
    gate: ValidationGate,
    deployer: Deployer,
    rollback: RollbackManager,
    sandbox: SandboxConfig,
    config: RwLock<OrchestratorConfig>,
    registry: Mutex<Registry>,
    metrics: MetricsCollector,
    running: AtomicBool,
    paused: AtomicBool,
    cycle_count: AtomicU64,
    failure_count: AtomicU64,
    idle: Notify,
}

struct LoopControl {
    tx: watch::Sender<LoopCommand>,
    handle: JoinHandle<()>,
}

/// The top-level control loop.  Construct with [`Orchestrator::new`], then
/// `start` / `stop` as needed; dropping it stops the loop.
pub struct Orchestrator {
    shared: Arc<Shared>,
    control: Mutex<Option<LoopControl>>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, components: PipelineComponents) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let ctx = DeployContext {
            flags: Arc::clone(&components.flags),
            probe: Arc::clone(&components.health),
            clock: Arc::clone(&components.clock),
            thresholds: config.health.clone(),
        };
        let deployer = Deployer::new(
            ctx,
            config.canary.clone(),
            config.blue_green.clone(),
            Arc::clone(&components.environments),
            config.strategy.clone(),
        );
        let shared = Shared {
            analyzer: PatternAnalyzer::new(config.analyzer.clone(), Arc::clone(&components.telemetry)),
            prioritizer: Prioritizer::new(config.prioritizer.clone()),
            gate: ValidationGate::new(config.gate.clone()),
            deployer,
            rollback: RollbackManager::new(Arc::clone(&components.flags), Arc::clone(&components.clock)),
            sandbox: config.sandbox.clone(),
            config: RwLock::new(config.orchestrator.clone()),
            registry: Mutex::new(Registry::default()),
            metrics: MetricsCollector::default(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            idle: Notify::new(),
            components,
        };
        Ok(Self { shared: Arc::new(shared), control: Mutex::new(None) })
    }

    /// Spawn the periodic cycle.  The first cycle runs immediately.
    pub fn start(&self, config: OrchestratorConfig) -> Result<(), OrchestratorError> {
        config.validate()?;
        let mut control = self.control.lock().map_err(|_| OrchestratorError::AlreadyRunning)?;
        if control.is_some() || self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let period = config.cycle_interval();
        self.shared.set_config(config);
        self.shared.paused.store(false, Ordering::SeqCst);

        let (tx, rx) = watch::channel(LoopCommand::Run);
        let handle = tokio::spawn(cycle_loop(Arc::clone(&self.shared), rx));
        *control = Some(LoopControl { tx, handle });
        tracing::info!(
            target: "evolution::orchestrator",
            cycle_interval_ms = period.as_millis() as u64,
            "orchestrator started"
        );
        Ok(())
    }

    /// Cancel the timer and wait for the loop task to exit.  In-flight
    /// evolutions keep running.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let control = self
            .control
            .lock()
            .map_err(|_| OrchestratorError::NotRunning)?
            .take()
            .ok_or(OrchestratorError::NotRunning)?;
        let _ = control.tx.send(LoopCommand::Stop);
        if let Err(e) = control.handle.await {
            tracing::error!(target: "evolution::orchestrator", error = %e, "cycle loop ended abnormally");
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        tracing::info!(target: "evolution::orchestrator", "orchestrator stopped");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), OrchestratorError> {
        self.command(LoopCommand::Pause)?;
        self.shared.paused.store(true, Ordering::SeqCst);
        tracing::info!(target: "evolution::orchestrator", "scheduling paused");
        Ok(())
    }

    /// Resume scheduling; the next cycle is one full interval away.
    pub fn resume(&self) -> Result<(), OrchestratorError> {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.command(LoopCommand::Resume)?;
        tracing::info!(target: "evolution::orchestrator", "scheduling resumed");
        Ok(())
    }

    fn command(&self, cmd: LoopCommand) -> Result<(), OrchestratorError> {
        let control = self.control.lock().map_err(|_| OrchestratorError::NotRunning)?;
        let control = control.as_ref().ok_or(OrchestratorError::NotRunning)?;
        control.tx.send(cmd).map_err(|_| OrchestratorError::NotRunning)
    }

    /// Replace the orchestrator config.  Takes effect on the next tick.
    pub fn update_config(&self, config: OrchestratorConfig) -> Result<(), OrchestratorError> {
        config.validate()?;
        self.shared.set_config(config);
        Ok(())
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.shared.config_snapshot()
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let s = &self.shared;
        OrchestratorStatus {
            is_running: s.running.load(Ordering::SeqCst),
            is_paused: s.paused.load(Ordering::SeqCst),
            cycle_count: s.cycle_count.load(Ordering::SeqCst),
            failure_count: s.failure_count.load(Ordering::SeqCst),
            active_evolution_count: s.active_count(),
        }
    }

    /// Snapshot of in-flight evolutions, oldest first.
    pub fn get_active_evolutions(&self) -> Vec<Evolution> {
        let mut active: Vec<Evolution> = self
            .shared
            .registry
            .lock()
            .map(|r| r.active.values().map(|s| s.evolution.clone()).collect())
            .unwrap_or_default();
        active.sort_by_key(|e| (e.created_at_ms, e.hypothesis.sequence));
        active
    }

    pub fn get_metrics_report(&self) -> MetricsReport {
        self.shared.metrics.report()
    }

    pub fn quarantined(&self) -> Vec<QuarantinedArtifact> {
        self.shared.rollback.quarantined()
    }

    /// Run one cycle now.  Does nothing while paused.
    pub fn run_cycle(&self) -> CycleReport {
        self.shared.run_cycle()
    }

    /// Rank and admit externally supplied hypotheses, as a cycle would.
    /// Returns the ids of the evolutions started.
    /// Submitted batches are not counted as cycles.
    pub fn submit(&self, hypotheses: Vec<ImprovementHypothesis>) -> Vec<String> {
        let now = self.shared.components.clock.now_ms();
        self.shared.admit_and_spawn(None, now, hypotheses)
    }

    /// Ask an in-flight evolution to roll back.  A deploying evolution is
    /// rolled back immediately; one that has not deployed yet fails at its
    /// next step.
    pub fn rollback_evolution(&self, evolution_id: &str) -> Result<(), OrchestratorError> {
        let registry = self.shared.registry.lock().map_err(|_| OrchestratorError::UnknownEvolution(evolution_id.into()))?;
        let slot = registry
            .active
            .get(evolution_id)
            .ok_or_else(|| OrchestratorError::UnknownEvolution(evolution_id.to_string()))?;
        let _ = slot.rollback.send(true);
        tracing::info!(target: "evolution::orchestrator", evolution_id = %evolution_id, "operator rollback requested");
        Ok(())
    }

    /// Resolves once no evolution is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Ok(mut control) = self.control.lock() {
            if let Some(control) = control.take() {
                let _ = control.tx.send(LoopCommand::Stop);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle loop
// ---------------------------------------------------------------------------

fn ticker(period: Duration, immediate: bool) -> Interval {
    let start = if immediate { Instant::now() } else { Instant::now() + period };
    let mut t = tokio::time::interval_at(start, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

async fn cycle_loop(shared: Arc<Shared>, mut rx: watch::Receiver<LoopCommand>) {
    let mut period = shared.config_snapshot().cycle_interval();
    let mut timer = ticker(period, true);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                if shared.paused.load(Ordering::SeqCst) {
                    continue;
                }
                let next = shared.config_snapshot().cycle_interval();
                if next != period {
                    period = next;
                    timer = ticker(period, false);
                }
                shared.run_cycle();
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let cmd = *rx.borrow();
                match cmd {
                    LoopCommand::Stop => break,
                    LoopCommand::Resume => timer = ticker(period, false),
                    LoopCommand::Pause | LoopCommand::Run => {}
                }
            }
        }
    }
    tracing::debug!(target: "evolution::orchestrator", "cycle loop exited");
}

impl Shared {
    fn config_snapshot(&self) -> OrchestratorConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn set_config(&self, config: OrchestratorConfig) {
        match self.config.write() {
            Ok(mut c) => *c = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    fn active_count(&self) -> usize {
        self.registry.lock().map(|r| r.active.len()).unwrap_or(0)
    }

    fn run_cycle(self: &Arc<Self>) -> CycleReport {
        if self.paused.load(Ordering::SeqCst) {
            return CycleReport { skipped: true, ..CycleReport::default() };
        }
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.components.clock.now_ms();
        let patterns = self.analyzer.detect_patterns(now);
        let hypotheses = self.analyzer.generate_hypotheses(&patterns, now);
        let count = hypotheses.len();
        let admitted = self.admit_and_spawn(Some(cycle), now, hypotheses);
        tracing::info!(
            target: "evolution::orchestrator",
            cycle,
            patterns = patterns.len(),
            hypotheses = count,
            admitted = admitted.len(),
            "cycle complete"
        );
        CycleReport { cycle, skipped: false, patterns: patterns.len(), hypotheses: count, admitted }
    }

    fn admit_and_spawn(
        self: &Arc<Self>,
        cycle: Option<u64>,
        now: u64,
        hypotheses: Vec<ImprovementHypothesis>,
    ) -> Vec<String> {
        let total = hypotheses.len();
        let ranked = self.prioritizer.rank(hypotheses, &self.metrics.category_success_rates());
        let config = self.config_snapshot();

        let mut started = Vec::new();
        {
            let Ok(mut registry) = self.registry.lock() else {
                tracing::error!(target: "evolution::orchestrator", "registry lock poisoned; admitting nothing");
                return Vec::new();
            };
            for r in ranked {
                if registry.active.len() >= config.max_concurrent_evolutions {
                    break;
                }
                let hypothesis = r.hypothesis;
                if let Err(e) = hypothesis.validate() {
                    tracing::warn!(target: "evolution::orchestrator", error = %e, "rejecting invalid hypothesis");
                    continue;
                }
                let key = hypothesis.dedup_key();
                if registry.keys.contains(&key) {
                    tracing::debug!(target: "evolution::orchestrator", key = %key, "duplicate of in-flight hypothesis");
                    continue;
                }
                let evolution = Evolution::new(hypothesis, now);
                let (tx, rx) = watch::channel(false);
                registry.keys.insert(key.clone());
                registry.active.insert(
                    evolution.id.clone(),
                    Slot { evolution: evolution.clone(), dedup_key: key, rollback: tx },
                );
                started.push((evolution, rx));
            }
        }

        if let Some(cycle) = cycle {
            self.metrics.record_cycle(cycle, now, total, started.len());
        }
        let mut ids = Vec::with_capacity(started.len());
        for (evolution, rx) in started {
            self.metrics.record_attempt(cycle, evolution.hypothesis.category);
            ids.push(evolution.id.clone());
            tracing::info!(
                target: "evolution::orchestrator",
                evolution_id = %evolution.id,
                category = %evolution.hypothesis.category,
                risk = evolution.risk_level,
                "evolution admitted"
            );
            tokio::spawn(supervise(Arc::clone(self), cycle, config.clone(), evolution, rx));
        }
        ids
    }

    /// Refresh the registry snapshot and persist.
    fn publish(&self, evolution: &Evolution) {
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(slot) = registry.active.get_mut(&evolution.id) {
                slot.evolution = evolution.clone();
            }
        }
        self.persist(evolution);
    }

    fn persist(&self, evolution: &Evolution) {
        if let Err(e) = self.components.store.put_evolution(evolution) {
            tracing::warn!(target: "evolution::orchestrator", evolution_id = %evolution.id, error = %e, "failed to persist evolution");
        }
    }

    fn persist_deployment(&self, deployment: &Deployment) {
        if let Err(e) = self.components.store.put_deployment(deployment) {
            tracing::warn!(target: "evolution::orchestrator", deployment_id = %deployment.id, error = %e, "failed to persist deployment");
        }
    }

    fn latest(&self, evolution_id: &str) -> Option<Evolution> {
        self.registry.lock().ok()?.active.get(evolution_id).map(|s| s.evolution.clone())
    }

    fn finish(&self, cycle: Option<u64>, evolution: Evolution) {
        self.rollback.release(&evolution.id);
        let now_idle = match self.registry.lock() {
            Ok(mut registry) => {
                if let Some(slot) = registry.active.remove(&evolution.id) {
                    registry.keys.remove(&slot.dedup_key);
                }
                registry.active.is_empty()
            }
            Err(_) => false,
        };
        self.metrics.record_outcome(cycle, &evolution);
        self.persist(&evolution);
        tracing::info!(
            target: "evolution::orchestrator",
            evolution_id = %evolution.id,
            status = %evolution.status,
            reason = evolution.failure_reason.as_deref().unwrap_or(""),
            duration_ms = evolution.duration_ms.unwrap_or_default(),
            "evolution finished"
        );
        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Evolution task
// ---------------------------------------------------------------------------

/// Runs one evolution in its own task and turns a panic into a failure.
async fn supervise(
    shared: Arc<Shared>,
    cycle: Option<u64>,
    config: OrchestratorConfig,
    evolution: Evolution,
    rx: watch::Receiver<bool>,
) {
    let id = evolution.id.clone();
    let fallback = evolution.clone();
    let task = tokio::spawn(drive(Arc::clone(&shared), config, evolution, rx));
    let evolution = match task.await {
        Ok(evolution) => evolution,
        Err(e) => {
            let reason = if e.is_panic() {
                let payload = e.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                TaskError::Panicked(msg).to_string()
            } else {
                "evolution task cancelled".to_string()
            };
            shared.failure_count.fetch_add(1, Ordering::SeqCst);
            tracing::error!(target: "evolution::orchestrator", evolution_id = %id, reason = %reason, "evolution task aborted");
            let evolution = shared.latest(&id).unwrap_or(fallback);
            contain(&shared, evolution, reason).await
        }
    };
    shared.finish(cycle, evolution);
}

/// Bring an evolution whose task died to a terminal state.  Traffic moved by
/// an interrupted rollout is returned to the recorded baseline first.
async fn contain(shared: &Shared, mut evolution: Evolution, reason: String) -> Evolution {
    if evolution.is_terminal() {
        return evolution;
    }
    if evolution.status == EvolutionStatus::Deploying {
        match shared.rollback.rollback(&evolution.id).await {
            Ok(RollbackOutcome::NeverDeployed) => {}
            Ok(outcome) => {
                tracing::warn!(
                    target: "evolution::orchestrator",
                    evolution_id = %evolution.id,
                    outcome = ?outcome,
                    "interrupted rollout returned to baseline"
                );
                evolution.failure_reason = Some(reason);
                if let Err(e) = evolution.transition(EvolutionStatus::RolledBack, shared.components.clock.now_ms()) {
                    tracing::error!(target: "evolution::orchestrator", error = %e, "could not mark evolution rolled back");
                }
                return evolution;
            }
            Err(e) => {
                tracing::error!(
                    target: "evolution::orchestrator",
                    evolution_id = %evolution.id,
                    error = %e,
                    "baseline restore failed after task abort"
                );
                let reason = format!("{reason}; baseline restore failed: {e}");
                let _ = evolution.fail(reason, shared.components.clock.now_ms());
                return evolution;
            }
        }
    }
    if let Err(e) = evolution.fail(reason, shared.components.clock.now_ms()) {
        tracing::error!(target: "evolution::orchestrator", error = %e, "could not mark evolution failed");
    }
    evolution
}

async fn drive(
    shared: Arc<Shared>,
    config: OrchestratorConfig,
    mut evolution: Evolution,
    mut rx: watch::Receiver<bool>,
) -> Evolution {
    if let Err(e) = run_evolution(&shared, &config, &mut evolution, &mut rx).await {
        shared.failure_count.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            target: "evolution::orchestrator",
            evolution_id = %evolution.id,
            status = %evolution.status,
            error = %e,
            "evolution task failed"
        );
        return contain(&shared, evolution, e.to_string()).await;
    }
    evolution
}

/// Resolves once an operator rollback has been requested.
async fn rollback_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn reject(shared: &Shared, evolution: &mut Evolution, reason: impl Into<String>) -> Result<(), TaskError> {
    let reason = reason.into();
    tracing::info!(target: "evolution::orchestrator", evolution_id = %evolution.id, reason = %reason, "evolution rejected");
    evolution.fail(reason, shared.components.clock.now_ms())?;
    Ok(())
}

async fn run_evolution(
    shared: &Shared,
    config: &OrchestratorConfig,
    evolution: &mut Evolution,
    rx: &mut watch::Receiver<bool>,
) -> Result<(), TaskError> {
    let clock = Arc::clone(&shared.components.clock);
    shared.persist(evolution);

    // 1. Candidate
    let timeout = config.codegen_timeout();
    let request = EvolutionRequest::from_hypothesis(&evolution.hypothesis);
    let candidate = tokio::time::timeout(timeout, shared.components.code_generator.request_evolution(request))
        .await
        .map_err(|_| TaskError::CodeGenTimeout(timeout))??;
    if candidate.hypothesis.id != evolution.hypothesis.id {
        return Err(TaskError::HypothesisMismatch {
            expected: evolution.hypothesis.id.clone(),
            got: candidate.hypothesis.id,
        });
    }
    evolution.changes = candidate.changes;
    evolution.test_results = candidate.test_results;
    evolution.validation_results = candidate.validation_results;
    evolution.metrics = candidate.metrics;
    evolution.validate()?;

    // 2. Sandbox trial
    let trial = Candidate::from_evolution(evolution, shared.sandbox.command.clone());
    let outcome = shared.components.sandbox.execute(&trial, shared.sandbox.limits()).await?;
    match outcome.result {
        TrialResult::Success { report, .. } => {
            if let Some(report) = report {
                if let Some(t) = report.test_results {
                    evolution.test_results = t;
                }
                if let Some(v) = report.validation_results {
                    evolution.validation_results = v;
                }
                if let Some(m) = report.metrics {
                    evolution.metrics = m;
                }
            }
        }
        TrialResult::Error { message, exit_code, .. } => {
            let code = exit_code.map(|c| format!(" (exit {c})")).unwrap_or_default();
            return reject(shared, evolution, format!("sandbox error: {message}{code}"));
        }
        TrialResult::Timeout { limit } => {
            return reject(shared, evolution, format!("sandbox timed out after {limit:?}"));
        }
    }
    evolution.transition(EvolutionStatus::Sandboxed, clock.now_ms())?;
    shared.publish(evolution);

    // 3. Gate
    let verdict = shared.gate.validate(evolution);
    shared.metrics.record_validation(verdict.valid);
    if !verdict.valid {
        let reason = verdict.reason.unwrap_or_else(|| "validation failed".into());
        return reject(shared, evolution, reason);
    }
    evolution.transition(EvolutionStatus::Validated, clock.now_ms())?;
    shared.publish(evolution);

    // 4. Approval
    let category = evolution.hypothesis.category;
    if config.auto_approve.permits(evolution.risk_level, category) {
        tracing::info!(
            target: "evolution::orchestrator",
            evolution_id = %evolution.id,
            risk = evolution.risk_level,
            category = %category,
            "auto-approved"
        );
    } else {
        let limit = config.approval_timeout();
        let request = shared.components.approval.request_approval(evolution);
        let answer = match limit {
            Some(limit) => tokio::time::timeout(limit, request).await.ok(),
            None => Some(request.await),
        };
        let approved = match answer {
            Some(answer) => answer?,
            None => {
                let limit = limit.unwrap_or_default();
                return reject(shared, evolution, format!("approval timed out after {limit:?}"));
            }
        };
        if !approved {
            return reject(shared, evolution, "approval denied");
        }
    }
    if *rx.borrow() {
        return reject(shared, evolution, "rollback requested before deployment");
    }

    // 5. Rollout
    let kind = shared.deployer.select(evolution.risk_level);
    evolution.strategy = Some(kind);
    evolution.transition(EvolutionStatus::Deploying, clock.now_ms())?;
    shared.publish(evolution);
    shared.rollback.capture(evolution).await?;

    let (mut deployment, strategy) = shared.deployer.plan(&evolution.id, kind);
    shared.persist_deployment(&deployment);

    let executed = tokio::select! {
        r = strategy.execute(&mut deployment) => Some(r),
        _ = rollback_requested(rx) => None,
    };
    let breach = match executed {
        Some(Ok(())) => post_deploy(shared, config, &strategy, &mut deployment, rx).await,
        Some(Err(e)) if e.is_pre_traffic() => {
            shared.persist_deployment(&deployment);
            shared.rollback.quarantine(evolution, e.to_string());
            return reject(shared, evolution, e.to_string());
        }
        Some(Err(e)) => Some(e.to_string()),
        None => Some("operator rollback".to_string()),
    };

    match breach {
        None => {
            evolution.transition(EvolutionStatus::Completed, clock.now_ms())?;
        }
        Some(reason) => {
            tracing::warn!(
                target: "evolution::orchestrator",
                evolution_id = %evolution.id,
                strategy = %kind,
                reason = %reason,
                "rolling back"
            );
            if let Err(e) = strategy.rollback(&mut deployment).await {
                tracing::error!(target: "evolution::orchestrator", evolution_id = %evolution.id, error = %e, "strategy rollback failed; restoring baseline");
            }
            match shared.rollback.rollback(&evolution.id).await {
                Ok(_) => {
                    evolution.failure_reason = Some(reason);
                    evolution.transition(EvolutionStatus::RolledBack, clock.now_ms())?;
                }
                Err(e) => {
                    shared.persist_deployment(&deployment);
                    return Err(e.into());
                }
            }
        }
    }
    if deployment.completed_at_ms.is_none() {
        deployment.finish(clock.now_ms());
    }
    shared.metrics.record_deployment(kind, deployment.metrics.duration_ms);
    shared.persist_deployment(&deployment);
    Ok(())
}

/// Periodic health checks after a successful rollout.  Returns the reason
/// the change must be rolled back, if any.
async fn post_deploy(
    shared: &Shared,
    config: &OrchestratorConfig,
    strategy: &DeploymentStrategy,
    deployment: &mut Deployment,
    rx: &mut watch::Receiver<bool>,
) -> Option<String> {
    let clock = &shared.components.clock;
    for check in 0..config.post_deploy_checks {
        let interrupted = tokio::select! {
            _ = clock.sleep(config.post_deploy_interval()) => false,
            _ = rollback_requested(rx) => true,
        };
        if interrupted {
            return Some("operator rollback".into());
        }
        match strategy.monitor(deployment).await {
            Ok(status) if status.healthy => {}
            Ok(status) => {
                return Some(format!(
                    "post-deploy check {} unhealthy: error rate {:.3}, response time {:.0} ms",
                    check + 1,
                    status.error_rate,
                    status.response_time_ms
                ))
            }
            Err(e) => return Some(format!("post-deploy check {} failed: {e}", check + 1)),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
