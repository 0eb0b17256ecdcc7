//! # Module: simulation
//!
//! In-process stand-ins for every external collaborator, so the whole
//! pipeline can run end to end without a model, a production fleet or a
//! human approver.  Used by `evolvectl simulate` and by the integration
//! tests.
//!
//! Health samples are drawn from a seeded [`StdRng`], so two runs with the
//! same seed see the same traffic.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::collaborators::{ApprovalGate, CodeGenerator, EvolutionRequest};
use crate::deploy::{EnvironmentManager, HealthProbe, HealthSample, SmokeCheck, SmokeCheckKind};
use crate::error::{CollaboratorError, SandboxError};
use crate::model::{CodeChange, Evolution, EvolutionMetrics, TestResults};
use crate::sandbox::{Candidate, MemoryUsage, SandboxLimits, SandboxOutcome, SandboxRunner, TrialReport, TrialResult};

/// Baseline used when a hypothesis carries no measurable current value.
const DEFAULT_BASELINE: f64 = 100.0;

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

/// Answers every request with a candidate that improves the targeted metric
/// by a fixed percentage.
pub struct SimulatedCodeGenerator {
    clock: Arc<dyn Clock>,
    improvement_pct: f64,
    delay: Duration,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl SimulatedCodeGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, improvement_pct: 20.0, delay: Duration::ZERO, failure: None, calls: AtomicUsize::new(0) }
    }

    pub fn with_improvement(mut self, pct: f64) -> Self {
        self.improvement_pct = pct;
        self
    }

    /// Real-time delay before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenerator for SimulatedCodeGenerator {
    async fn request_evolution(&self, request: EvolutionRequest) -> Result<Evolution, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(msg) = &self.failure {
            return Err(CollaboratorError::CodeGen(msg.clone()));
        }

        let (metric, before) = request
            .metrics
            .iter()
            .find(|(_, v)| **v > 0.0)
            .map(|(k, v)| (k.clone(), *v))
            .unwrap_or_else(|| ("latency_ms".to_string(), DEFAULT_BASELINE));
        let after = before * (1.0 - self.improvement_pct / 100.0);

        let mut targets = request.target_files.clone();
        if targets.is_empty() {
            targets.push("lib".into());
        }
        let mut evolution = Evolution::new(request.hypothesis, self.clock.now_ms());
        evolution.changes = targets
            .iter()
            .map(|t| {
                let file = format!("src/{}.rs", t.replace('/', "_"));
                CodeChange {
                    before: format!("// {t}: original\n"),
                    after: format!("// {t}: {}\n", request.context),
                    diff: format!("-// {t}: original\n+// {t}: {}\n", request.context),
                    rationale: request.context.clone(),
                    file,
                }
            })
            .collect();
        evolution.test_results = TestResults::from_counts(12, 0);
        evolution.metrics = EvolutionMetrics::lower_is_better(metric, before, after);
        Ok(evolution)
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Always gives the same answer, optionally after a real-time delay.
#[derive(Debug)]
pub struct StaticApproval {
    approve: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticApproval {
    pub fn approving() -> Self {
        Self { approve: true, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    pub fn denying() -> Self {
        Self { approve: false, ..Self::approving() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalGate for StaticApproval {
    async fn request_approval(&self, _evolution: &Evolution) -> Result<bool, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.approve)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Noisy production traffic around a fixed baseline.
pub struct SimulatedHealthProbe {
    rng: Mutex<StdRng>,
    error_rate: f64,
    response_time_ms: f64,
    /// Relative noise, e.g. `0.2` for ±20 %.
    jitter: f64,
}

impl SimulatedHealthProbe {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)), error_rate: 0.01, response_time_ms: 120.0, jitter: 0.2 }
    }

    pub fn with_baseline(mut self, error_rate: f64, response_time_ms: f64) -> Self {
        self.error_rate = error_rate;
        self.response_time_ms = response_time_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.abs();
        self
    }
}

#[async_trait]
impl HealthProbe for SimulatedHealthProbe {
    async fn sample(&self, _evolution_id: &str, percentage: u8) -> Result<HealthSample, CollaboratorError> {
        let mut rng = self.rng.lock().map_err(|_| CollaboratorError::Health("probe rng poisoned".into()))?;
        let mut noise = || if self.jitter > 0.0 { 1.0 + rng.gen_range(-self.jitter..self.jitter) } else { 1.0 };
        Ok(HealthSample {
            error_rate: (self.error_rate * noise()).clamp(0.0, 1.0),
            response_time_ms: (self.response_time_ms * noise()).max(0.0),
            cpu_usage: (0.4 * noise()).clamp(0.0, 1.0),
            mem_usage: (0.5 * noise()).clamp(0.0, 1.0),
            user_feedback: None,
            affected_users: u64::from(percentage) * 10,
        })
    }
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// Named environments that come and go instantly.  The most recently
/// provisioned environment becomes live once the previous live one is
/// decommissioned.
pub struct SimulatedEnvironments {
    smoke_pass: bool,
    live: Mutex<String>,
    provisioned: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl Default for SimulatedEnvironments {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SimulatedEnvironments {
    pub fn new(smoke_pass: bool) -> Self {
        Self {
            smoke_pass,
            live: Mutex::new("env-0".into()),
            provisioned: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn live(&self) -> String {
        self.live.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

fn poisoned() -> CollaboratorError {
    CollaboratorError::Environment("environment registry poisoned".into())
}

#[async_trait]
impl EnvironmentManager for SimulatedEnvironments {
    async fn live_environment(&self) -> Result<String, CollaboratorError> {
        Ok(self.live.lock().map_err(|_| poisoned())?.clone())
    }

    async fn provision(&self, _evolution_id: &str) -> Result<String, CollaboratorError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("env-{n}");
        self.provisioned.lock().map_err(|_| poisoned())?.push(name.clone());
        Ok(name)
    }

    async fn smoke_test(&self, environment: &str) -> Result<Vec<SmokeCheck>, CollaboratorError> {
        Ok(SmokeCheckKind::REQUIRED
            .into_iter()
            .map(|kind| SmokeCheck {
                name: format!("{environment}/{kind}"),
                kind,
                passed: self.smoke_pass,
                detail: (!self.smoke_pass).then(|| "simulated failure".to_string()),
            })
            .collect())
    }

    async fn decommission(&self, environment: &str) -> Result<(), CollaboratorError> {
        let mut provisioned = self.provisioned.lock().map_err(|_| poisoned())?;
        provisioned.retain(|e| e != environment);
        let mut live = self.live.lock().map_err(|_| poisoned())?;
        if *live == environment {
            if let Some(next) = provisioned.last() {
                *live = next.clone();
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedTrial {
    Pass,
    Fail(String),
    Timeout,
}

/// Reports a fixed trial result without running anything.
#[derive(Debug)]
pub struct SimulatedSandbox {
    trial: SimulatedTrial,
    report: Option<TrialReport>,
    calls: AtomicUsize,
}

impl SimulatedSandbox {
    pub fn new(trial: SimulatedTrial) -> Self {
        Self { trial, report: None, calls: AtomicUsize::new(0) }
    }

    pub fn passing() -> Self {
        Self::new(SimulatedTrial::Pass)
    }

    pub fn with_report(mut self, report: TrialReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRunner for SimulatedSandbox {
    async fn execute(&self, candidate: &Candidate, limits: SandboxLimits) -> Result<SandboxOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if candidate.files.is_empty() {
            return Err(SandboxError::InvalidCandidate("no files".into()));
        }
        let result = match &self.trial {
            SimulatedTrial::Pass => TrialResult::Success { stdout: String::new(), report: self.report.clone() },
            SimulatedTrial::Fail(message) => {
                TrialResult::Error { message: message.clone(), stack: None, exit_code: Some(101) }
            }
            SimulatedTrial::Timeout => TrialResult::Timeout { limit: limits.timeout },
        };
        Ok(SandboxOutcome { execution_time: Duration::from_millis(5), memory: MemoryUsage::default(), result })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Category, ExpectedImpact, ImprovementHypothesis};

    fn hypothesis() -> ImprovementHypothesis {
        ImprovementHypothesis {
            id: "h".into(),
            sequence: 0,
            category: Category::Performance,
            description: "cache".into(),
            expected_impact: vec![ExpectedImpact {
                metric: "avg_exec_time_ms".into(),
                current: 2000.0,
                target: 1400.0,
                change_pct: 30.0,
            }],
            confidence: 0.9,
            risks: Vec::new(),
            dependencies: Vec::new(),
            tools: vec!["search".into()],
            source_pattern: None,
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_generator_improves_targeted_metric() {
        let gen = SimulatedCodeGenerator::new(Arc::new(ManualClock::new(42))).with_improvement(25.0);
        let evo = gen.request_evolution(EvolutionRequest::from_hypothesis(&hypothesis())).await.unwrap();
        assert_eq!(evo.created_at_ms, 42);
        assert_eq!(evo.metrics.metric, "avg_exec_time_ms");
        assert!((evo.metrics.improvement_pct - 25.0).abs() < 1e-9);
        assert_eq!(evo.changes[0].file, "src/tools_search.rs");
        assert!(evo.test_results.passed);
        assert!(evo.validate().is_ok());
    }

    #[tokio::test]
    async fn test_probe_is_deterministic_per_seed() {
        let a = SimulatedHealthProbe::new(7);
        let b = SimulatedHealthProbe::new(7);
        for _ in 0..5 {
            let x = a.sample("e", 50).await.unwrap();
            let y = b.sample("e", 50).await.unwrap();
            assert_eq!(x.error_rate, y.error_rate);
            assert!(x.error_rate < 0.05);
            assert_eq!(x.affected_users, 500);
        }
    }

    #[tokio::test]
    async fn test_environments_switch_live_on_decommission() {
        let envs = SimulatedEnvironments::default();
        let green = envs.provision("e").await.unwrap();
        assert_eq!(envs.live(), "env-0");
        envs.decommission("env-0").await.unwrap();
        assert_eq!(envs.live(), green);
    }

    #[tokio::test]
    async fn test_sandbox_timeout_reports_limit() {
        let sb = SimulatedSandbox::new(SimulatedTrial::Timeout);
        let candidate = Candidate {
            evolution_id: "e".into(),
            files: vec![crate::sandbox::CandidateFile { path: "a.rs".into(), contents: String::new() }],
            command: vec!["true".into()],
            env: Vec::new(),
        };
        let limits = SandboxLimits { timeout: Duration::from_secs(3), memory_bytes: 1 };
        let out = sb.execute(&candidate, limits).await.unwrap();
        assert_eq!(out.result, TrialResult::Timeout { limit: Duration::from_secs(3) });
        assert!(!out.success());
    }
}
