//! # Stage: Validation Gate
//!
//! ## Responsibility
//! Decide whether a sandboxed evolution is eligible for deployment.  Every
//! configured check runs so the report is complete; the first failing check
//! in the order below supplies the rejection reason.
//!
//! Check order:
//! 1. Improvement: measured gain must reach `min_improvement_pct`
//! 2. Tests: the candidate's suite must fully pass
//! 3. API compatibility
//! 4. Backward compatibility
//! 5. Security
//! 6. Performance regression: no measured path may get slower
//!
//! ## Guarantees
//! - Non-panicking and pure: the gate reads the evolution and nothing else.
//! - Auditable: every run produces a `ValidationReport` with per-check results.
//! - Configurable: each check can be individually enabled / disabled.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::Evolution;

// ---------------------------------------------------------------------------
// Check result types
// ---------------------------------------------------------------------------

/// The outcome of a single validation check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
}

impl CheckStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, CheckStatus::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CheckStatus::Skipped { .. })
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Passed => write!(f, "PASS"),
            CheckStatus::Failed { reason } => write!(f, "FAIL: {}", reason),
            CheckStatus::Skipped { reason } => write!(f, "SKIP: {}", reason),
        }
    }
}

/// Result of one named check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
}

impl CheckResult {
    fn passed(name: &'static str) -> Self {
        Self { name, status: CheckStatus::Passed }
    }

    fn failed(name: &'static str, reason: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Failed { reason: reason.into() } }
    }

    fn skipped(name: &'static str) -> Self {
        Self { name, status: CheckStatus::Skipped { reason: "disabled in config".into() } }
    }

    fn check(name: &'static str, ok: bool, reason: impl FnOnce() -> String) -> Self {
        if ok {
            Self::passed(name)
        } else {
            Self::failed(name, reason())
        }
    }
}

// ---------------------------------------------------------------------------
// GateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum measured improvement, in percent.
    pub min_improvement_pct: f64,
    pub check_improvement: bool,
    pub check_tests: bool,
    pub check_api_compat: bool,
    pub check_backward_compat: bool,
    pub check_security: bool,
    pub check_perf_regression: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_improvement_pct: 5.0,
            check_improvement: true,
            check_tests: true,
            check_api_compat: true,
            check_backward_compat: true,
            check_security: true,
            check_perf_regression: true,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_improvement_pct.is_finite() || self.min_improvement_pct < 0.0 {
            return Err(ConfigError::invalid("gate.min_improvement_pct", "must be a finite, non-negative percentage"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// The complete output of one gate run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub evolution_id: String,
    pub checks: Vec<CheckResult>,
    /// True iff no check failed.
    pub overall_passed: bool,
}

impl ValidationReport {
    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.status.is_failed()).collect()
    }

    pub fn passed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.status.is_passed()).collect()
    }

    pub fn skipped_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.status.is_skipped()).collect()
    }

    /// Compact text summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "Gate[{}]: {} ({} passed, {} failed, {} skipped)",
            self.evolution_id,
            if self.overall_passed { "PASS" } else { "FAIL" },
            self.passed_checks().len(),
            self.failed_checks().len(),
            self.skipped_checks().len(),
        )
    }
}

/// Gate decision plus the full report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub valid: bool,
    /// Reason of the first failing check, in check order.
    pub reason: Option<String>,
    pub report: ValidationReport,
}

// ---------------------------------------------------------------------------
// ValidationGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ValidationGate {
    config: GateConfig,
}

impl ValidationGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn validate(&self, evolution: &Evolution) -> GateOutcome {
        let cfg = &self.config;
        let tests = &evolution.test_results;
        let v = &evolution.validation_results;
        let improvement = evolution.metrics.improvement_pct;

        let mut checks = Vec::with_capacity(6);

        checks.push(if cfg.check_improvement {
            CheckResult::check("improvement", improvement >= cfg.min_improvement_pct, || {
                format!("insufficient improvement: {:.1}% < {:.1}%", improvement, cfg.min_improvement_pct)
            })
        } else {
            CheckResult::skipped("improvement")
        });

        checks.push(if cfg.check_tests {
            CheckResult::check("tests", tests.passed && tests.failed_count == 0, || {
                format!("tests failed: {}/{} passed", tests.passed_count, tests.total)
            })
        } else {
            CheckResult::skipped("tests")
        });

        checks.push(if cfg.check_api_compat {
            CheckResult::check("api_compat", v.api_compat, || "API compatibility check failed".into())
        } else {
            CheckResult::skipped("api_compat")
        });

        checks.push(if cfg.check_backward_compat {
            CheckResult::check("backward_compat", v.backward_compat, || {
                "backward compatibility check failed".into()
            })
        } else {
            CheckResult::skipped("backward_compat")
        });

        checks.push(if cfg.check_security {
            CheckResult::check("security", v.security_ok, || "security check failed".into())
        } else {
            CheckResult::skipped("security")
        });

        checks.push(if cfg.check_perf_regression {
            CheckResult::check("perf_regression", !v.perf_regression, || "performance regression detected".into())
        } else {
            CheckResult::skipped("perf_regression")
        });

        let reason = checks.iter().find_map(|c| match &c.status {
            CheckStatus::Failed { reason } => Some(reason.clone()),
            _ => None,
        });
        let overall_passed = reason.is_none();
        let report = ValidationReport { evolution_id: evolution.id.clone(), checks, overall_passed };

        tracing::debug!(target: "evolution::gate", summary = %report.summary(), "gate evaluated");

        GateOutcome { valid: overall_passed, reason, report }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, EvolutionMetrics, ImprovementHypothesis, TestResults};
    use proptest::prelude::*;

    fn evolution(improvement: f64, tests_pass: bool) -> Evolution {
        let h = ImprovementHypothesis {
            id: "h".into(),
            sequence: 0,
            category: Category::Performance,
            description: "d".into(),
            expected_impact: vec![],
            confidence: 0.9,
            risks: vec![],
            dependencies: vec![],
            tools: vec![],
            source_pattern: None,
            created_at_ms: 0,
        };
        let mut e = Evolution::new(h, 0);
        e.metrics = EvolutionMetrics { metric: "latency".into(), before: 100.0, after: 100.0 - improvement, improvement_pct: improvement };
        e.test_results = if tests_pass { TestResults::from_counts(10, 0) } else { TestResults::from_counts(7, 3) };
        e
    }

    #[test]
    fn test_good_evolution_passes_all_checks() {
        let out = ValidationGate::default().validate(&evolution(12.0, true));
        assert!(out.valid);
        assert!(out.reason.is_none());
        assert_eq!(out.report.passed_checks().len(), 6);
    }

    #[test]
    fn test_insufficient_improvement_rejected_even_with_passing_tests() {
        let out = ValidationGate::default().validate(&evolution(3.0, true));
        assert!(!out.valid);
        assert_eq!(out.reason.as_deref(), Some("insufficient improvement: 3.0% < 5.0%"));
    }

    #[test]
    fn test_improvement_reason_wins_over_failed_tests() {
        let out = ValidationGate::default().validate(&evolution(3.0, false));
        assert!(out.reason.unwrap().contains("insufficient improvement"));
        assert_eq!(out.report.failed_checks().len(), 2, "all checks still run");
    }

    #[test]
    fn test_failing_tests_rejected() {
        let out = ValidationGate::default().validate(&evolution(20.0, false));
        assert_eq!(out.reason.as_deref(), Some("tests failed: 7/10 passed"));
    }

    #[test]
    fn test_security_and_compat_failures() {
        let mut e = evolution(20.0, true);
        e.validation_results.backward_compat = false;
        e.validation_results.security_ok = false;
        let out = ValidationGate::default().validate(&e);
        assert_eq!(out.reason.as_deref(), Some("backward compatibility check failed"));
        let names: Vec<_> = out.report.failed_checks().iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["backward_compat", "security"]);
    }

    #[test]
    fn test_perf_regression_rejected() {
        let mut e = evolution(20.0, true);
        e.validation_results.perf_regression = true;
        assert!(!ValidationGate::default().validate(&e).valid);
    }

    #[test]
    fn test_disabled_check_is_skipped() {
        let gate = ValidationGate::new(GateConfig { check_tests: false, ..GateConfig::default() });
        let out = gate.validate(&evolution(20.0, false));
        assert!(out.valid);
        assert_eq!(out.report.skipped_checks()[0].name, "tests");
        assert!(out.report.summary().contains("1 skipped"));
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let cfg = GateConfig { min_improvement_pct: -1.0, ..GateConfig::default() };
        assert!(cfg.validate().is_err());
    }

    proptest! {
        #[test]
        fn test_prop_below_threshold_always_rejected(improvement in -50.0f64..4.99, tests_pass in any::<bool>()) {
            let out = ValidationGate::default().validate(&evolution(improvement, tests_pass));
            prop_assert!(!out.valid);
            prop_assert!(out.reason.unwrap().starts_with("insufficient improvement"));
        }
    }
}
