//! # Module: config
//!
//! ## Responsibility
//! One TOML document configures the whole pipeline.  Each component owns its
//! section type (defined next to the component); this module stitches them
//! together and owns the orchestrator's own settings.
//!
//! ## Guarantees
//! - Every field has a default, so an empty file is a valid configuration.
//! - `load` and `from_toml_str` always run `validate()` before returning.
//!
//! ```toml
//! [orchestrator]
//! cycle_interval_ms = 60000
//! max_concurrent_evolutions = 3
//!
//! [orchestrator.auto_approve]
//! enabled = true
//! max_risk_level = 0.3
//! allowed_categories = ["bug-fix", "performance"]
//!
//! [canary]
//! stages = [{ percentage = 10, hold_ms = 300000 }, { percentage = 100, hold_ms = 900000 }]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::analyzer::AnalyzerConfig;
use crate::analysis::prioritizer::PrioritizerConfig;
use crate::deploy::blue_green::BlueGreenConfig;
use crate::deploy::canary::CanaryConfig;
use crate::deploy::health::HealthThresholds;
use crate::deploy::StrategySelection;
use crate::error::ConfigError;
use crate::gate::GateConfig;
use crate::model::{is_unit, Category};
use crate::sandbox::SandboxConfig;

// ---------------------------------------------------------------------------
// AutoApproveConfig
// ---------------------------------------------------------------------------

/// When an evolution may deploy without asking the approval collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApproveConfig {
    pub enabled: bool,
    /// Highest risk level that is approved automatically.
    pub max_risk_level: f64,
    pub allowed_categories: Vec<Category>,
}

impl Default for AutoApproveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_risk_level: 0.3,
            allowed_categories: vec![Category::BugFix, Category::Performance],
        }
    }
}

impl AutoApproveConfig {
    /// `true` when an evolution with this risk and category skips manual approval.
    pub fn permits(&self, risk_level: f64, category: Category) -> bool {
        self.enabled && risk_level <= self.max_risk_level && self.allowed_categories.contains(&category)
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

/// Settings for the control loop.  Replaced at runtime through
/// `Orchestrator::update_config`; a new value takes effect on the next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Period of the cycle timer.
    pub cycle_interval_ms: u64,
    /// Upper bound on non-terminal evolutions at any instant.
    pub max_concurrent_evolutions: usize,
    /// Bound on a single code-generation request.
    pub codegen_timeout_ms: u64,
    /// Bound on a manual approval request.  `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout_ms: Option<u64>,
    /// Health samples taken after a deployment reports success.
    pub post_deploy_checks: u32,
    pub post_deploy_interval_ms: u64,
    pub auto_approve: AutoApproveConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 60_000,
            max_concurrent_evolutions: 3,
            codegen_timeout_ms: 600_000,
            approval_timeout_ms: None,
            post_deploy_checks: 3,
            post_deploy_interval_ms: 30_000,
            auto_approve: AutoApproveConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn codegen_timeout(&self) -> Duration {
        Duration::from_millis(self.codegen_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_ms.map(Duration::from_millis)
    }

    pub fn post_deploy_interval(&self) -> Duration {
        Duration::from_millis(self.post_deploy_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_interval_ms == 0 {
            return Err(ConfigError::invalid("orchestrator.cycle_interval_ms", "must be > 0"));
        }
        if self.max_concurrent_evolutions == 0 {
            return Err(ConfigError::invalid("orchestrator.max_concurrent_evolutions", "must be >= 1"));
        }
        if self.codegen_timeout_ms == 0 {
            return Err(ConfigError::invalid("orchestrator.codegen_timeout_ms", "must be > 0"));
        }
        if self.approval_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "orchestrator.approval_timeout_ms",
                "must be > 0 when set (omit it to wait indefinitely)",
            ));
        }
        if !is_unit(self.auto_approve.max_risk_level) {
            return Err(ConfigError::invalid("orchestrator.auto_approve.max_risk_level", "must be in [0, 1]"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// The complete configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub orchestrator: OrchestratorConfig,
    pub analyzer: AnalyzerConfig,
    pub prioritizer: PrioritizerConfig,
    pub gate: GateConfig,
    pub sandbox: SandboxConfig,
    pub health: HealthThresholds,
    pub canary: CanaryConfig,
    pub blue_green: BlueGreenConfig,
    pub strategy: StrategySelection,
}

impl PipelineConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(target: "evolution::config", path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty TOML rendering, used by `evolvectl default-config`.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid("<document>", e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.analyzer.validate()?;
        self.prioritizer.validate()?;
        self.gate.validate()?;
        self.sandbox.validate()?;
        self.health.validate()?;
        self.canary.validate()?;
        self.blue_green.validate()?;
        self.strategy.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let cfg = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
            [orchestrator]
            cycle_interval_ms = 1000

            [orchestrator.auto_approve]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.orchestrator.cycle_interval(), Duration::from_secs(1));
        assert_eq!(cfg.orchestrator.max_concurrent_evolutions, 3);
        assert!(cfg.orchestrator.auto_approve.enabled);
        assert_eq!(cfg.orchestrator.auto_approve.max_risk_level, 0.3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = PipelineConfig::from_toml_str("[orchestrator]\nmax_concurrent_evolutions = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_evolutions"));
    }

    #[test]
    fn test_unknown_category_is_a_parse_error() {
        let err = PipelineConfig::from_toml_str(
            "[orchestrator.auto_approve]\nallowed_categories = [\"rewrite\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_default_renders_and_reparses() {
        let text = PipelineConfig::default().to_toml_string().unwrap();
        let back = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, PipelineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gate]\nmin_improvement_pct = 10.0").unwrap();
        let cfg = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.gate.min_improvement_pct, 10.0);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = PipelineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn test_auto_approve_permits() {
        let mut a = AutoApproveConfig::default();
        assert!(!a.permits(0.1, Category::BugFix), "disabled by default");
        a.enabled = true;
        assert!(a.permits(0.3, Category::BugFix));
        assert!(!a.permits(0.31, Category::BugFix));
        assert!(!a.permits(0.1, Category::Feature));
    }
}
