//! # Stage: Pattern Analyzer
//!
//! ## Responsibility
//! Group tool-execution records by tool, flag tools that are consistently
//! slow (hotspot), failure-prone (error-prone) or memory-hungry
//! (resource-heavy), and turn every flagged pattern into one improvement
//! hypothesis.
//!
//! ## Guarantees
//! - Deterministic: the same records yield the same patterns in the same order
//!   (tools are visited in lexical order; kinds in declaration order).
//! - Confidence grows with sample size and severity and never exceeds 1.
//! - Tools observed fewer than `min_frequency` times are ignored.
//!
//! ## NOT Responsible For
//! - Ranking (see `prioritizer`)
//! - Deduplicating against in-flight work (the orchestrator does that)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::model::{
    is_unit, Category, ExpectedImpact, ImprovementHypothesis, Pattern, PatternContext, PatternImpact,
    PatternKind,
};
use crate::telemetry::{TelemetrySource, ToolExecutionRecord};

// ---------------------------------------------------------------------------
// AnalyzerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Mean duration at or above which a tool is a hotspot.
    pub slow_threshold_ms: u64,
    /// Failure ratio at or above which a tool is error-prone.
    pub error_rate_threshold: f64,
    /// Mean memory at or above which a tool is resource-heavy.
    pub resource_threshold_bytes: u64,
    /// Minimum executions before a tool is considered at all.
    pub min_frequency: u64,
    /// Sample size at which the sample-size factor of confidence reaches 1.
    pub confident_sample_size: u64,
    /// Patterns below this confidence are discarded.
    pub min_confidence: f64,
    /// Expected improvement (percent) proposed for each pattern kind.
    pub hotspot_reduction_pct: f64,
    pub error_reduction_pct: f64,
    pub resource_reduction_pct: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 1_000,
            error_rate_threshold: 0.1,
            resource_threshold_bytes: 512 * 1024 * 1024,
            min_frequency: 5,
            confident_sample_size: 20,
            min_confidence: 0.5,
            hotspot_reduction_pct: 30.0,
            error_reduction_pct: 50.0,
            resource_reduction_pct: 25.0,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slow_threshold_ms == 0 {
            return Err(ConfigError::invalid("analyzer.slow_threshold_ms", "must be > 0"));
        }
        if self.resource_threshold_bytes == 0 {
            return Err(ConfigError::invalid("analyzer.resource_threshold_bytes", "must be > 0"));
        }
        if !is_unit(self.error_rate_threshold) || self.error_rate_threshold == 0.0 {
            return Err(ConfigError::invalid("analyzer.error_rate_threshold", "must be in (0, 1]"));
        }
        if !is_unit(self.min_confidence) {
            return Err(ConfigError::invalid("analyzer.min_confidence", "must be in [0, 1]"));
        }
        if self.confident_sample_size == 0 {
            return Err(ConfigError::invalid("analyzer.confident_sample_size", "must be > 0"));
        }
        for (field, pct) in [
            ("analyzer.hotspot_reduction_pct", self.hotspot_reduction_pct),
            ("analyzer.error_reduction_pct", self.error_reduction_pct),
            ("analyzer.resource_reduction_pct", self.resource_reduction_pct),
        ] {
            if !(pct > 0.0 && pct < 100.0) {
                return Err(ConfigError::invalid(field, "must be in (0, 100)"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-tool aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ToolStats {
    count: u64,
    total_ms: u64,
    failures: u64,
    mem_total: u128,
    mem_samples: u64,
}

impl ToolStats {
    fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }

    fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failures as f64 / self.count as f64
        }
    }

    fn avg_mem(&self) -> f64 {
        if self.mem_samples == 0 {
            0.0
        } else {
            self.mem_total as f64 / self.mem_samples as f64
        }
    }
}

fn aggregate(records: &[ToolExecutionRecord]) -> BTreeMap<&str, ToolStats> {
    let mut by_tool: BTreeMap<&str, ToolStats> = BTreeMap::new();
    for r in records {
        if r.validate().is_err() {
            continue;
        }
        let s = by_tool.entry(r.tool_id.as_str()).or_default();
        s.count += 1;
        s.total_ms = s.total_ms.saturating_add(r.duration_ms);
        if !r.success {
            s.failures += 1;
        }
        if let Some(mem) = r.memory_bytes {
            s.mem_total += mem as u128;
            s.mem_samples += 1;
        }
    }
    by_tool
}

/// Share of the observed value that lies above the threshold, in `[0, 1]`.
fn excess_fraction(observed: f64, threshold: f64) -> f64 {
    if observed <= 0.0 {
        return 0.0;
    }
    ((observed - threshold) / observed).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// PatternAnalyzer
// ---------------------------------------------------------------------------

pub struct PatternAnalyzer {
    config: AnalyzerConfig,
    telemetry: Arc<dyn TelemetrySource>,
    sequence: AtomicU64,
}

impl PatternAnalyzer {
    pub fn new(config: AnalyzerConfig, telemetry: Arc<dyn TelemetrySource>) -> Self {
        Self { config, telemetry, sequence: AtomicU64::new(0) }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Detect patterns in the current telemetry snapshot.
    pub fn detect_patterns(&self, now_ms: u64) -> Vec<Pattern> {
        let records = self.telemetry.records();
        self.analyze(&records, now_ms)
    }

    /// Detect patterns in `records`.
    pub fn analyze(&self, records: &[ToolExecutionRecord], now_ms: u64) -> Vec<Pattern> {
        let cfg = &self.config;
        let mut patterns = Vec::new();

        for (tool, stats) in aggregate(records) {
            if stats.count < cfg.min_frequency {
                continue;
            }
            let sample_factor = (stats.count as f64 / cfg.confident_sample_size as f64).min(1.0);
            let avg_ms = stats.avg_ms();
            let error_rate = stats.error_rate();
            let avg_mem = stats.avg_mem();
            let context = PatternContext {
                tools: vec![tool.to_string()],
                avg_exec_time_ms: avg_ms,
                error_rate,
                resource_usage: avg_mem,
            };

            let threshold_ms = cfg.slow_threshold_ms as f64;
            if avg_ms >= threshold_ms {
                let ratio = avg_ms / threshold_ms;
                let perf = excess_fraction(avg_ms, threshold_ms);
                patterns.push(Pattern {
                    id: format!("pat-hotspot-{tool}"),
                    kind: PatternKind::Hotspot,
                    confidence: sample_factor * (0.5 + 0.25 * ratio).min(1.0),
                    frequency: stats.count,
                    impact: PatternImpact { performance: perf, user_experience: perf * 0.75, resource: 0.0 },
                    context: context.clone(),
                    detected_at_ms: now_ms,
                });
            }

            if error_rate >= cfg.error_rate_threshold {
                patterns.push(Pattern {
                    id: format!("pat-error-prone-{tool}"),
                    kind: PatternKind::ErrorProne,
                    confidence: sample_factor * (0.5 + error_rate).min(1.0),
                    frequency: stats.failures,
                    impact: PatternImpact {
                        performance: 0.1,
                        user_experience: (error_rate * 2.0).min(1.0),
                        resource: 0.0,
                    },
                    context: context.clone(),
                    detected_at_ms: now_ms,
                });
            }

            let threshold_mem = cfg.resource_threshold_bytes as f64;
            if stats.mem_samples >= cfg.min_frequency && avg_mem >= threshold_mem {
                let mem_factor = (stats.mem_samples as f64 / cfg.confident_sample_size as f64).min(1.0);
                let ratio = avg_mem / threshold_mem;
                patterns.push(Pattern {
                    id: format!("pat-resource-heavy-{tool}"),
                    kind: PatternKind::ResourceHeavy,
                    confidence: mem_factor * (0.5 + 0.25 * ratio).min(1.0),
                    frequency: stats.mem_samples,
                    impact: PatternImpact {
                        performance: 0.1,
                        user_experience: 0.0,
                        resource: excess_fraction(avg_mem, threshold_mem),
                    },
                    context,
                    detected_at_ms: now_ms,
                });
            }
        }

        patterns.retain(|p| p.confidence >= cfg.min_confidence);
        if !patterns.is_empty() {
            tracing::debug!(target: "evolution::analyzer", count = patterns.len(), "patterns detected");
        }
        patterns
    }

    /// One hypothesis per valid pattern.  Invalid patterns are skipped.
    pub fn generate_hypotheses(&self, patterns: &[Pattern], now_ms: u64) -> Vec<ImprovementHypothesis> {
        let mut out = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if let Err(e) = pattern.validate() {
                tracing::warn!(target: "evolution::analyzer", error = %e, "skipping invalid pattern");
                continue;
            }
            let hypothesis = self.hypothesis_for(pattern, now_ms);
            match hypothesis.validate() {
                Ok(()) => out.push(hypothesis),
                Err(e) => {
                    tracing::warn!(target: "evolution::analyzer", error = %e, "discarding generated hypothesis")
                }
            }
        }
        out
    }

    fn hypothesis_for(&self, pattern: &Pattern, now_ms: u64) -> ImprovementHypothesis {
        let cfg = &self.config;
        let ctx = &pattern.context;
        let tools = ctx.tools.join(", ");
        let (category, description, metric, current, pct, risks) = match pattern.kind {
            PatternKind::Hotspot => (
                Category::Performance,
                format!("Reduce mean execution time of `{tools}` ({:.0} ms)", ctx.avg_exec_time_ms),
                "avg_exec_time_ms",
                ctx.avg_exec_time_ms,
                cfg.hotspot_reduction_pct,
                vec!["caching or batching may change observable ordering".to_string()],
            ),
            PatternKind::ErrorProne => (
                Category::BugFix,
                format!("Fix recurring failures in `{tools}` ({:.1}% error rate)", ctx.error_rate * 100.0),
                "error_rate",
                ctx.error_rate,
                cfg.error_reduction_pct,
                vec!["retry or fallback logic may mask the root cause".to_string()],
            ),
            PatternKind::ResourceHeavy => (
                Category::Performance,
                format!("Reduce memory footprint of `{tools}` ({:.0} MiB)", ctx.resource_usage / 1_048_576.0),
                "memory_bytes",
                ctx.resource_usage,
                cfg.resource_reduction_pct,
                vec!["lower memory use may cost latency".to_string()],
            ),
        };

        ImprovementHypothesis {
            id: format!("hyp-{}", Uuid::new_v4()),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            category,
            description,
            expected_impact: vec![ExpectedImpact {
                metric: metric.to_string(),
                current,
                target: current * (1.0 - pct / 100.0),
                change_pct: pct,
            }],
            confidence: pattern.confidence,
            risks,
            dependencies: Vec::new(),
            tools: ctx.tools.clone(),
            source_pattern: Some(pattern.id.clone()),
            created_at_ms: now_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
