//! # Stage: Prioritizer
//!
//! ## Responsibility
//! Order hypotheses by a weighted score:
//!
//! ```text
//! score = w_category   * category_weight(category)
//!       + w_confidence * confidence
//!       + w_impact     * min(1, max(change_pct) / 100)
//!       + w_history    * success_rate(category)
//! ```
//!
//! ## Guarantees
//! - Stable: equal scores keep creation order (`created_at_ms`, then `sequence`).
//! - Total: NaN scores sort last instead of panicking.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{Category, ImprovementHypothesis};

/// Success rate assumed for categories with no history yet.
const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryWeights {
    pub bug_fix: f64,
    pub reliability: f64,
    pub performance: f64,
    pub refactor: f64,
    pub feature: f64,
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self { bug_fix: 1.0, reliability: 0.8, performance: 0.7, refactor: 0.4, feature: 0.3 }
    }
}

impl CategoryWeights {
    pub fn weight(&self, category: Category) -> f64 {
        match category {
            Category::BugFix => self.bug_fix,
            Category::Reliability => self.reliability,
            Category::Performance => self.performance,
            Category::Refactor => self.refactor,
            Category::Feature => self.feature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizerConfig {
    pub category_weight: f64,
    pub confidence_weight: f64,
    pub impact_weight: f64,
    /// Weight of the historical per-category success rate.  Zero disables it.
    pub history_weight: f64,
    pub categories: CategoryWeights,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            category_weight: 0.4,
            confidence_weight: 0.35,
            impact_weight: 0.25,
            history_weight: 0.0,
            categories: CategoryWeights::default(),
        }
    }
}

impl PrioritizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, w) in [
            ("prioritizer.category_weight", self.category_weight),
            ("prioritizer.confidence_weight", self.confidence_weight),
            ("prioritizer.impact_weight", self.impact_weight),
            ("prioritizer.history_weight", self.history_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(field, "must be a finite, non-negative number"));
            }
        }
        let c = &self.categories;
        if !(c.bug_fix > c.performance && c.performance > c.feature) {
            return Err(ConfigError::invalid(
                "prioritizer.categories",
                "bug_fix must outrank performance, which must outrank feature",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Prioritizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RankedHypothesis {
    pub hypothesis: ImprovementHypothesis,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Prioritizer {
    config: PrioritizerConfig,
}

impl Prioritizer {
    pub fn new(config: PrioritizerConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, h: &ImprovementHypothesis, history: &BTreeMap<Category, f64>) -> f64 {
        let cfg = &self.config;
        let impact = (h.max_change_pct() / 100.0).min(1.0);
        let success = history.get(&h.category).copied().unwrap_or(NEUTRAL_SUCCESS_RATE);
        cfg.category_weight * cfg.categories.weight(h.category)
            + cfg.confidence_weight * h.confidence
            + cfg.impact_weight * impact
            + cfg.history_weight * success
    }

    /// Highest score first; ties keep creation order.
    pub fn rank(
        &self,
        mut hypotheses: Vec<ImprovementHypothesis>,
        history: &BTreeMap<Category, f64>,
    ) -> Vec<RankedHypothesis> {
        hypotheses.sort_by_key(|h| (h.created_at_ms, h.sequence));
        let mut ranked: Vec<RankedHypothesis> = hypotheses
            .into_iter()
            .map(|h| {
                let score = self.score(&h, history);
                RankedHypothesis { hypothesis: h, score: if score.is_nan() { f64::NEG_INFINITY } else { score } }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
