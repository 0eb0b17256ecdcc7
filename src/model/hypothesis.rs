//! Improvement hypotheses: proposed, not-yet-validated changes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::is_unit;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Kind of change a hypothesis proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    BugFix,
    Performance,
    Reliability,
    Refactor,
    Feature,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::BugFix,
        Category::Performance,
        Category::Reliability,
        Category::Refactor,
        Category::Feature,
    ];

    /// Inherent risk of shipping a change of this kind, before confidence.
    pub fn base_risk(self) -> f64 {
        match self {
            Category::BugFix => 0.10,
            Category::Reliability => 0.15,
            Category::Performance => 0.20,
            Category::Refactor => 0.25,
            Category::Feature => 0.35,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::BugFix => "bug-fix",
            Category::Performance => "performance",
            Category::Reliability => "reliability",
            Category::Refactor => "refactor",
            Category::Feature => "feature",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "bug-fix" | "bugfix" => Ok(Category::BugFix),
            "performance" => Ok(Category::Performance),
            "reliability" => Ok(Category::Reliability),
            "refactor" => Ok(Category::Refactor),
            "feature" => Ok(Category::Feature),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ExpectedImpact
// ---------------------------------------------------------------------------

/// Quantified expected benefit on one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedImpact {
    pub metric: String,
    pub current: f64,
    pub target: f64,
    /// Expected improvement in percent; positive is better.
    pub change_pct: f64,
}

// ---------------------------------------------------------------------------
// ImprovementHypothesis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementHypothesis {
    pub id: String,
    /// Monotonic creation sequence; breaks priority ties.
    pub sequence: u64,
    pub category: Category,
    pub description: String,
    pub expected_impact: Vec<ExpectedImpact>,
    pub confidence: f64,
    pub risks: Vec<String>,
    pub dependencies: Vec<String>,
    /// Tools the change targets.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Pattern this hypothesis was derived from, if any.
    #[serde(default)]
    pub source_pattern: Option<String>,
    pub created_at_ms: u64,
}

impl ImprovementHypothesis {
    pub fn validate(&self) -> Result<(), ModelError> {
        let id = self.id.as_str();
        if id.is_empty() {
            return Err(ModelError::schema("hypothesis", id, "id must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(ModelError::schema("hypothesis", id, "description must not be empty"));
        }
        if !is_unit(self.confidence) {
            return Err(ModelError::schema(
                "hypothesis",
                id,
                format!("confidence must be in [0, 1], got {}", self.confidence),
            ));
        }
        for impact in &self.expected_impact {
            if impact.metric.is_empty() {
                return Err(ModelError::schema("hypothesis", id, "impact metric name is empty"));
            }
            if !(impact.current.is_finite() && impact.target.is_finite() && impact.change_pct.is_finite()) {
                return Err(ModelError::schema(
                    "hypothesis",
                    id,
                    format!("impact on `{}` has non-finite values", impact.metric),
                ));
            }
        }
        Ok(())
    }

    /// Largest expected improvement across metrics, never negative.
    pub fn max_change_pct(&self) -> f64 {
        self.expected_impact
            .iter()
            .map(|i| i.change_pct)
            .fold(0.0, f64::max)
    }

    /// Key identifying "the same change" across cycles: category plus the
    /// sorted tool set, or the description when no tools are named.
    pub fn dedup_key(&self) -> String {
        if self.tools.is_empty() {
            let head: String = self.description.chars().take(40).collect();
            return format!("{}:{}", self.category, head);
        }
        let mut tools = self.tools.clone();
        tools.sort();
        format!("{}:{}", self.category, tools.join(","))
    }

    /// Risk score in `[0, 1]` used to gate auto-approval and pick a rollout
    /// strategy.  Grows with category risk, uncertainty and listed risks.
    pub fn risk_level(&self) -> f64 {
        let uncertainty = (1.0 - self.confidence).clamp(0.0, 1.0) * 0.5;
        let listed = 0.05 * self.risks.len() as f64;
        (self.category.base_risk() + uncertainty + listed).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn hypothesis(category: Category, confidence: f64) -> ImprovementHypothesis {
        ImprovementHypothesis {
            id: "h1".into(),
            sequence: 1,
            category,
            description: "speed up grep".into(),
            expected_impact: vec![ExpectedImpact {
                metric: "avg_exec_time_ms".into(),
                current: 1_600.0,
                target: 1_120.0,
                change_pct: 30.0,
            }],
            confidence,
            risks: vec![],
            dependencies: vec![],
            tools: vec!["grep".into()],
            source_pattern: None,
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_category_display_round_trips_through_from_str() {
        for c in Category::ALL {
            assert_eq!(c.to_string().parse::<Category>().unwrap(), c);
        }
    }

    #[test]
    fn test_category_from_str_accepts_underscores() {
        assert_eq!("bug_fix".parse::<Category>().unwrap(), Category::BugFix);
        assert!("mystery".parse::<Category>().is_err());
    }

    #[test]
    fn test_bug_fix_is_least_risky_category() {
        assert!(Category::BugFix.base_risk() < Category::Performance.base_risk());
        assert!(Category::Performance.base_risk() < Category::Feature.base_risk());
    }

    #[test]
    fn test_confident_bug_fix_is_low_risk() {
        let h = hypothesis(Category::BugFix, 0.8);
        assert!((h.risk_level() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_listed_risks_raise_risk_level() {
        let mut h = hypothesis(Category::Feature, 0.5);
        let base = h.risk_level();
        h.risks = vec!["api change".into(), "migration".into()];
        assert!(h.risk_level() > base);
        assert!(h.risk_level() <= 1.0);
    }

    #[test]
    fn test_max_change_pct_ignores_regressions() {
        let mut h = hypothesis(Category::Performance, 0.9);
        h.expected_impact[0].change_pct = -10.0;
        assert_eq!(h.max_change_pct(), 0.0);
    }

    #[test]
    fn test_dedup_key_is_order_insensitive() {
        let mut a = hypothesis(Category::Performance, 0.9);
        a.tools = vec!["b".into(), "a".into()];
        let mut b = a.clone();
        b.tools = vec!["a".into(), "b".into()];
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), "performance:a,b");
    }

    #[test]
    fn test_empty_description_rejected() {
        let mut h = hypothesis(Category::BugFix, 0.9);
        h.description = "  ".into();
        assert!(h.validate().is_err());
    }

    #[test]
    fn test_non_finite_impact_rejected() {
        let mut h = hypothesis(Category::BugFix, 0.9);
        h.expected_impact[0].target = f64::INFINITY;
        assert!(h.validate().unwrap_err().to_string().contains("non-finite"));
    }
}
