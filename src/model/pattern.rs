//! Recurring inefficiencies detected by the pattern analyzer.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::is_unit;

/// What kind of inefficiency a pattern describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    /// A tool whose executions are consistently slow.
    Hotspot,
    /// A tool that fails often.
    ErrorProne,
    /// A tool with high memory consumption.
    ResourceHeavy,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::Hotspot => write!(f, "hotspot"),
            PatternKind::ErrorProne => write!(f, "error-prone"),
            PatternKind::ResourceHeavy => write!(f, "resource-heavy"),
        }
    }
}

/// Estimated impact of the inefficiency along three axes, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternImpact {
    pub performance: f64,
    pub user_experience: f64,
    pub resource: f64,
}

/// Evidence backing a pattern.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternContext {
    pub tools: Vec<String>,
    pub avg_exec_time_ms: f64,
    pub error_rate: f64,
    /// Mean memory use in bytes; `0.0` when the telemetry carried none.
    pub resource_usage: f64,
}

/// A detected pattern.  Produced by the analyzer and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub confidence: f64,
    /// Number of executions the pattern was observed in.
    pub frequency: u64,
    pub impact: PatternImpact,
    pub context: PatternContext,
    pub detected_at_ms: u64,
}

impl Pattern {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.id.is_empty() {
            return Err(ModelError::schema("pattern", &self.id, "id must not be empty"));
        }
        if !is_unit(self.confidence) {
            return Err(ModelError::schema(
                "pattern",
                &self.id,
                format!("confidence must be in [0, 1], got {}", self.confidence),
            ));
        }
        let i = &self.impact;
        if !(is_unit(i.performance) && is_unit(i.user_experience) && is_unit(i.resource)) {
            return Err(ModelError::schema("pattern", &self.id, "impact components must be in [0, 1]"));
        }
        if !is_unit(self.context.error_rate) {
            return Err(ModelError::schema("pattern", &self.id, "error_rate must be in [0, 1]"));
        }
        if self.context.tools.is_empty() {
            return Err(ModelError::schema("pattern", &self.id, "at least one tool is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotspot() -> Pattern {
        Pattern {
            id: "p1".into(),
            kind: PatternKind::Hotspot,
            confidence: 0.9,
            frequency: 20,
            impact: PatternImpact { performance: 0.4, user_experience: 0.3, resource: 0.0 },
            context: PatternContext {
                tools: vec!["grep".into()],
                avg_exec_time_ms: 1_600.0,
                error_rate: 0.0,
                resource_usage: 0.0,
            },
            detected_at_ms: 0,
        }
    }

    #[test]
    fn test_valid_pattern_passes() {
        assert!(hotspot().validate().is_ok());
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let mut p = hotspot();
        p.confidence = 1.2;
        assert!(p.validate().unwrap_err().to_string().contains("confidence"));
    }

    #[test]
    fn test_nan_impact_rejected() {
        let mut p = hotspot();
        p.impact.resource = f64::NAN;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_kind_serialises_kebab_case() {
        let json = serde_json::to_string(&PatternKind::ErrorProne).unwrap();
        assert_eq!(json, "\"error-prone\"");
        assert_eq!(PatternKind::ResourceHeavy.to_string(), "resource-heavy");
    }
}
