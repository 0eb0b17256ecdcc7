//! # Stage: Analysis
//!
//! Telemetry in, ranked hypotheses out.
//!
//! ```text
//! TelemetrySource ──► PatternAnalyzer::detect_patterns ──► Vec<Pattern>
//!                                   │
//!                                   ▼
//!                     PatternAnalyzer::generate_hypotheses
//!                                   │
//!                                   ▼
//!                     Prioritizer::rank ──► Vec<RankedHypothesis>
//! ```

pub mod analyzer;
pub mod prioritizer;

pub use analyzer::{AnalyzerConfig, PatternAnalyzer};
pub use prioritizer::{CategoryWeights, Prioritizer, PrioritizerConfig, RankedHypothesis};
