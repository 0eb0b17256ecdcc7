//! # Stage: Metrics Collector
//!
//! ## Responsibility
//! Aggregate what the pipeline did: evolutions attempted and how each one
//! ended, gate pass rate, rollout durations per strategy, per-category
//! success rates (fed back into the prioritizer) and the most recent failure
//! causes.
//!
//! ## Guarantees
//! - Bounded: cycle records and failure causes are capped, oldest evicted
//! - Outcomes are attributed to the cycle that admitted the evolution, even
//!   when the evolution finishes several cycles later
//! - Non-panicking: a poisoned lock yields an empty report
//!
//! ## NOT Responsible For
//! - Exporting to an external metrics backend

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::model::{Category, Evolution, EvolutionStatus, StrategyKind};

/// Default cap on retained cycle records and failure causes.
pub const DEFAULT_HISTORY: usize = 50;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rolled_back: u64,
}

impl OutcomeCounts {
    fn finish(&mut self, status: EvolutionStatus) {
        match status {
            EvolutionStatus::Completed => self.succeeded += 1,
            EvolutionStatus::RolledBack => self.rolled_back += 1,
            EvolutionStatus::Failed => self.failed += 1,
            _ => {}
        }
    }

    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.rolled_back
    }

    pub fn in_flight(&self) -> u64 {
        self.attempted.saturating_sub(self.finished())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRecord {
    pub cycle: u64,
    pub started_at_ms: u64,
    pub hypotheses: usize,
    pub admitted: usize,
    pub outcomes: OutcomeCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureCause {
    pub evolution_id: String,
    pub category: Category,
    pub status: EvolutionStatus,
    pub reason: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ValidationStats {
    pub gated: u64,
    pub passed: u64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    pub deployments: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    pub cycles: u64,
    pub cumulative: OutcomeCounts,
    pub recent_cycles: Vec<CycleRecord>,
    pub validation: ValidationStats,
    pub strategies: BTreeMap<StrategyKind, StrategyStats>,
    pub category_success_rates: BTreeMap<Category, f64>,
    pub recent_failures: Vec<FailureCause>,
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    cycles: u64,
    cumulative: OutcomeCounts,
    recent_cycles: VecDeque<CycleRecord>,
    gated: u64,
    gate_passed: u64,
    durations: BTreeMap<StrategyKind, (u64, u64)>,
    categories: BTreeMap<Category, OutcomeCounts>,
    failures: VecDeque<FailureCause>,
}

#[derive(Debug)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    history: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl MetricsCollector {
    pub fn new(history: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), history: history.max(1) }
    }

    pub fn record_cycle(&self, cycle: u64, started_at_ms: u64, hypotheses: usize, admitted: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.cycles += 1;
            inner.recent_cycles.push_back(CycleRecord {
                cycle,
                started_at_ms,
                hypotheses,
                admitted,
                outcomes: OutcomeCounts::default(),
            });
            while inner.recent_cycles.len() > self.history {
                inner.recent_cycles.pop_front();
            }
        }
    }

    /// `cycle` is `None` for hypotheses submitted outside a scheduled cycle;
    /// those count towards the cumulative and category totals only.
    pub fn record_attempt(&self, cycle: Option<u64>, category: Category) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.cumulative.attempted += 1;
            inner.categories.entry(category).or_default().attempted += 1;
            if let Some(c) = inner.recent_cycles.iter_mut().find(|c| Some(c.cycle) == cycle) {
                c.outcomes.attempted += 1;
            }
        }
    }

    pub fn record_validation(&self, passed: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.gated += 1;
            if passed {
                inner.gate_passed += 1;
            }
        }
    }

    pub fn record_deployment(&self, strategy: StrategyKind, duration_ms: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            let slot = inner.durations.entry(strategy).or_default();
            slot.0 += 1;
            slot.1 = slot.1.saturating_add(duration_ms);
        }
    }

    /// Count a finished evolution against the cycle that admitted it.
    pub fn record_outcome(&self, cycle: Option<u64>, evolution: &Evolution) {
        let status = evolution.status;
        if !status.is_terminal() {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            inner.cumulative.finish(status);
            inner.categories.entry(evolution.hypothesis.category).or_default().finish(status);
            if let Some(c) = inner.recent_cycles.iter_mut().find(|c| Some(c.cycle) == cycle) {
                c.outcomes.finish(status);
            }
            if status != EvolutionStatus::Completed {
                inner.failures.push_back(FailureCause {
                    evolution_id: evolution.id.clone(),
                    category: evolution.hypothesis.category,
                    status,
                    reason: evolution.failure_reason.clone().unwrap_or_else(|| status.to_string()),
                    at_ms: evolution.completed_at_ms.unwrap_or_default(),
                });
                while inner.failures.len() > self.history {
                    inner.failures.pop_front();
                }
            }
        }
    }

    /// Succeeded / finished per category; categories with nothing finished
    /// are absent.
    pub fn category_success_rates(&self) -> BTreeMap<Category, f64> {
        self.inner.lock().map(|inner| success_rates(&inner)).unwrap_or_default()
    }

    pub fn report(&self) -> MetricsReport {
        let Ok(inner) = self.inner.lock() else {
            return MetricsReport::default();
        };
        MetricsReport {
            cycles: inner.cycles,
            cumulative: inner.cumulative,
            recent_cycles: inner.recent_cycles.iter().cloned().collect(),
            validation: ValidationStats {
                gated: inner.gated,
                passed: inner.gate_passed,
                pass_rate: ratio(inner.gate_passed, inner.gated),
            },
            strategies: inner
                .durations
                .iter()
                .map(|(&k, &(n, total))| (k, StrategyStats { deployments: n, average_duration_ms: ratio(total, n) }))
                .collect(),
            category_success_rates: success_rates(&inner),
            recent_failures: inner.failures.iter().cloned().collect(),
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn success_rates(inner: &Inner) -> BTreeMap<Category, f64> {
    inner
        .categories
        .iter()
        .filter(|(_, c)| c.finished() > 0)
        .map(|(&cat, c)| (cat, ratio(c.succeeded, c.finished())))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
