//! # Stage: Rollback Manager
//!
//! ## Responsibility
//! Remember the flag state each evolution found before its rollout started,
//! and put that state back on request.  Candidates that get rolled back are
//! moved to a quarantine list for postmortem.
//!
//! ## Guarantees
//! - Idempotent: rolling back twice, or rolling back an id that never
//!   deployed, changes nothing.
//! - The first recorded baseline wins; later `record_state` calls for the
//!   same id are ignored.
//! - Quarantined artifacts are never dropped; [`RollbackManager::release`]
//!   only forgets the baseline of a finished evolution.
//!
//! ## NOT Responsible For
//! - Walking traffic down step by step (the deployment strategy does that)
//! - Deciding *when* to roll back (the orchestrator)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock::Clock;
use crate::deploy::{FeatureFlagStore, FlagState, FlagUpdate};
use crate::error::FlagError;
use crate::model::{CodeChange, Evolution};

/// Compare-and-set attempts before the restore falls back to a blind write.
const MAX_RESTORE_ATTEMPTS: usize = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Recorded,
    RollingBack,
    RolledBack,
}

#[derive(Debug, Clone)]
struct RollbackEntry {
    baseline: FlagState,
    state: EntryState,
    artifact: Option<Artifact>,
}

#[derive(Debug, Clone)]
struct Artifact {
    hypothesis_id: String,
    changes: Vec<CodeChange>,
}

/// What a call to [`RollbackManager::rollback`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Baseline flag state written back.
    Restored,
    AlreadyRolledBack,
    /// No state was ever recorded for this id.
    NeverDeployed,
}

/// A rolled-back candidate kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantinedArtifact {
    pub evolution_id: String,
    pub hypothesis_id: String,
    pub changes: Vec<CodeChange>,
    pub reason: String,
    pub quarantined_at_ms: u64,
}

// ---------------------------------------------------------------------------
// RollbackManager
// ---------------------------------------------------------------------------

pub struct RollbackManager {
    flags: Arc<dyn FeatureFlagStore>,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, RollbackEntry>>,
    quarantine: Mutex<Vec<QuarantinedArtifact>>,
}

impl RollbackManager {
    pub fn new(flags: Arc<dyn FeatureFlagStore>, clock: Arc<dyn Clock>) -> Self {
        Self { flags, clock, entries: Mutex::new(HashMap::new()), quarantine: Mutex::new(Vec::new()) }
    }

    /// Remember `prior` as the state to restore for `evolution_id`.
    pub fn record_state(&self, evolution_id: &str, prior: FlagState) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(evolution_id.to_string()).or_insert(RollbackEntry {
                baseline: prior,
                state: EntryState::Recorded,
                artifact: None,
            });
        }
    }

    /// Read the live flag and record it, together with the candidate's
    /// changes, before a rollout starts.
    pub async fn capture(&self, evolution: &Evolution) -> Result<(), FlagError> {
        let prior = self.flags.get(&evolution.id).await?.unwrap_or_default();
        self.record_state(&evolution.id, prior);
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(&evolution.id) {
                entry.artifact.get_or_insert_with(|| Artifact {
                    hypothesis_id: evolution.hypothesis.id.clone(),
                    changes: evolution.changes.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn baseline(&self, evolution_id: &str) -> Option<FlagState> {
        self.entries.lock().ok()?.get(evolution_id).map(|e| e.baseline.clone())
    }

    /// Restore the recorded baseline for `evolution_id` and quarantine its
    /// candidate.
    pub async fn rollback(&self, evolution_id: &str) -> Result<RollbackOutcome, FlagError> {
        let baseline = {
            let mut entries = self.entries.lock().map_err(|_| FlagError::LockPoisoned)?;
            let Some(entry) = entries.get_mut(evolution_id) else {
                return Ok(RollbackOutcome::NeverDeployed);
            };
            if entry.state != EntryState::Recorded {
                return Ok(RollbackOutcome::AlreadyRolledBack);
            }
            entry.state = EntryState::RollingBack;
            entry.baseline.clone()
        };

        let restored = self.restore(evolution_id, &baseline).await;

        let mut entries = self.entries.lock().map_err(|_| FlagError::LockPoisoned)?;
        let entry = entries.get_mut(evolution_id);
        match restored {
            Ok(()) => {
                let artifact = entry.and_then(|e| {
                    e.state = EntryState::RolledBack;
                    e.artifact.take()
                });
                drop(entries);
                if let Some(artifact) = artifact {
                    self.quarantine_artifact(evolution_id, artifact, "rolled back".into());
                }
                tracing::info!(
                    target: "evolution::rollback",
                    evolution_id = %evolution_id,
                    percentage = baseline.percentage,
                    "baseline flag state restored"
                );
                Ok(RollbackOutcome::Restored)
            }
            Err(e) => {
                if let Some(entry) = entry {
                    entry.state = EntryState::Recorded;
                }
                Err(e)
            }
        }
    }

    async fn restore(&self, evolution_id: &str, baseline: &FlagState) -> Result<(), FlagError> {
        for _ in 0..MAX_RESTORE_ATTEMPTS {
            let current = self.flags.get(evolution_id).await?.map(|s| s.percentage).unwrap_or(0);
            match self.flags.compare_and_set(evolution_id, current, FlagUpdate::restore(baseline)).await {
                Ok(_) => return Ok(()),
                Err(FlagError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(
            target: "evolution::rollback",
            evolution_id = %evolution_id,
            "flag kept changing during restore; writing baseline unconditionally"
        );
        self.flags.update_flag(evolution_id, FlagUpdate::restore(baseline)).await.map(|_| ())
    }

    /// Quarantine `evolution`'s candidate without touching flags, e.g. when a
    /// rollout aborted before moving traffic.
    pub fn quarantine(&self, evolution: &Evolution, reason: impl Into<String>) {
        let artifact = self
            .entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.get_mut(&evolution.id).and_then(|e| e.artifact.take()))
            .unwrap_or_else(|| Artifact {
                hypothesis_id: evolution.hypothesis.id.clone(),
                changes: evolution.changes.clone(),
            });
        self.quarantine_artifact(&evolution.id, artifact, reason.into());
    }

    fn quarantine_artifact(&self, evolution_id: &str, artifact: Artifact, reason: String) {
        if let Ok(mut q) = self.quarantine.lock() {
            if q.iter().any(|a| a.evolution_id == evolution_id) {
                return;
            }
            q.push(QuarantinedArtifact {
                evolution_id: evolution_id.to_string(),
                hypothesis_id: artifact.hypothesis_id,
                changes: artifact.changes,
                reason,
                quarantined_at_ms: self.clock.now_ms(),
            });
        }
    }

    pub fn quarantined(&self) -> Vec<QuarantinedArtifact> {
        self.quarantine.lock().map(|q| q.clone()).unwrap_or_default()
    }

    /// Drop the baseline and unquarantined artifact kept for a finished
    /// evolution.  Quarantined artifacts stay.
    pub fn release(&self, evolution_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(evolution_id);
        }
    }

    /// Number of evolutions with a recorded baseline.
    pub fn tracked(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::deploy::InMemoryFlagStore;
    use crate::model::{Category, ImprovementHypothesis};

    fn manager() -> (RollbackManager, Arc<InMemoryFlagStore>) {
        let flags = Arc::new(InMemoryFlagStore::new());
        (RollbackManager::new(flags.clone(), Arc::new(ManualClock::new(5_000))), flags)
    }

    fn evolution(id: &str) -> Evolution {
        let h = ImprovementHypothesis {
            id: "hyp-1".into(),
            sequence: 1,
            category: Category::Performance,
            description: "cache lookups".into(),
            expected_impact: Vec::new(),
            confidence: 0.8,
            risks: Vec::new(),
            dependencies: Vec::new(),
            tools: vec!["search".into()],
            source_pattern: None,
            created_at_ms: 0,
        };
        let mut e = Evolution::new(h, 0);
        e.id = id.into();
        e.changes = vec![CodeChange {
            file: "src/search.rs".into(),
            before: "a".into(),
            after: "b".into(),
            diff: "-a\n+b".into(),
            rationale: "faster".into(),
        }];
        e
    }

    #[tokio::test]
    async fn test_rollback_restores_baseline_and_quarantines() {
        let (m, flags) = manager();
        let evo = evolution("evo-1");
        m.capture(&evo).await.unwrap();
        flags.update_flag("evo-1", FlagUpdate::route(50)).await.unwrap();

        assert_eq!(m.rollback("evo-1").await.unwrap(), RollbackOutcome::Restored);
        let state = flags.get("evo-1").await.unwrap().unwrap();
        assert_eq!(state.percentage, 0);
        assert!(!state.enabled);

        let q = m.quarantined();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].hypothesis_id, "hyp-1");
        assert_eq!(q[0].changes.len(), 1);
        assert_eq!(q[0].quarantined_at_ms, 5_000);
    }

    #[tokio::test]
    async fn test_second_rollback_is_noop() {
        let (m, flags) = manager();
        m.capture(&evolution("evo-1")).await.unwrap();
        flags.update_flag("evo-1", FlagUpdate::route(100)).await.unwrap();
        m.rollback("evo-1").await.unwrap();
        let writes = flags.history("evo-1").len();

        assert_eq!(m.rollback("evo-1").await.unwrap(), RollbackOutcome::AlreadyRolledBack);
        assert_eq!(flags.history("evo-1").len(), writes);
        assert_eq!(m.quarantined().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let (m, flags) = manager();
        assert_eq!(m.rollback("nope").await.unwrap(), RollbackOutcome::NeverDeployed);
        assert!(flags.history("nope").is_empty());
    }

    #[tokio::test]
    async fn test_release_forgets_entry_but_keeps_quarantine() {
        let (m, flags) = manager();
        m.capture(&evolution("evo-1")).await.unwrap();
        m.capture(&evolution("evo-2")).await.unwrap();
        flags.update_flag("evo-1", FlagUpdate::route(10)).await.unwrap();
        m.rollback("evo-1").await.unwrap();
        assert_eq!(m.tracked(), 2);

        m.release("evo-1");
        m.release("evo-2");
        m.release("evo-never");
        assert_eq!(m.tracked(), 0);
        assert!(m.baseline("evo-1").is_none());
        assert_eq!(m.rollback("evo-2").await.unwrap(), RollbackOutcome::NeverDeployed);
        assert_eq!(m.quarantined().len(), 1);
    }

    #[test]
    fn test_first_baseline_wins() {
        let (m, _) = manager();
        m.record_state("e", FlagState { percentage: 20, enabled: true, ..Default::default() });
        m.record_state("e", FlagState { percentage: 90, enabled: true, ..Default::default() });
        assert_eq!(m.baseline("e").unwrap().percentage, 20);
    }

    #[test]
    fn test_quarantine_without_deploy_keeps_one_copy() {
        let (m, _) = manager();
        let evo = evolution("evo-q");
        m.quarantine(&evo, "smoke tests failed");
        m.quarantine(&evo, "smoke tests failed");
        let q = m.quarantined();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].reason, "smoke tests failed");
    }
}
