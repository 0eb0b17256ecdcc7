//! Feature-flag store: the routing switch every strategy writes through.
//!
//! One flag per evolution id.  Writers to different ids never contend: the
//! in-memory store keeps a lock per key and only takes the map lock to create
//! a missing entry.  An absent flag reads as disabled at 0 %.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FlagError;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlagState {
    pub enabled: bool,
    /// Share of traffic routed to the change, `0..=100`.
    pub percentage: u8,
    pub user_groups: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Incremented on every successful write.
    pub version: u64,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagUpdate {
    pub enabled: Option<bool>,
    pub percentage: Option<u8>,
    pub user_groups: Option<Vec<String>>,
    /// Merged into the existing metadata unless `replace_metadata` is set.
    pub metadata: Option<BTreeMap<String, String>>,
    pub replace_metadata: bool,
}

impl FlagUpdate {
    /// Route `percentage` of traffic; the flag is enabled iff it is non-zero.
    pub fn route(percentage: u8) -> Self {
        Self { enabled: Some(percentage > 0), percentage: Some(percentage), ..Self::default() }
    }

    pub fn disable() -> Self {
        Self::route(0)
    }

    /// Overwrite every field with `state`'s values.
    pub fn restore(state: &FlagState) -> Self {
        Self {
            enabled: Some(state.enabled),
            percentage: Some(state.percentage),
            user_groups: Some(state.user_groups.clone()),
            metadata: Some(state.metadata.clone()),
            replace_metadata: true,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.get_or_insert_with(BTreeMap::new).insert(key.into(), value.into());
        self
    }

    fn apply(&self, state: &mut FlagState) -> Result<(), FlagError> {
        if let Some(pct) = self.percentage {
            if pct > 100 {
                return Err(FlagError::OutOfRange(pct));
            }
            state.percentage = pct;
        }
        if let Some(enabled) = self.enabled {
            state.enabled = enabled;
        }
        if let Some(groups) = &self.user_groups {
            state.user_groups = groups.clone();
        }
        match &self.metadata {
            Some(meta) if self.replace_metadata => state.metadata = meta.clone(),
            Some(meta) => state.metadata.extend(meta.iter().map(|(k, v)| (k.clone(), v.clone()))),
            None => {}
        }
        state.version += 1;
        Ok(())
    }
}

#[async_trait]
pub trait FeatureFlagStore: Send + Sync {
    async fn get(&self, evolution_id: &str) -> Result<Option<FlagState>, FlagError>;

    /// Unconditional write.
    async fn update_flag(&self, evolution_id: &str, update: FlagUpdate) -> Result<FlagState, FlagError>;

    /// Write only if the current percentage equals `expected_percentage`.
    async fn compare_and_set(
        &self,
        evolution_id: &str,
        expected_percentage: u8,
        update: FlagUpdate,
    ) -> Result<FlagState, FlagError>;
}

// ---------------------------------------------------------------------------
// InMemoryFlagStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    state: FlagState,
    /// Every percentage written, in order.
    history: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct InMemoryFlagStore {
    slots: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl InMemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, evolution_id: &str) -> Result<Arc<Mutex<Slot>>, FlagError> {
        if let Some(slot) = self.slots.read().map_err(|_| FlagError::LockPoisoned)?.get(evolution_id) {
            return Ok(Arc::clone(slot));
        }
        let mut map = self.slots.write().map_err(|_| FlagError::LockPoisoned)?;
        Ok(Arc::clone(map.entry(evolution_id.to_string()).or_default()))
    }

    fn write(&self, evolution_id: &str, expected: Option<u8>, update: &FlagUpdate) -> Result<FlagState, FlagError> {
        let slot = self.slot(evolution_id)?;
        let mut slot = slot.lock().map_err(|_| FlagError::LockPoisoned)?;
        if let Some(expected) = expected {
            if slot.state.percentage != expected {
                return Err(FlagError::Conflict {
                    evolution_id: evolution_id.to_string(),
                    expected,
                    actual: slot.state.percentage,
                });
            }
        }
        let mut next = slot.state.clone();
        update.apply(&mut next)?;
        slot.history.push(next.percentage);
        slot.state = next.clone();
        Ok(next)
    }

    /// Percentages written for `evolution_id`, oldest first.
    pub fn history(&self, evolution_id: &str) -> Vec<u8> {
        self.slots
            .read()
            .ok()
            .and_then(|map| map.get(evolution_id).cloned())
            .and_then(|slot| slot.lock().ok().map(|s| s.history.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl FeatureFlagStore for InMemoryFlagStore {
    async fn get(&self, evolution_id: &str) -> Result<Option<FlagState>, FlagError> {
        let map = self.slots.read().map_err(|_| FlagError::LockPoisoned)?;
        match map.get(evolution_id) {
            Some(slot) => Ok(Some(slot.lock().map_err(|_| FlagError::LockPoisoned)?.state.clone())),
            None => Ok(None),
        }
    }

    async fn update_flag(&self, evolution_id: &str, update: FlagUpdate) -> Result<FlagState, FlagError> {
        self.write(evolution_id, None, &update)
    }

    async fn compare_and_set(
        &self,
        evolution_id: &str,
        expected_percentage: u8,
        update: FlagUpdate,
    ) -> Result<FlagState, FlagError> {
        self.write(evolution_id, Some(expected_percentage), &update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_flag_reads_as_none_and_cas_from_zero_creates_it() {
        let store = InMemoryFlagStore::new();
        assert_eq!(store.get("e1").await.unwrap(), None);
        let s = store.compare_and_set("e1", 0, FlagUpdate::route(10)).await.unwrap();
        assert!(s.enabled);
        assert_eq!(s.percentage, 10);
        assert_eq!(s.version, 1);
    }

    #[tokio::test]
    async fn test_cas_conflict_reports_actual() {
        let store = InMemoryFlagStore::new();
        store.update_flag("e1", FlagUpdate::route(50)).await.unwrap();
        let err = store.compare_and_set("e1", 10, FlagUpdate::route(100)).await.unwrap_err();
        assert_eq!(err, FlagError::Conflict { evolution_id: "e1".into(), expected: 10, actual: 50 });
        assert_eq!(store.get("e1").await.unwrap().unwrap().percentage, 50);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_without_write() {
        let store = InMemoryFlagStore::new();
        let err = store.update_flag("e1", FlagUpdate::route(101)).await.unwrap_err();
        assert_eq!(err, FlagError::OutOfRange(101));
        assert!(store.history("e1").is_empty());
    }

    #[tokio::test]
    async fn test_metadata_merges_and_restore_overwrites() {
        let store = InMemoryFlagStore::new();
        store.update_flag("e1", FlagUpdate::disable().with_metadata("owner", "search")).await.unwrap();
        let before = store.get("e1").await.unwrap().unwrap();
        store
            .update_flag("e1", FlagUpdate::route(100).with_metadata("environment", "green"))
            .await
            .unwrap();
        let s = store.get("e1").await.unwrap().unwrap();
        assert_eq!(s.metadata.get("environment").map(String::as_str), Some("green"));
        assert_eq!(s.metadata.get("owner").map(String::as_str), Some("search"));

        let restored = store.update_flag("e1", FlagUpdate::restore(&before)).await.unwrap();
        assert_eq!(restored.percentage, 0);
        assert!(!restored.enabled);
        assert_eq!(restored.metadata, before.metadata);
        assert!(!restored.metadata.contains_key("environment"));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_interfere() {
        let store = Arc::new(InMemoryFlagStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = format!("evo-{i}");
                for pct in [10u8, 50, 100] {
                    let prev = store.get(&id).await.unwrap().map_or(0, |s| s.percentage);
                    store.compare_and_set(&id, prev, FlagUpdate::route(pct)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for i in 0..16 {
            assert_eq!(store.history(&format!("evo-{i}")), vec![10, 50, 100]);
        }
    }
}
