//! # Module: store
//!
//! Persistence for evolution and deployment records.  Writes are
//! last-write-wins keyed by id; the orchestrator treats every write as
//! fire-and-forget and only logs failures.
//!
//! - [`InMemoryStore`]: two maps behind mutexes, the default.
//! - [`SqliteStore`] (feature `sqlite-store`): one JSON row per record,
//!   `INSERT OR REPLACE`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::model::{Deployment, Evolution};

pub trait EvolutionStore: Send + Sync {
    fn put_evolution(&self, evolution: &Evolution) -> Result<(), StoreError>;

    fn get_evolution(&self, id: &str) -> Result<Option<Evolution>, StoreError>;

    fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;

    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError>;
}

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryStore {
    evolutions: Mutex<HashMap<String, Evolution>>,
    deployments: Mutex<HashMap<String, Deployment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evolutions(&self) -> Vec<Evolution> {
        let mut all: Vec<Evolution> =
            self.evolutions.lock().map(|m| m.values().cloned().collect()).unwrap_or_default();
        all.sort_by_key(|e| e.created_at_ms);
        all
    }
}

impl EvolutionStore for InMemoryStore {
    fn put_evolution(&self, evolution: &Evolution) -> Result<(), StoreError> {
        self.evolutions
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(evolution.id.clone(), evolution.clone());
        Ok(())
    }

    fn get_evolution(&self, id: &str) -> Result<Option<Evolution>, StoreError> {
        Ok(self.evolutions.lock().map_err(|_| StoreError::LockPoisoned)?.get(id).cloned())
    }

    fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        self.deployments
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.deployments.lock().map_err(|_| StoreError::LockPoisoned)?.get(id).cloned())
    }
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite-store")]
mod sqlite {
    use std::path::Path;
    use std::sync::Mutex;

    use rusqlite::{params, Connection, OptionalExtension};

    use super::EvolutionStore;
    use crate::error::StoreError;
    use crate::model::{Deployment, Evolution};

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS evolutions (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS deployments (
            id TEXT PRIMARY KEY,
            evolution_id TEXT NOT NULL,
            body TEXT NOT NULL
        );";

    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            Self::init(Connection::open(path)?)
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(SCHEMA)?;
            Ok(Self { conn: Mutex::new(conn) })
        }

        fn get_body(&self, sql: &str, id: &str) -> Result<Option<String>, StoreError> {
            let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            Ok(conn.query_row(sql, params![id], |r| r.get(0)).optional()?)
        }
    }

    impl EvolutionStore for SqliteStore {
        fn put_evolution(&self, evolution: &Evolution) -> Result<(), StoreError> {
            let body = serde_json::to_string(evolution)?;
            let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            conn.execute(
                "INSERT OR REPLACE INTO evolutions (id, status, body) VALUES (?1, ?2, ?3)",
                params![evolution.id, evolution.status.to_string(), body],
            )?;
            Ok(())
        }

        fn get_evolution(&self, id: &str) -> Result<Option<Evolution>, StoreError> {
            match self.get_body("SELECT body FROM evolutions WHERE id = ?1", id)? {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        }

        fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
            let body = serde_json::to_string(deployment)?;
            let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            conn.execute(
                "INSERT OR REPLACE INTO deployments (id, evolution_id, body) VALUES (?1, ?2, ?3)",
                params![deployment.id, deployment.evolution_id, body],
            )?;
            Ok(())
        }

        fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
            match self.get_body("SELECT body FROM deployments WHERE id = ?1", id)? {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, EvolutionStatus, ImprovementHypothesis, StrategyKind};

    fn evolution() -> Evolution {
        Evolution::new(
            ImprovementHypothesis {
                id: "h1".into(),
                sequence: 1,
                category: Category::BugFix,
                description: "retry on timeout".into(),
                expected_impact: Vec::new(),
                confidence: 0.7,
                risks: Vec::new(),
                dependencies: Vec::new(),
                tools: vec!["fetch".into()],
                source_pattern: Some("pat-error-prone-fetch".into()),
                created_at_ms: 0,
            },
            0,
        )
    }

    #[test]
    fn test_in_memory_last_write_wins() {
        let store = InMemoryStore::new();
        let mut evo = evolution();
        store.put_evolution(&evo).unwrap();
        evo.transition(EvolutionStatus::Sandboxed, 5).unwrap();
        store.put_evolution(&evo).unwrap();
        let got = store.get_evolution(&evo.id).unwrap().unwrap();
        assert_eq!(got.status, EvolutionStatus::Sandboxed);
        assert_eq!(store.evolutions().len(), 1);
        assert!(store.get_evolution("missing").unwrap().is_none());
    }

    #[test]
    fn test_in_memory_deployments() {
        let store = InMemoryStore::new();
        let d = Deployment::new("evo-1", StrategyKind::Canary, 0);
        store.put_deployment(&d).unwrap();
        assert_eq!(store.get_deployment(&d.id).unwrap().unwrap().evolution_id, "evo-1");
    }

    #[cfg(feature = "sqlite-store")]
    #[test]
    fn test_sqlite_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evolutions.db");
        let evo = evolution();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_evolution(&evo).unwrap();
            let mut later = evo.clone();
            later.fail("gate rejected", 9).unwrap();
            store.put_evolution(&later).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let got = store.get_evolution(&evo.id).unwrap().unwrap();
        assert_eq!(got.status, EvolutionStatus::Failed);
        assert_eq!(got.failure_reason.as_deref(), Some("gate rejected"));
    }

    #[cfg(feature = "sqlite-store")]
    #[test]
    fn test_sqlite_missing_row_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_deployment("dep-x").unwrap().is_none());
    }
}
