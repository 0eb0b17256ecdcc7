//! # Module: telemetry
//!
//! ## Responsibility
//! Tool-execution records, the [`TelemetrySource`] seam the analyzer reads
//! through, and [`TelemetryLog`], a bounded in-process ring that can be
//! loaded from a JSONL file.
//!
//! ## NOT Responsible For
//! - Transport (the event bus that delivers records is external)
//! - Aggregation (see `analysis::analyzer`)

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, TelemetryError};

/// One observed tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_id: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    pub timestamp_ms: u64,
}

impl ToolExecutionRecord {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.tool_id.trim().is_empty() {
            return Err(ModelError::schema("telemetry record", &self.tool_id, "tool_id must not be empty"));
        }
        Ok(())
    }
}

/// Anything that can hand the analyzer a snapshot of recent executions.
pub trait TelemetrySource: Send + Sync {
    fn records(&self) -> Vec<ToolExecutionRecord>;
}

impl TelemetrySource for Vec<ToolExecutionRecord> {
    fn records(&self) -> Vec<ToolExecutionRecord> {
        self.clone()
    }
}

// ---------------------------------------------------------------------------
// TelemetryLog
// ---------------------------------------------------------------------------

/// Bounded ring of recent records.  Oldest records are evicted first.
#[derive(Debug)]
pub struct TelemetryLog {
    capacity: usize,
    inner: Mutex<VecDeque<ToolExecutionRecord>>,
}

impl TelemetryLog {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))) }
    }

    /// Append a record.  Records failing validation are dropped with a warning.
    pub fn record(&self, record: ToolExecutionRecord) {
        if let Err(e) = record.validate() {
            tracing::warn!(target: "evolution::telemetry", error = %e, "dropping invalid telemetry record");
            return;
        }
        if let Ok(mut q) = self.inner.lock() {
            if q.len() >= self.capacity {
                q.pop_front();
            }
            q.push_back(record);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut q) = self.inner.lock() {
            q.clear();
        }
    }

    /// Parse one JSON object per line.  Blank lines and `#` comments are
    /// skipped; a malformed line fails the whole load with its line number.
    pub fn from_reader(reader: impl BufRead, capacity: usize) -> Result<Self, TelemetryError> {
        let log = Self::new(capacity);
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let record: ToolExecutionRecord = serde_json::from_str(trimmed)
                .map_err(|source| TelemetryError::Malformed { line: idx + 1, source })?;
            log.record(record);
        }
        tracing::debug!(target: "evolution::telemetry", records = log.len(), "telemetry loaded");
        Ok(log)
    }

    pub fn from_jsonl(path: impl AsRef<Path>, capacity: usize) -> Result<Self, TelemetryError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), capacity)
    }
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl TelemetrySource for TelemetryLog {
    fn records(&self) -> Vec<ToolExecutionRecord> {
        self.inner.lock().map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }
}
