//! Run records and the per-run event log.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{RunId, RunRecord};
use crate::error::{OrchestratorError, Result};
use crate::io::locks::{KeyedLocks, RunLock};

/// One entry of a run's append-only audit log (`events.jsonl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sequential per run, starting at 1.
    pub id: u64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

pub const RUN_CREATED: &str = "RUN_CREATED";
pub const RUN_RESUMED: &str = "RUN_RESUMED";
pub const RUN_SUSPENDED: &str = "RUN_SUSPENDED";
pub const RUN_COMPLETED: &str = "RUN_COMPLETED";
pub const RUN_FAILED: &str = "RUN_FAILED";
pub const EFFECT_REQUESTED: &str = "EFFECT_REQUESTED";
pub const EFFECT_COMPLETED: &str = "EFFECT_COMPLETED";
pub const EFFECT_ATTEMPT_FAILED: &str = "EFFECT_ATTEMPT_FAILED";
pub const EFFECT_FAILED: &str = "EFFECT_FAILED";
pub const BREAKPOINT_REQUESTED: &str = "BREAKPOINT_REQUESTED";
pub const BREAKPOINT_RESOLVED: &str = "BREAKPOINT_RESOLVED";

/// Event type for an event name (`run`, `effect` or `breakpoint`).
pub fn event_type(event: &str) -> &'static str {
    if event.starts_with("RUN_") {
        "run"
    } else if event.starts_with("BREAKPOINT_") {
        "breakpoint"
    } else {
        "effect"
    }
}

/// Storage of runner-owned run state plus the audit log.
pub trait RunStore: Send + Sync {
    /// Persist a new run; fails if the id is taken.
    fn create(&self, run: &RunRecord) -> Result<()>;

    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>>;

    fn save(&self, run: &RunRecord) -> Result<()>;

    /// All runs ordered by run id.
    fn list(&self) -> Result<Vec<RunRecord>>;

    /// Take the single-writer lock of a run, blocking until it is free.
    ///
    /// Held by the runner for a whole start/resume invocation. Must exclude
    /// every other writer that can reach the same storage.
    fn lock_run(&self, run_id: &RunId) -> Result<RunLock<'_>>;

    /// Append an audit event and return its sequential id.
    fn append_event(
        &self,
        run_id: &RunId,
        event: &str,
        data: Value,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>>;
}

#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<RunId, RunRecord>>,
    events: RwLock<HashMap<RunId, Vec<RunEvent>>>,
    locks: KeyedLocks,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> OrchestratorError {
    OrchestratorError::Storage(anyhow::anyhow!("run store lock poisoned: {err}"))
}

impl RunStore for MemoryRunStore {
    fn create(&self, run: &RunRecord) -> Result<()> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        if runs.contains_key(&run.run_id) {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().map_err(poisoned)?.get(run_id).cloned())
    }

    fn save(&self, run: &RunRecord) -> Result<()> {
        self.runs
            .write()
            .map_err(poisoned)?
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self.runs.read().map_err(poisoned)?.values().cloned().collect();
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    fn lock_run(&self, run_id: &RunId) -> Result<RunLock<'_>> {
        Ok(RunLock::Local {
            _guard: self.locks.lock(run_id.as_str()),
        })
    }

    fn append_event(
        &self,
        run_id: &RunId,
        event: &str,
        data: Value,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut events = self.events.write().map_err(poisoned)?;
        let log = events.entry(run_id.clone()).or_default();
        let id = log.len() as u64 + 1;
        log.push(RunEvent {
            timestamp: at,
            event_type: event_type(event).to_string(),
            id,
            event: event.to_string(),
            data,
        });
        Ok(id)
    }

    fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        Ok(self
            .events
            .read()
            .map_err(poisoned)?
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
