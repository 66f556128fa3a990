//! Effect journal: the durable, write-once store of effect records.
//!
//! Records are keyed by `(run_id, effect_id)`. Backends must make `put` atomic
//! per key and apply [`check_put`] so a settled record is never overwritten.
//! Writers on different runs never coordinate.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::transition::{check_put, reopen};
use crate::core::types::{BreakpointRecord, EffectId, EffectRecord, EffectStatus, RunId};
use crate::error::{OrchestratorError, Result};
use crate::io::paths::EffectPaths;

pub trait EffectJournal: Send + Sync {
    fn get(&self, run_id: &RunId, effect_id: &EffectId) -> Result<Option<EffectRecord>>;

    /// Insert or transition a record. Rejects overwriting a settled record.
    fn put(&self, run_id: &RunId, record: &EffectRecord) -> Result<()>;

    /// All records of a run in ordinal order.
    fn list(&self, run_id: &RunId) -> Result<Vec<EffectRecord>>;

    /// Runs that have at least one journaled effect.
    fn run_ids(&self) -> Result<Vec<RunId>>;

    /// Move a `failed` record back to `pending` for operator remediation.
    fn reopen(&self, run_id: &RunId, effect_id: &EffectId) -> Result<EffectRecord>;

    /// Filesystem artifacts of an effect, when the backend has any.
    fn artifacts(&self, _run_id: &RunId, _effect_id: &EffectId) -> Option<EffectPaths> {
        None
    }

    /// Pending effects of one run, or of every run when `run_id` is `None`.
    fn list_pending(&self, run_id: Option<&RunId>) -> Result<Vec<(RunId, EffectRecord)>> {
        let run_ids = match run_id {
            Some(run_id) => vec![run_id.clone()],
            None => self.run_ids()?,
        };
        let mut pending = Vec::new();
        for run_id in run_ids {
            for record in self.list(&run_id)? {
                if record.status == EffectStatus::Pending {
                    pending.push((run_id.clone(), record));
                }
            }
        }
        Ok(pending)
    }

    /// Unresolved breakpoints, for tooling that resolves checkpoints.
    fn list_pending_breakpoints(&self, run_id: Option<&RunId>) -> Result<Vec<BreakpointRecord>> {
        Ok(self
            .list_pending(run_id)?
            .iter()
            .filter_map(|(run_id, record)| BreakpointRecord::from_effect(run_id, record))
            .collect())
    }
}

type RunRecords = Arc<Mutex<BTreeMap<u64, EffectRecord>>>;

/// In-memory journal for tests and embedding.
///
/// The outer map is only write-locked to add a run; each run's records sit
/// behind their own mutex, so writers on different runs do not wait on each
/// other.
#[derive(Default)]
pub struct MemoryJournal {
    runs: RwLock<HashMap<RunId, RunRecords>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self, run_id: &RunId) -> Result<Option<RunRecords>> {
        Ok(self.runs.read().map_err(poisoned)?.get(run_id).cloned())
    }

    fn records_or_insert(&self, run_id: &RunId) -> Result<RunRecords> {
        if let Some(records) = self.records(run_id)? {
            return Ok(records);
        }
        let mut runs = self.runs.write().map_err(poisoned)?;
        Ok(Arc::clone(runs.entry(run_id.clone()).or_default()))
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> OrchestratorError {
    OrchestratorError::Storage(anyhow::anyhow!("journal lock poisoned: {err}"))
}

impl EffectJournal for MemoryJournal {
    fn get(&self, run_id: &RunId, effect_id: &EffectId) -> Result<Option<EffectRecord>> {
        let Some(records) = self.records(run_id)? else {
            return Ok(None);
        };
        let records = records.lock().map_err(poisoned)?;
        Ok(records.get(&effect_id.ordinal()).cloned())
    }

    fn put(&self, run_id: &RunId, record: &EffectRecord) -> Result<()> {
        let records = self.records_or_insert(run_id)?;
        let mut records = records.lock().map_err(poisoned)?;
        check_put(run_id, records.get(&record.ordinal), record)?;
        records.insert(record.ordinal, record.clone());
        Ok(())
    }

    fn list(&self, run_id: &RunId) -> Result<Vec<EffectRecord>> {
        let Some(records) = self.records(run_id)? else {
            return Ok(Vec::new());
        };
        let records = records.lock().map_err(poisoned)?;
        Ok(records.values().cloned().collect())
    }

    fn run_ids(&self) -> Result<Vec<RunId>> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn reopen(&self, run_id: &RunId, effect_id: &EffectId) -> Result<EffectRecord> {
        let not_found =
            || OrchestratorError::InvalidState(format!("effect {effect_id} not found in run {run_id}"));
        let records = self.records(run_id)?.ok_or_else(not_found)?;
        let mut records = records.lock().map_err(poisoned)?;
        let record = records.get_mut(&effect_id.ordinal()).ok_or_else(not_found)?;
        reopen(run_id, record)?;
        Ok(record.clone())
    }
}
