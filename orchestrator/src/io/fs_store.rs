//! Filesystem-backed journal and run store under a state directory.
//!
//! Every record write is atomic (temp file + rename) and happens under the
//! run's store lock file (`runs/<run>/.store.lock`), which makes
//! check-then-write conditional per `(run_id, effect_id)` across threads and
//! processes sharing the directory. Other runs never contend. Pending effects
//! are indexed by marker files in `runs/<run>/pending/`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::core::transition::{check_put, reopen};
use crate::core::types::{EffectId, EffectRecord, EffectStatus, RunId, RunRecord};
use crate::error::{OrchestratorError, Result};
use crate::io::journal::EffectJournal;
use crate::io::locks::{FileLock, RunLock};
use crate::io::paths::{EffectPaths, RunPaths, StatePaths};
use crate::io::run_store::{RunEvent, RunStore, event_type};
use crate::io::{read_json, read_json_if_exists, write_atomic, write_json_atomic};

pub struct FsJournal {
    paths: StatePaths,
}

impl FsJournal {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            paths: open_state(root)?,
        })
    }

    fn effect_paths(&self, run_id: &RunId, effect_id: &EffectId) -> EffectPaths {
        self.paths.run(run_id).effect(effect_id)
    }
}

impl EffectJournal for FsJournal {
    fn get(&self, run_id: &RunId, effect_id: &EffectId) -> Result<Option<EffectRecord>> {
        let paths = self.effect_paths(run_id, effect_id);
        Ok(read_json_if_exists(&paths.record_path)?)
    }

    fn put(&self, run_id: &RunId, record: &EffectRecord) -> Result<()> {
        let run_paths = self.paths.run(run_id);
        let _lock = FileLock::acquire(&run_paths.store_lock_path)?;
        let paths = run_paths.effect(&record.effect_id);
        let existing: Option<EffectRecord> = read_json_if_exists(&paths.record_path)?;
        check_put(run_id, existing.as_ref(), record)?;

        if existing.is_none() {
            write_json_atomic(&paths.input_path, &record.input)?;
        }
        if record.status == EffectStatus::Completed
            && let Some(output) = &record.output
        {
            write_json_atomic(&paths.result_path, output)?;
        }
        // Markers are a superset of pending records: set before the commit,
        // cleared after it.
        if record.status == EffectStatus::Pending {
            mark_pending(&run_paths, &record.effect_id)?;
        }
        // The record is written last; it is the commit point for the effect.
        write_json_atomic(&paths.record_path, record)?;
        if record.status.is_settled() {
            clear_pending(&run_paths, &record.effect_id)?;
        }
        debug!(run_id = %run_id, effect_id = %record.effect_id, status = %record.status, "journaled effect");
        Ok(())
    }

    fn list(&self, run_id: &RunId) -> Result<Vec<EffectRecord>> {
        let tasks_dir = self.paths.run(run_id).tasks_dir;
        let mut records = Vec::new();
        for dir in list_dirs(&tasks_dir)? {
            let record_path = dir.join("effect.json");
            if let Some(record) = read_json_if_exists::<EffectRecord>(&record_path)? {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.ordinal);
        Ok(records)
    }

    fn run_ids(&self) -> Result<Vec<RunId>> {
        let mut ids: Vec<RunId> = list_dirs(&self.paths.runs_dir)?
            .into_iter()
            .filter(|dir| dir.join("tasks").is_dir())
            .filter_map(|dir| dir_name(&dir).map(RunId::new))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn reopen(&self, run_id: &RunId, effect_id: &EffectId) -> Result<EffectRecord> {
        let run_paths = self.paths.run(run_id);
        let _lock = FileLock::acquire(&run_paths.store_lock_path)?;
        let paths = run_paths.effect(effect_id);
        let mut record: EffectRecord = read_json_if_exists(&paths.record_path)?.ok_or_else(|| {
            OrchestratorError::InvalidState(format!("effect {effect_id} not found in run {run_id}"))
        })?;
        reopen(run_id, &mut record)?;
        mark_pending(&run_paths, effect_id)?;
        write_json_atomic(&paths.record_path, &record)?;
        Ok(record)
    }

    fn artifacts(&self, run_id: &RunId, effect_id: &EffectId) -> Option<EffectPaths> {
        Some(self.effect_paths(run_id, effect_id))
    }

    /// Served from the pending markers; only marked effects are read.
    fn list_pending(&self, run_id: Option<&RunId>) -> Result<Vec<(RunId, EffectRecord)>> {
        let run_ids = match run_id {
            Some(run_id) => vec![run_id.clone()],
            None => self.run_ids()?,
        };
        let mut pending = Vec::new();
        for run_id in run_ids {
            let mut records = Vec::new();
            for name in list_file_names(&self.paths.run(&run_id).pending_dir)? {
                let Some(effect_id) = EffectId::parse(&name) else {
                    continue;
                };
                // A marker can outlive its record's settlement by a crash.
                if let Some(record) = self.get(&run_id, &effect_id)?
                    && record.status == EffectStatus::Pending
                {
                    records.push(record);
                }
            }
            records.sort_by_key(|record| record.ordinal);
            pending.extend(records.into_iter().map(|record| (run_id.clone(), record)));
        }
        Ok(pending)
    }
}

pub struct FsRunStore {
    paths: StatePaths,
}

impl FsRunStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            paths: open_state(root)?,
        })
    }
}

impl RunStore for FsRunStore {
    fn create(&self, run: &RunRecord) -> Result<()> {
        let paths = self.paths.run(&run.run_id);
        let _lock = FileLock::acquire(&paths.store_lock_path)?;
        if paths.run_path.exists() {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        write_json_atomic(&paths.run_path, run)?;
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(read_json_if_exists(&self.paths.run(run_id).run_path)?)
    }

    fn save(&self, run: &RunRecord) -> Result<()> {
        let paths = self.paths.run(&run.run_id);
        let _lock = FileLock::acquire(&paths.store_lock_path)?;
        write_json_atomic(&paths.run_path, run)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for dir in list_dirs(&self.paths.runs_dir)? {
            let run_path = dir.join("run.json");
            if run_path.is_file() {
                runs.push(read_json::<RunRecord>(&run_path)?);
            }
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    fn lock_run(&self, run_id: &RunId) -> Result<RunLock<'_>> {
        let lock = FileLock::acquire(&self.paths.run(run_id).run_lock_path)?;
        Ok(RunLock::File { _lock: lock })
    }

    fn append_event(
        &self,
        run_id: &RunId,
        event: &str,
        data: Value,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let paths = self.paths.run(run_id);
        let _lock = FileLock::acquire(&paths.store_lock_path)?;
        let id = count_lines(&paths.events_path)? + 1;
        let entry = RunEvent {
            timestamp: at,
            event_type: event_type(event).to_string(),
            id,
            event: event.to_string(),
            data,
        };
        append_line(&paths.events_path, &serde_json::to_string(&entry).context("serialize event")?)?;
        Ok(id)
    }

    fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        let events_path = self.paths.run(run_id).events_path;
        if !events_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&events_path)
            .with_context(|| format!("open {}", events_path.display()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("read {}", events_path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(&line)
                .with_context(|| format!("parse event in {}", events_path.display()))?;
            events.push(event);
        }
        Ok(events)
    }
}

fn open_state(root: impl Into<PathBuf>) -> anyhow::Result<StatePaths> {
    let paths = StatePaths::new(root);
    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    Ok(paths)
}

fn mark_pending(run_paths: &RunPaths, effect_id: &EffectId) -> anyhow::Result<()> {
    write_atomic(&run_paths.pending_marker(effect_id), effect_id.as_str())
}

fn clear_pending(run_paths: &RunPaths, effect_id: &EffectId) -> anyhow::Result<()> {
    let marker = run_paths.pending_marker(effect_id);
    match fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", marker.display())),
    }
}

fn list_file_names(path: &Path) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", path.display()))?;
        if entry.path().is_file()
            && let Some(name) = dir_name(&entry.path())
        {
            names.push(name);
        }
    }
    Ok(names)
}

fn list_dirs(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", path.display()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

fn count_lines(path: &Path) -> anyhow::Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut count = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))
}
