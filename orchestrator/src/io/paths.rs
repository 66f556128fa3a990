//! Canonical on-disk layout of a state directory.

use std::path::{Path, PathBuf};

use crate::core::types::{EffectId, RunId};

/// Top-level paths of a state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.toml"),
            runs_dir: root.join("runs"),
            root,
        }
    }

    pub fn run(&self, run_id: &RunId) -> RunPaths {
        RunPaths::new(&self.runs_dir, run_id)
    }
}

/// Paths owned by one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub run_path: PathBuf,
    pub events_path: PathBuf,
    pub tasks_dir: PathBuf,
    /// One marker file per pending effect; the index behind pending listings.
    pub pending_dir: PathBuf,
    /// Held for a whole start/resume invocation.
    pub run_lock_path: PathBuf,
    /// Held around each conditional write of records and events.
    pub store_lock_path: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &RunId) -> Self {
        let dir = runs_dir.join(run_id.as_str());
        Self {
            run_path: dir.join("run.json"),
            events_path: dir.join("events.jsonl"),
            tasks_dir: dir.join("tasks"),
            pending_dir: dir.join("pending"),
            run_lock_path: dir.join(".run.lock"),
            store_lock_path: dir.join(".store.lock"),
            dir,
        }
    }

    pub fn pending_marker(&self, effect_id: &EffectId) -> PathBuf {
        self.pending_dir.join(effect_id.as_str())
    }

    pub fn effect(&self, effect_id: &EffectId) -> EffectPaths {
        EffectPaths::new(&self.tasks_dir, effect_id)
    }
}

/// Artifacts of one effect. External executors read `input.json` and write
/// `result.json`; `effect.json` is the journal record itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
    pub input_path: PathBuf,
    pub result_path: PathBuf,
    pub prompt_path: PathBuf,
    pub executor_log_path: PathBuf,
}

impl EffectPaths {
    pub fn new(tasks_dir: &Path, effect_id: &EffectId) -> Self {
        let dir = tasks_dir.join(effect_id.as_str());
        Self {
            record_path: dir.join("effect.json"),
            input_path: dir.join("input.json"),
            result_path: dir.join("result.json"),
            prompt_path: dir.join("prompt.md"),
            executor_log_path: dir.join("executor.log"),
            dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_paths_are_derived_from_run_and_effect_ids() {
        let state = StatePaths::new("/state");
        let run = state.run(&RunId::from("run-1"));
        let effect = run.effect(&EffectId::from_ordinal(3));

        assert_eq!(state.config_path, Path::new("/state/config.toml"));
        assert_eq!(run.run_path, Path::new("/state/runs/run-1/run.json"));
        assert_eq!(run.events_path, Path::new("/state/runs/run-1/events.jsonl"));
        assert_eq!(
            effect.input_path,
            Path::new("/state/runs/run-1/tasks/ef-000003/input.json")
        );
        assert_eq!(
            effect.result_path,
            Path::new("/state/runs/run-1/tasks/ef-000003/result.json")
        );
        assert!(effect.record_path.ends_with("ef-000003/effect.json"));
        assert_eq!(
            run.pending_marker(&EffectId::from_ordinal(3)),
            Path::new("/state/runs/run-1/pending/ef-000003")
        );
        assert!(run.run_lock_path.starts_with(&run.dir));
        assert_ne!(run.run_lock_path, run.store_lock_path);
    }
}
