//! Test-only executors and fixtures for driving runs deterministically.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::io::clock::ManualClock;
use crate::io::executor::{TaskExecutor, TaskRequest};
use crate::runner::ProcessRunnerBuilder;
use crate::ProcessRunner;

/// Executor that replays a scripted sequence of outcomes and counts calls.
///
/// Once the script runs out, the last outcome repeats.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<Value, String>>>,
    last: Mutex<Option<Result<Value, String>>>,
    calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<Value, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        })
    }

    /// Always succeed with `output`.
    pub fn always(output: Value) -> Arc<Self> {
        Self::new(vec![Ok(output)])
    }

    /// Fail `failures` times, then succeed with `output`.
    pub fn failing_then(failures: usize, output: Value) -> Arc<Self> {
        let mut script: Vec<Result<Value, String>> = (1..=failures)
            .map(|n| Err(format!("scripted failure {n}")))
            .collect();
        script.push(Ok(output));
        Self::new(script)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn execute(&self, _request: &TaskRequest<'_>) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().map_err(|_| anyhow!("script lock poisoned"))?;
        let mut last = self.last.lock().map_err(|_| anyhow!("script lock poisoned"))?;
        let next = match script.pop_front() {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .ok_or_else(|| anyhow!("scripted executor has no outcomes"))?,
        };
        next.map_err(|message| anyhow!(message))
    }
}

/// Object schema requiring `required`, each of any type.
pub fn object_schema(required: &[&str]) -> Value {
    json!({
        "type": "object",
        "required": required,
    })
}

pub fn fixed_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH))
}

/// A temporary state directory for filesystem-backed runners.
pub struct TestState {
    temp: TempDir,
}

impl TestState {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Builder over this state directory with a fixed clock.
    pub fn builder(&self) -> ProcessRunnerBuilder {
        ProcessRunner::builder()
            .state_dir(self.path())
            .expect("state dir")
            .clock(fixed_clock())
    }
}

impl Default for TestState {
    fn default() -> Self {
        Self::new()
    }
}
