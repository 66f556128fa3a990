//! Process runner: drives process functions to completion or suspension.
//!
//! Every `start`/`resume` re-invokes the process function from the top under
//! the run's keyed lock. Journaled effects replay instantly; execution goes
//! live from the first unsettled effect. A run's status and output are the
//! runner's to own; the journal only ever sees effect records.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::breakpoint::{BreakpointController, ResolveOutcome};
use crate::context::{Engine, Flow, Interrupt, RunContext};
use crate::core::retry::RetryPolicy;
use crate::core::task::TaskDefinition;
use crate::core::types::{
    BreakpointRecord, EffectId, EffectRecord, EffectStatus, RunFailure, RunId, RunRecord, RunStatus,
};
use crate::error::{OrchestratorError, Result};
use crate::io::clock::{Clock, SystemClock};
use crate::io::config::{OrchestratorConfig, load_config};
use crate::io::fs_store::{FsJournal, FsRunStore};
use crate::io::journal::{EffectJournal, MemoryJournal};
use crate::io::paths::StatePaths;
use crate::io::run_store::{
    MemoryRunStore, RUN_COMPLETED, RUN_CREATED, RUN_FAILED, RUN_RESUMED, RUN_SUSPENDED, RunEvent,
    RunStore,
};
use crate::registry::TaskRegistry;

type ProcessFn = dyn Fn(&mut RunContext<'_>, &Value) -> Flow<Value> + Send + Sync;

/// A named process function plus the tasks it declares.
pub struct ProcessDefinition {
    id: String,
    tasks: Vec<String>,
    body: Box<ProcessFn>,
}

impl ProcessDefinition {
    pub fn new<F>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut RunContext<'_>, &Value) -> Flow<Value> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            tasks: Vec::new(),
            body: Box::new(body),
        }
    }

    /// Declare task names this process calls; checked against the registry at build time.
    pub fn uses<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks.extend(tasks.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Terminal or suspended result of one `start`/`resume` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    Suspended { breakpoint_id: EffectId },
    Failed(RunFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            RunOutcome::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn suspended_on(&self) -> Option<&EffectId> {
        match &self.outcome {
            RunOutcome::Suspended { breakpoint_id } => Some(breakpoint_id),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match &self.outcome {
            RunOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.outcome {
            RunOutcome::Completed(_) => RunStatus::Completed,
            RunOutcome::Suspended { .. } => RunStatus::Suspended,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }
}

pub struct ProcessRunner {
    journal: Arc<dyn EffectJournal>,
    runs: Arc<dyn RunStore>,
    registry: TaskRegistry,
    processes: BTreeMap<String, ProcessDefinition>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

/// Wiring for a [`ProcessRunner`]; defaults to in-memory stores.
#[derive(Default)]
pub struct ProcessRunnerBuilder {
    journal: Option<Arc<dyn EffectJournal>>,
    runs: Option<Arc<dyn RunStore>>,
    registry: TaskRegistry,
    command_tasks: Vec<TaskDefinition>,
    processes: Vec<ProcessDefinition>,
    clock: Option<Arc<dyn Clock>>,
    retry: Option<RetryPolicy>,
    config: OrchestratorConfig,
}

impl ProcessRunnerBuilder {
    /// Use the filesystem stores and `config.toml` under `state_dir`.
    pub fn state_dir(mut self, state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        let paths = StatePaths::new(state_dir);
        self.config = load_config(&paths.config_path)
            .map_err(|err| OrchestratorError::Configuration(format!("{err:#}")))?;
        self.journal = Some(Arc::new(FsJournal::open(state_dir)?));
        self.runs = Some(Arc::new(FsRunStore::open(state_dir)?));
        Ok(self)
    }

    pub fn journal(mut self, journal: Arc<dyn EffectJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register an `agent`/`skill` task against the configured command at build time.
    pub fn command_task(mut self, definition: TaskDefinition) -> Self {
        self.command_tasks.push(definition);
        self
    }

    pub fn process(mut self, process: ProcessDefinition) -> Self {
        self.processes.push(process);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the retry policy from `config.toml`.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<ProcessRunner> {
        let mut registry = self.registry;
        for definition in self.command_tasks {
            registry.register_command(definition, &self.config.executors)?;
        }

        let retry = self.retry.unwrap_or(self.config.retry);
        retry.validate().map_err(OrchestratorError::Configuration)?;

        let mut processes = BTreeMap::new();
        for process in self.processes {
            if let Some(task) = process.tasks.iter().find(|task| !registry.contains(task)) {
                return Err(OrchestratorError::Configuration(format!(
                    "process '{}' uses unregistered task '{task}' (registered: {})",
                    process.id,
                    registry.names().collect::<Vec<_>>().join(", ")
                )));
            }
            if processes.contains_key(&process.id) {
                return Err(OrchestratorError::Configuration(format!(
                    "process '{}' is already defined",
                    process.id
                )));
            }
            processes.insert(process.id.clone(), process);
        }

        Ok(ProcessRunner {
            journal: self.journal.unwrap_or_else(|| Arc::new(MemoryJournal::new())),
            runs: self.runs.unwrap_or_else(|| Arc::new(MemoryRunStore::new())),
            registry,
            processes,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            retry,
        })
    }
}

impl ProcessRunner {
    pub fn builder() -> ProcessRunnerBuilder {
        ProcessRunnerBuilder::default()
    }

    /// Create a run and drive it until it completes, suspends or fails.
    #[instrument(skip_all, fields(process_id = %process_id))]
    pub fn start(&self, process_id: &str, input: Value) -> Result<RunReport> {
        let process = self.process(process_id)?;
        let now = self.clock.now();
        let run = self.create_run(process_id, input, now)?;
        let _lock = self.runs.lock_run(&run.run_id)?;
        self.runs.append_event(
            &run.run_id,
            RUN_CREATED,
            json!({"process_id": process_id}),
            now,
        )?;
        info!(run_id = %run.run_id, process_id, "run created");
        self.drive(process, run)
    }

    /// Replay a run from the top and continue live from the first unsettled effect.
    ///
    /// A completed run returns its stored output without invoking anything. A
    /// failed run has its failed effects reopened first, so it restarts at the
    /// failing effect.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn resume(&self, run_id: &RunId) -> Result<RunReport> {
        // Locking creates the run directory, so unknown runs are rejected first.
        self.status(run_id)?;
        let _lock = self.runs.lock_run(run_id)?;
        let run = self.status(run_id)?;
        let process = self.process(&run.process_id)?;

        match run.status {
            RunStatus::Completed => {
                debug!(run_id = %run_id, "run already completed");
                return Ok(RunReport {
                    run_id: run.run_id,
                    outcome: RunOutcome::Completed(run.output.unwrap_or(Value::Null)),
                });
            }
            RunStatus::Failed => {
                for record in self.journal.list(run_id)? {
                    if record.status == EffectStatus::Failed {
                        info!(run_id = %run_id, effect_id = %record.effect_id, "reopening failed effect");
                        self.journal.reopen(run_id, &record.effect_id)?;
                    }
                }
            }
            RunStatus::Running | RunStatus::Suspended => {}
        }

        self.runs.append_event(
            run_id,
            RUN_RESUMED,
            json!({"previous_status": run.status}),
            self.clock.now(),
        )?;
        self.drive(process, run)
    }

    pub fn status(&self, run_id: &RunId) -> Result<RunRecord> {
        self.runs
            .load(run_id)?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))
    }

    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        self.runs.list()
    }

    pub fn effects(&self, run_id: &RunId) -> Result<Vec<EffectRecord>> {
        self.journal.list(run_id)
    }

    pub fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        self.runs.events(run_id)
    }

    pub fn list_pending_breakpoints(&self, run_id: Option<&RunId>) -> Result<Vec<BreakpointRecord>> {
        self.breakpoints().list_pending(run_id)
    }

    /// Record a breakpoint decision. Does not resume the run.
    pub fn resolve(
        &self,
        run_id: &RunId,
        breakpoint_id: &EffectId,
        resolution: Value,
    ) -> Result<ResolveOutcome> {
        self.breakpoints().resolve(run_id, breakpoint_id, resolution)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    fn breakpoints(&self) -> BreakpointController<'_> {
        BreakpointController::new(self.journal.as_ref(), self.runs.as_ref(), self.clock.as_ref())
    }

    fn process(&self, process_id: &str) -> Result<&ProcessDefinition> {
        self.processes
            .get(process_id)
            .ok_or_else(|| OrchestratorError::ProcessNotFound(process_id.to_string()))
    }

    fn create_run(&self, process_id: &str, input: Value, now: DateTime<Utc>) -> Result<RunRecord> {
        const MAX_ID_ATTEMPTS: u32 = 5;
        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let run = RunRecord::new(new_run_id(now), process_id, input.clone(), now);
            match self.runs.create(&run) {
                Ok(()) => return Ok(run),
                Err(OrchestratorError::InvalidState(message)) => {
                    debug!(message, "run id collision");
                    last_err = Some(OrchestratorError::InvalidState(message));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            OrchestratorError::InvalidState("could not allocate a run id".to_string())
        }))
    }

    fn drive(&self, process: &ProcessDefinition, mut run: RunRecord) -> Result<RunReport> {
        run.status = RunStatus::Running;
        run.invocations += 1;
        run.waiting_on = None;
        run.failure = None;
        run.updated_at = self.clock.now();
        self.runs.save(&run)?;

        let journaled = self
            .journal
            .list(&run.run_id)?
            .last()
            .map_or(0, |record| record.ordinal);
        let engine = Engine {
            journal: self.journal.as_ref(),
            runs: self.runs.as_ref(),
            registry: &self.registry,
            clock: self.clock.as_ref(),
            retry: &self.retry,
        };
        let mut ctx = RunContext::new(engine, run.run_id.clone(), journaled);
        let result = (process.body)(&mut ctx, &run.input);
        let consumed = ctx.consumed();
        // An interrupt the process discarded still settles the invocation.
        let result = match ctx.into_halt() {
            Some(halt) => Err(halt),
            None => result,
        };

        let result = match result {
            Ok(output) => self.check_complete(&run.run_id, consumed).map(|()| output),
            Err(Interrupt::Fail(err)) => Err(err),
            Err(Interrupt::Suspend(breakpoint_id)) => {
                return self.finish_suspended(run, breakpoint_id);
            }
        };

        let now = self.clock.now();
        run.updated_at = now;
        let outcome = match result {
            Ok(output) => {
                run.status = RunStatus::Completed;
                run.output = Some(output.clone());
                self.runs.save(&run)?;
                self.runs.append_event(&run.run_id, RUN_COMPLETED, json!({}), now)?;
                info!(run_id = %run.run_id, invocations = run.invocations, "run completed");
                RunOutcome::Completed(output)
            }
            Err(err) => {
                let effect_id = if err.is_retryable() {
                    self.last_failed_effect(&run.run_id)?
                } else {
                    None
                };
                let failure = err.to_run_failure(effect_id);
                warn!(run_id = %run.run_id, kind = ?failure.kind, err = %failure.message, "run failed");
                run.status = RunStatus::Failed;
                run.failure = Some(failure.clone());
                self.runs.save(&run)?;
                self.runs.append_event(
                    &run.run_id,
                    RUN_FAILED,
                    json!({"kind": failure.kind, "effect_id": failure.effect_id, "error": failure.message}),
                    now,
                )?;
                RunOutcome::Failed(failure)
            }
        };
        Ok(RunReport {
            run_id: run.run_id,
            outcome,
        })
    }

    fn finish_suspended(&self, mut run: RunRecord, breakpoint_id: EffectId) -> Result<RunReport> {
        let now = self.clock.now();
        run.status = RunStatus::Suspended;
        run.waiting_on = Some(breakpoint_id.clone());
        run.updated_at = now;
        self.runs.save(&run)?;
        self.runs.append_event(
            &run.run_id,
            RUN_SUSPENDED,
            json!({"breakpoint_id": breakpoint_id}),
            now,
        )?;
        info!(run_id = %run.run_id, breakpoint_id = %breakpoint_id, "run suspended");
        Ok(RunReport {
            run_id: run.run_id,
            outcome: RunOutcome::Suspended { breakpoint_id },
        })
    }

    fn last_failed_effect(&self, run_id: &RunId) -> Result<Option<EffectId>> {
        Ok(self
            .journal
            .list(run_id)?
            .into_iter()
            .rev()
            .find(|record| record.status == EffectStatus::Failed)
            .map(|record| record.effect_id))
    }

    /// A process that returns must have consumed every journaled effect.
    fn check_complete(&self, run_id: &RunId, consumed: u64) -> Result<()> {
        let extra = self
            .journal
            .list(run_id)?
            .into_iter()
            .find(|record| record.ordinal > consumed);
        match extra {
            Some(record) => Err(OrchestratorError::ReplayMismatch {
                run_id: run_id.clone(),
                effect_id: record.effect_id.clone(),
                expected: record.kind.label(),
                actual: "process returned".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// `run-YYYYmmdd-HHMMSS-xxxxxx` with a random lowercase suffix.
fn new_run_id(now: DateTime<Utc>) -> RunId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    RunId::new(format!("run-{}-{suffix}", now.format("%Y%m%d-%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskPayload;
    use crate::io::executor::TaskRequest;

    fn schema() -> Value {
        json!({"type": "object"})
    }

    fn echo(_: &TaskRequest<'_>) -> anyhow::Result<Value> {
        Ok(json!({}))
    }

    #[test]
    fn run_ids_have_timestamp_and_suffix() {
        let now = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .expect("parse")
            .with_timezone(&Utc);
        let id = new_run_id(now);
        let suffix = id
            .as_str()
            .strip_prefix("run-20260304-050607-")
            .expect("prefix");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn build_rejects_unregistered_tasks_and_duplicate_processes() {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn(
                TaskDefinition::function("B", json!({"type": "object"})),
                |_: &TaskRequest<'_>| Ok(json!({})),
            )
            .expect("register");
        let err = ProcessRunner::builder()
            .registry(registry)
            .process(ProcessDefinition::new("p", |_, input| Ok(input.clone())).uses(["A"]))
            .build()
            .err()
            .expect("unregistered");
        assert!(err.to_string().contains("unregistered task 'A' (registered: B)"));

        let err = ProcessRunner::builder()
            .process(ProcessDefinition::new("p", |_, input| Ok(input.clone())))
            .process(ProcessDefinition::new("p", |_, input| Ok(input.clone())))
            .build()
            .err()
            .expect("duplicate");
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[test]
    fn unknown_process_and_run_are_reported() {
        let runner = ProcessRunner::builder().build().expect("build");
        assert!(matches!(
            runner.start("missing", json!({})),
            Err(OrchestratorError::ProcessNotFound(_))
        ));
        assert!(matches!(
            runner.resume(&RunId::from("run-x")),
            Err(OrchestratorError::RunNotFound(_))
        ));
    }

    #[test]
    fn extra_journaled_effects_are_a_replay_mismatch() {
        let a = TaskDefinition::function("A", schema());
        let mut registry = TaskRegistry::new();
        registry.register_fn(a.clone(), echo).expect("register");
        let runs: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let journal: Arc<dyn EffectJournal> = Arc::new(MemoryJournal::new());

        let first = ProcessRunner::builder()
            .journal(journal.clone())
            .run_store(runs.clone())
            .process(ProcessDefinition::new("p", move |ctx, _| {
                ctx.task(&a, TaskPayload::function(json!({})))?;
                ctx.task(&a, TaskPayload::function(json!({"second": true})))?;
                ctx.breakpoint(crate::core::types::BreakpointSpec::new("ok?"))
            }))
            .registry(registry)
            .build()
            .expect("build");
        let report = first.start("p", json!({})).expect("start");
        assert!(report.suspended_on().is_some());

        // Same process id, but the new code stops after the first task.
        let mut registry = TaskRegistry::new();
        let a = TaskDefinition::function("A", schema());
        registry.register_fn(a.clone(), echo).expect("register");
        let second = ProcessRunner::builder()
            .journal(journal)
            .run_store(runs)
            .registry(registry)
            .process(ProcessDefinition::new("p", move |ctx, _| {
                ctx.task(&a, TaskPayload::function(json!({})))
            }))
            .build()
            .expect("build");
        let report = second.resume(&report.run_id).expect("resume");
        let failure = report.failure().expect("failed");
        assert_eq!(failure.kind, crate::core::types::FailureKind::ReplayMismatch);
        assert_eq!(failure.effect_id, Some(EffectId::from_ordinal(2)));
    }

    #[test]
    fn completed_runs_resume_without_executing() {
        let runner = ProcessRunner::builder()
            .process(ProcessDefinition::new("p", |_, input| Ok(json!({"echo": input}))))
            .build()
            .expect("build");
        let report = runner.start("p", json!(5)).expect("start");
        assert_eq!(report.output(), Some(&json!({"echo": 5})));

        let again = runner.resume(&report.run_id).expect("resume");
        assert_eq!(again, report);
        assert_eq!(runner.status(&report.run_id).expect("status").invocations, 1);
    }
}
