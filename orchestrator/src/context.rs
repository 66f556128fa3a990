//! Run context: the only interface process code uses to reach the outside world.
//!
//! Every effect-producing call (`task`, `breakpoint`, `now`, each member of
//! `parallel`) takes the next ordinal of the run and is addressed by the
//! [`EffectId`] derived from it. A journal hit is returned without touching
//! the executor; a miss is dispatched, validated and journaled.
//!
//! Suspension and fatal errors travel as [`Interrupt`] values so process code
//! can use `?` and the runner can tell "suspended" from "failed". The first
//! interrupt halts the context: every later effect call returns it again
//! without consuming an ordinal, and the runner settles the run on it even
//! if the process discarded it.

use std::fmt;
use std::thread;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::breakpoint::BreakpointController;
use crate::core::fingerprint::fingerprint;
use crate::core::retry::RetryPolicy;
use crate::core::task::{TaskDefinition, TaskPayload};
use crate::core::types::{BreakpointSpec, EffectId, EffectKind, EffectRecord, EffectStatus, RunId};
use crate::error::{OrchestratorError, Result};
use crate::io::clock::Clock;
use crate::io::executor::TaskRequest;
use crate::io::journal::EffectJournal;
use crate::io::run_store::{
    EFFECT_ATTEMPT_FAILED, EFFECT_COMPLETED, EFFECT_FAILED, EFFECT_REQUESTED, RunStore,
};
use crate::registry::{RegisteredTask, TaskRegistry};

/// Why a process function stopped before returning a value.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// Waiting on an unresolved breakpoint.
    Suspend(EffectId),
    Fail(OrchestratorError),
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Suspend(effect_id) => write!(f, "suspended on breakpoint {effect_id}"),
            Interrupt::Fail(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Interrupt {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Interrupt::Suspend(_) => None,
            Interrupt::Fail(err) => Some(err),
        }
    }
}

/// Errors raised by process code itself fail the run as process failures.
impl From<anyhow::Error> for Interrupt {
    fn from(err: anyhow::Error) -> Self {
        Interrupt::Fail(OrchestratorError::Process(format!("{err:#}")))
    }
}

impl From<serde_json::Error> for Interrupt {
    fn from(err: serde_json::Error) -> Self {
        Interrupt::Fail(OrchestratorError::Process(err.to_string()))
    }
}

impl From<OrchestratorError> for Interrupt {
    fn from(err: OrchestratorError) -> Self {
        Interrupt::Fail(err)
    }
}

impl From<crate::error::ValidationError> for Interrupt {
    fn from(err: crate::error::ValidationError) -> Self {
        Interrupt::Fail(err.into())
    }
}

/// Result type of process code and context calls.
pub type Flow<T> = std::result::Result<T, Interrupt>;

/// Shared engine handles used by a context and its parallel workers.
#[derive(Clone, Copy)]
pub(crate) struct Engine<'a> {
    pub journal: &'a dyn EffectJournal,
    pub runs: &'a dyn RunStore,
    pub registry: &'a TaskRegistry,
    pub clock: &'a dyn Clock,
    pub retry: &'a RetryPolicy,
}

pub struct RunContext<'a> {
    engine: Engine<'a>,
    run_id: RunId,
    /// Last ordinal handed out in this invocation.
    consumed: u64,
    /// Highest ordinal present in the journal when the invocation began.
    journaled: u64,
    /// First interrupt raised by an effect call.
    halted: Option<Interrupt>,
}

/// A task call whose ordinal is assigned and whose journal slot was checked.
enum Planned<'a> {
    Replayed(Value),
    Live {
        record: EffectRecord,
        is_new: bool,
        task: &'a RegisteredTask,
        payload: TaskPayload,
    },
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(engine: Engine<'a>, run_id: RunId, journaled: u64) -> Self {
        Self {
            engine,
            run_id,
            consumed: 0,
            journaled,
            halted: None,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// True while the next call will be answered from the journal.
    pub fn is_replaying(&self) -> bool {
        self.consumed < self.journaled
    }

    /// Last ordinal consumed by this invocation.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// The interrupt that halted this invocation, if any.
    pub(crate) fn into_halt(self) -> Option<Interrupt> {
        self.halted
    }

    /// Run `call` unless the context is halted, latching its interrupt.
    fn guarded<T>(&mut self, call: impl FnOnce(&mut Self) -> Flow<T>) -> Flow<T> {
        if let Some(halt) = &self.halted {
            debug!(run_id = %self.run_id, halt = %halt, "context halted, effect call refused");
            return Err(halt.clone());
        }
        let result = call(self);
        if let Err(interrupt) = &result {
            self.halted = Some(interrupt.clone());
        }
        result
    }

    /// Run a task, or return its journaled output on replay.
    #[instrument(skip_all, fields(run_id = %self.run_id, task = %definition.name))]
    pub fn task(&mut self, definition: &TaskDefinition, payload: TaskPayload) -> Flow<Value> {
        self.guarded(|ctx| ctx.run_task(definition, payload))
    }

    fn run_task(&mut self, definition: &TaskDefinition, payload: TaskPayload) -> Flow<Value> {
        let ordinal = self.next_ordinal();
        match self.plan(ordinal, definition, payload)? {
            Planned::Replayed(output) => Ok(output),
            Planned::Live {
                record,
                is_new,
                task,
                payload,
            } => {
                self.open(&record, is_new)?;
                Ok(self.engine.execute(&self.run_id, record, task, &payload)?)
            }
        }
    }

    /// Run independent tasks concurrently.
    ///
    /// Ordinals follow request order; results come back in request order. A
    /// failing member fails the batch once every member has settled.
    #[instrument(skip_all, fields(run_id = %self.run_id, batch = calls.len()))]
    pub fn parallel(&mut self, calls: Vec<(&TaskDefinition, TaskPayload)>) -> Flow<Vec<Value>> {
        self.guarded(|ctx| ctx.run_parallel(calls))
    }

    fn run_parallel(&mut self, calls: Vec<(&TaskDefinition, TaskPayload)>) -> Flow<Vec<Value>> {
        let mut planned = Vec::with_capacity(calls.len());
        for (definition, payload) in calls {
            let ordinal = self.next_ordinal();
            planned.push(self.plan(ordinal, definition, payload)?);
        }
        for slot in &planned {
            if let Planned::Live { record, is_new, .. } = slot {
                self.open(record, *is_new)?;
            }
        }

        enum Slot<'s> {
            Ready(Value),
            Running(thread::ScopedJoinHandle<'s, Result<Value>>),
        }

        let engine = self.engine;
        let run_id = &self.run_id;
        let settled: Vec<Result<Value>> = thread::scope(|scope| {
            let slots: Vec<Slot<'_>> = planned
                .into_iter()
                .map(|planned| match planned {
                    Planned::Replayed(output) => Slot::Ready(output),
                    Planned::Live {
                        record,
                        task,
                        payload,
                        ..
                    } => Slot::Running(
                        scope.spawn(move || engine.execute(run_id, record, task, &payload)),
                    ),
                })
                .collect();
            slots
                .into_iter()
                .map(|slot| match slot {
                    Slot::Ready(output) => Ok(output),
                    Slot::Running(handle) => handle.join().unwrap_or_else(|_| {
                        Err(OrchestratorError::InvalidState(
                            "parallel task worker panicked".to_string(),
                        ))
                    }),
                })
                .collect()
        });

        let mut outputs = Vec::with_capacity(settled.len());
        for result in settled {
            outputs.push(result?);
        }
        Ok(outputs)
    }

    /// Suspend until an external decision resolves this breakpoint.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn breakpoint(&mut self, spec: BreakpointSpec) -> Flow<Value> {
        self.guarded(|ctx| ctx.run_breakpoint(spec))
    }

    fn run_breakpoint(&mut self, spec: BreakpointSpec) -> Flow<Value> {
        let ordinal = self.next_ordinal();
        let input = to_value(&spec)?;
        let existing = self.replay_slot(ordinal, &EffectKind::Breakpoint, &input)?;
        match existing {
            Some(record) => match record.status {
                EffectStatus::Completed => Ok(record.output.unwrap_or(Value::Null)),
                EffectStatus::Pending => Err(Interrupt::Suspend(record.effect_id)),
                EffectStatus::Failed => Err(OrchestratorError::InvalidState(format!(
                    "breakpoint {} in run {} is failed",
                    record.effect_id, self.run_id
                ))
                .into()),
            },
            None => {
                let controller =
                    BreakpointController::new(self.engine.journal, self.engine.runs, self.engine.clock);
                let breakpoint_id = controller.request(&self.run_id, ordinal, &spec)?;
                Err(Interrupt::Suspend(breakpoint_id))
            }
        }
    }

    /// Current time, captured once per ordinal and replayed thereafter.
    pub fn now(&mut self) -> Flow<DateTime<Utc>> {
        self.guarded(Self::capture_now)
    }

    fn capture_now(&mut self) -> Flow<DateTime<Utc>> {
        let ordinal = self.next_ordinal();
        let kind = EffectKind::Clock;
        if let Some(record) = self.replay_slot(ordinal, &kind, &Value::Null)?
            && record.status == EffectStatus::Completed
        {
            let stored = record.output.unwrap_or(Value::Null);
            return serde_json::from_value(stored).map_err(|err| {
                OrchestratorError::InvalidState(format!(
                    "clock effect {} in run {} is unreadable: {err}",
                    record.effect_id, self.run_id
                ))
                .into()
            });
        }

        let now = self.engine.clock.now();
        let mut record =
            EffectRecord::pending(ordinal, kind.clone(), Value::Null, fingerprint(&kind, &Value::Null), now);
        record.complete(to_value(&now)?, now);
        self.engine.journal.put(&self.run_id, &record)?;
        Ok(now)
    }

    /// Diagnostic logging; never journaled, safe to repeat on replay.
    pub fn log(&self, message: impl AsRef<str>) {
        info!(
            run_id = %self.run_id,
            replaying = self.is_replaying(),
            "{}",
            message.as_ref()
        );
    }

    /// Build the interrupt for a process-level failure.
    pub fn fail(&self, message: impl Into<String>) -> Interrupt {
        Interrupt::Fail(OrchestratorError::Process(message.into()))
    }

    fn next_ordinal(&mut self) -> u64 {
        self.consumed += 1;
        self.consumed
    }

    /// Journal lookup with determinism check. A record at this ordinal must
    /// have been produced by the very same request.
    fn replay_slot(&self, ordinal: u64, kind: &EffectKind, input: &Value) -> Result<Option<EffectRecord>> {
        let effect_id = EffectId::from_ordinal(ordinal);
        let Some(record) = self.engine.journal.get(&self.run_id, &effect_id)? else {
            return Ok(None);
        };
        let fp = fingerprint(kind, input);
        if &record.kind != kind || record.fingerprint != fp {
            return Err(OrchestratorError::ReplayMismatch {
                run_id: self.run_id.clone(),
                effect_id,
                expected: describe(&record.kind, &record.fingerprint),
                actual: describe(kind, &fp),
            });
        }
        debug!(run_id = %self.run_id, effect_id = %record.effect_id, status = %record.status, "journal hit");
        Ok(Some(record))
    }

    fn plan(
        &self,
        ordinal: u64,
        definition: &TaskDefinition,
        payload: TaskPayload,
    ) -> Result<Planned<'a>> {
        let task = self.engine.registry.lookup(&definition.name)?;
        if task.definition() != definition {
            return Err(OrchestratorError::Configuration(format!(
                "task '{}' differs from its registered definition",
                definition.name
            )));
        }
        // Retrying cannot change the input, so a bad payload fails the run.
        task.check_input(&payload)?;

        let kind = EffectKind::Task {
            task: definition.name.clone(),
        };
        let input = to_value(&payload)?;
        match self.replay_slot(ordinal, &kind, &input)? {
            Some(record) => match record.status {
                EffectStatus::Completed => Ok(Planned::Replayed(record.output.unwrap_or(Value::Null))),
                EffectStatus::Failed => Err(OrchestratorError::Executor {
                    task: definition.name.clone(),
                    effect_id: record.effect_id,
                    message: record.error.unwrap_or_else(|| "failed".to_string()),
                }),
                EffectStatus::Pending => Ok(Planned::Live {
                    record,
                    is_new: false,
                    task,
                    payload,
                }),
            },
            None => {
                let fp = fingerprint(&kind, &input);
                let record = EffectRecord::pending(ordinal, kind, input, fp, self.engine.clock.now());
                Ok(Planned::Live {
                    record,
                    is_new: true,
                    task,
                    payload,
                })
            }
        }
    }

    fn open(&self, record: &EffectRecord, is_new: bool) -> Result<()> {
        if !is_new {
            debug!(run_id = %self.run_id, effect_id = %record.effect_id, attempts = record.attempts, "continuing pending effect");
            return Ok(());
        }
        self.engine.journal.put(&self.run_id, record)?;
        self.engine.runs.append_event(
            &self.run_id,
            EFFECT_REQUESTED,
            json!({"effect_id": record.effect_id, "task": record.task_name()}),
            record.created_at,
        )?;
        Ok(())
    }
}

impl Engine<'_> {
    /// Attempt loop for one task effect, journaling the outcome.
    pub(crate) fn execute(
        &self,
        run_id: &RunId,
        mut record: EffectRecord,
        task: &RegisteredTask,
        payload: &TaskPayload,
    ) -> Result<Value> {
        let name = task.definition().name.clone();
        let artifacts = self.journal.artifacts(run_id, &record.effect_id);
        loop {
            // A continued record may already have spent its attempts.
            if !self.retry.allows_another(record.attempts) {
                let err = OrchestratorError::Executor {
                    task: name.clone(),
                    effect_id: record.effect_id.clone(),
                    message: format!(
                        "{} attempts made without the effect settling",
                        record.attempts
                    ),
                };
                return self.settle_failed(run_id, record, &name, err);
            }
            record.attempts += 1;
            let attempt = record.attempts;
            let backoff = self.retry.backoff_before(attempt);
            if !backoff.is_zero() {
                debug!(run_id = %run_id, effect_id = %record.effect_id, attempt, backoff_ms = backoff.as_millis() as u64, "backing off");
                thread::sleep(backoff);
            }
            self.journal.put(run_id, &record)?;

            let request = TaskRequest {
                run_id,
                effect_id: &record.effect_id,
                task: task.definition(),
                payload,
                attempt,
                artifacts: artifacts.as_ref(),
            };
            let outcome = task
                .executor()
                .execute(&request)
                .map_err(|err| OrchestratorError::Executor {
                    task: name.clone(),
                    effect_id: record.effect_id.clone(),
                    message: format!("{err:#}"),
                })
                .and_then(|output| {
                    task.check_output(&output)?;
                    Ok(output)
                });

            let now = self.clock.now();
            match outcome {
                Ok(output) => {
                    record.complete(output.clone(), now);
                    self.journal.put(run_id, &record)?;
                    self.runs.append_event(
                        run_id,
                        EFFECT_COMPLETED,
                        json!({"effect_id": record.effect_id, "task": name, "attempts": attempt}),
                        now,
                    )?;
                    debug!(run_id = %run_id, effect_id = %record.effect_id, attempt, "effect completed");
                    return Ok(output);
                }
                Err(err) if self.retry.allows_another(attempt) => {
                    warn!(run_id = %run_id, effect_id = %record.effect_id, task = %name, attempt, err = %err, "effect attempt failed, retrying");
                    self.runs.append_event(
                        run_id,
                        EFFECT_ATTEMPT_FAILED,
                        json!({"effect_id": record.effect_id, "task": name, "attempt": attempt, "error": err.to_string()}),
                        now,
                    )?;
                }
                Err(err) => return self.settle_failed(run_id, record, &name, err),
            }
        }
    }

    fn settle_failed(
        &self,
        run_id: &RunId,
        mut record: EffectRecord,
        name: &str,
        err: OrchestratorError,
    ) -> Result<Value> {
        let now = self.clock.now();
        warn!(run_id = %run_id, effect_id = %record.effect_id, task = %name, attempts = record.attempts, err = %err, "effect failed");
        record.fail(err.to_string(), now);
        self.journal.put(run_id, &record)?;
        self.runs.append_event(
            run_id,
            EFFECT_FAILED,
            json!({"effect_id": record.effect_id, "task": name, "attempts": record.attempts, "error": err.to_string()}),
            now,
        )?;
        Err(err)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| OrchestratorError::Storage(anyhow::Error::new(err)))
}

fn describe(kind: &EffectKind, fingerprint: &str) -> String {
    let short = fingerprint.get(..12).unwrap_or(fingerprint);
    format!("{} [{short}]", kind.label())
}
