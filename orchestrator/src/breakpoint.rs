//! Breakpoint controller: opens pending decisions and records resolutions.
//!
//! A breakpoint is journaled like any other effect. `pending` means awaiting a
//! decision; `completed` carries the resolution, which is immutable once set.
//! Resolving never resumes the run; callers resume explicitly.

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::core::fingerprint::fingerprint;
use crate::core::schema::SchemaValidator;
use crate::core::types::{
    BreakpointRecord, BreakpointSpec, EffectId, EffectKind, EffectRecord, EffectStatus, RunId,
};
use crate::error::{OrchestratorError, Result};
use crate::io::clock::Clock;
use crate::io::journal::EffectJournal;
use crate::io::run_store::{BREAKPOINT_REQUESTED, BREAKPOINT_RESOLVED, RunStore};

/// What a successful `resolve` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// Same resolution was already recorded; nothing changed.
    AlreadyResolved,
}

pub struct BreakpointController<'a> {
    journal: &'a dyn EffectJournal,
    runs: &'a dyn RunStore,
    clock: &'a dyn Clock,
}

impl<'a> BreakpointController<'a> {
    pub fn new(journal: &'a dyn EffectJournal, runs: &'a dyn RunStore, clock: &'a dyn Clock) -> Self {
        Self {
            journal,
            runs,
            clock,
        }
    }

    /// Persist a pending breakpoint at `ordinal` in a single journal write.
    pub fn request(&self, run_id: &RunId, ordinal: u64, spec: &BreakpointSpec) -> Result<EffectId> {
        if let Some(schema) = &spec.resolution_schema {
            SchemaValidator::compile(schema)?;
        }
        let input = serde_json::to_value(spec)
            .map_err(|err| OrchestratorError::Storage(anyhow::Error::new(err)))?;
        let kind = EffectKind::Breakpoint;
        let fp = fingerprint(&kind, &input);
        let now = self.clock.now();
        let record = EffectRecord::pending(ordinal, kind, input, fp, now);
        self.journal.put(run_id, &record)?;
        self.runs.append_event(
            run_id,
            BREAKPOINT_REQUESTED,
            json!({"breakpoint_id": record.effect_id, "question": spec.question}),
            now,
        )?;
        info!(run_id = %run_id, breakpoint_id = %record.effect_id, question = %spec.question, "breakpoint pending");
        Ok(record.effect_id)
    }

    /// Record a decision. Idempotent for an identical resolution.
    pub fn resolve(
        &self,
        run_id: &RunId,
        breakpoint_id: &EffectId,
        resolution: Value,
    ) -> Result<ResolveOutcome> {
        let mut record = self.load(run_id, breakpoint_id)?;
        match record.status {
            EffectStatus::Completed => return settled_outcome(run_id, &record, &resolution),
            EffectStatus::Failed => {
                return Err(OrchestratorError::InvalidState(format!(
                    "breakpoint {breakpoint_id} in run {run_id} is failed"
                )));
            }
            EffectStatus::Pending => {}
        }

        let spec: BreakpointSpec = serde_json::from_value(record.input.clone()).map_err(|err| {
            OrchestratorError::InvalidState(format!(
                "breakpoint {breakpoint_id} in run {run_id} has an unreadable spec: {err}"
            ))
        })?;
        if let Some(schema) = &spec.resolution_schema {
            SchemaValidator::compile(schema)?
                .check(&format!("resolution of breakpoint {breakpoint_id}"), &resolution)?;
        }

        let now = self.clock.now();
        record.complete(resolution.clone(), now);
        match self.journal.put(run_id, &record) {
            Ok(()) => {}
            // Another resolver won the race; judge against what it stored.
            Err(OrchestratorError::AlreadySettled { .. }) => {
                let stored = self.load(run_id, breakpoint_id)?;
                return settled_outcome(run_id, &stored, &resolution);
            }
            Err(err) => return Err(err),
        }
        self.runs.append_event(
            run_id,
            BREAKPOINT_RESOLVED,
            json!({"breakpoint_id": breakpoint_id, "resolution": resolution}),
            now,
        )?;
        info!(run_id = %run_id, breakpoint_id = %breakpoint_id, "breakpoint resolved");
        Ok(ResolveOutcome::Resolved)
    }

    pub fn list_pending(&self, run_id: Option<&RunId>) -> Result<Vec<BreakpointRecord>> {
        self.journal.list_pending_breakpoints(run_id)
    }

    /// The breakpoint record, whatever its status.
    pub fn get(&self, run_id: &RunId, breakpoint_id: &EffectId) -> Result<BreakpointRecord> {
        let record = self.load(run_id, breakpoint_id)?;
        BreakpointRecord::from_effect(run_id, &record).ok_or_else(|| not_found(run_id, breakpoint_id))
    }

    fn load(&self, run_id: &RunId, breakpoint_id: &EffectId) -> Result<EffectRecord> {
        match self.journal.get(run_id, breakpoint_id)? {
            Some(record) if record.is_breakpoint() => Ok(record),
            _ => Err(not_found(run_id, breakpoint_id)),
        }
    }
}

fn not_found(run_id: &RunId, breakpoint_id: &EffectId) -> OrchestratorError {
    OrchestratorError::BreakpointNotFound {
        run_id: run_id.clone(),
        breakpoint_id: breakpoint_id.clone(),
    }
}

fn settled_outcome(run_id: &RunId, record: &EffectRecord, resolution: &Value) -> Result<ResolveOutcome> {
    if record.output.as_ref() == Some(resolution) {
        debug!(run_id = %run_id, breakpoint_id = %record.effect_id, "breakpoint already resolved identically");
        return Ok(ResolveOutcome::AlreadyResolved);
    }
    Err(OrchestratorError::Conflict {
        run_id: run_id.clone(),
        breakpoint_id: record.effect_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::clock::ManualClock;
    use crate::io::journal::MemoryJournal;
    use crate::io::run_store::MemoryRunStore;
    use chrono::{DateTime, Utc};

    struct Fixture {
        journal: MemoryJournal,
        runs: MemoryRunStore,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                journal: MemoryJournal::new(),
                runs: MemoryRunStore::new(),
                clock: ManualClock::new(DateTime::<Utc>::UNIX_EPOCH),
            }
        }

        fn controller(&self) -> BreakpointController<'_> {
            BreakpointController::new(&self.journal, &self.runs, &self.clock)
        }
    }

    #[test]
    fn resolve_is_idempotent_and_rejects_conflicts() {
        let fixture = Fixture::new();
        let controller = fixture.controller();
        let run_id = RunId::from("run-1");
        let id = controller
            .request(&run_id, 2, &BreakpointSpec::new("ok?"))
            .expect("request");
        assert_eq!(id, EffectId::from_ordinal(2));
        assert_eq!(controller.list_pending(None).expect("pending").len(), 1);

        let approved = json!({"approved": true});
        assert_eq!(
            controller.resolve(&run_id, &id, approved.clone()).expect("resolve"),
            ResolveOutcome::Resolved
        );
        assert_eq!(
            controller.resolve(&run_id, &id, approved.clone()).expect("again"),
            ResolveOutcome::AlreadyResolved
        );
        let err = controller
            .resolve(&run_id, &id, json!({"approved": false}))
            .expect_err("conflict");
        assert!(matches!(err, OrchestratorError::Conflict { .. }));

        let record = controller.get(&run_id, &id).expect("get");
        assert_eq!(record.resolution, Some(approved));
        assert!(controller.list_pending(None).expect("pending").is_empty());

        let events = fixture.runs.events(&run_id).expect("events");
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec![BREAKPOINT_REQUESTED, BREAKPOINT_RESOLVED]);
    }

    #[test]
    fn resolution_schema_is_enforced() {
        let fixture = Fixture::new();
        let controller = fixture.controller();
        let run_id = RunId::from("run-1");
        let spec = BreakpointSpec::new("deploy?").with_resolution_schema(json!({
            "type": "object",
            "required": ["approved"],
            "properties": {"approved": {"type": "boolean"}}
        }));
        let id = controller.request(&run_id, 1, &spec).expect("request");

        let err = controller
            .resolve(&run_id, &id, json!({"approved": "yes"}))
            .expect_err("invalid resolution");
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(controller.list_pending(Some(&run_id)).expect("pending").len(), 1);

        controller
            .resolve(&run_id, &id, json!({"approved": true}))
            .expect("valid resolution");
    }

    #[test]
    fn unknown_or_non_breakpoint_ids_are_not_found() {
        let fixture = Fixture::new();
        let controller = fixture.controller();
        let run_id = RunId::from("run-1");
        let task = EffectRecord::pending(
            1,
            EffectKind::Task {
                task: "A".to_string(),
            },
            json!({}),
            "fp".to_string(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        fixture.journal.put(&run_id, &task).expect("put");

        for id in [EffectId::from_ordinal(1), EffectId::from_ordinal(9)] {
            let err = controller
                .resolve(&run_id, &id, json!(true))
                .expect_err("not a breakpoint");
            assert!(matches!(err, OrchestratorError::BreakpointNotFound { .. }));
        }
    }
}
