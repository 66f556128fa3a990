//! Shared deterministic types for the orchestration core.
//!
//! These types define the stable on-disk and in-memory contracts between the
//! runner, the effect journal and the breakpoint controller. They carry no I/O.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of one run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Deterministic effect address derived from the ordinal position of a call.
///
/// Tasks, breakpoints and clock reads share one ordinal space, so the n-th
/// effect-producing call of a run is always `ef-00000n` regardless of kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectId(String);

const EFFECT_PREFIX: &str = "ef-";

impl EffectId {
    /// Effect id for a 1-based ordinal.
    pub fn from_ordinal(ordinal: u64) -> Self {
        Self(format!("{EFFECT_PREFIX}{ordinal:06}"))
    }

    /// Parse an effect id produced by [`EffectId::from_ordinal`].
    pub fn parse(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix(EFFECT_PREFIX)?;
        let ordinal: u64 = digits.parse().ok()?;
        if ordinal == 0 {
            return None;
        }
        Some(Self::from_ordinal(ordinal))
    }

    pub fn ordinal(&self) -> u64 {
        self.0
            .strip_prefix(EFFECT_PREFIX)
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a journaled effect. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectStatus {
    Pending,
    Completed,
    Failed,
}

impl EffectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectStatus::Pending => "pending",
            EffectStatus::Completed => "completed",
            EffectStatus::Failed => "failed",
        }
    }

    pub fn is_settled(self) -> bool {
        !matches!(self, EffectStatus::Pending)
    }
}

impl fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectKind {
    /// A `ctx.task` call against a registered task.
    Task { task: String },
    /// A `ctx.breakpoint` suspension point.
    Breakpoint,
    /// A `ctx.now` clock capture.
    Clock,
}

impl EffectKind {
    pub fn label(&self) -> String {
        match self {
            EffectKind::Task { task } => format!("task '{task}'"),
            EffectKind::Breakpoint => "breakpoint".to_string(),
            EffectKind::Clock => "clock".to_string(),
        }
    }
}

/// One journaled unit of work, addressed by `(run_id, effect_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRecord {
    pub effect_id: EffectId,
    pub ordinal: u64,
    #[serde(flatten)]
    pub kind: EffectKind,
    /// SHA-256 over kind + input; detects non-deterministic process code.
    pub fingerprint: String,
    pub input: Value,
    pub status: EffectStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Attempts made in the current attempt budget.
    #[serde(default)]
    pub attempts: u32,
    /// Errors from earlier budgets, kept when a failed effect is reopened.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_history: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl EffectRecord {
    pub fn pending(
        ordinal: u64,
        kind: EffectKind,
        input: Value,
        fingerprint: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            effect_id: EffectId::from_ordinal(ordinal),
            ordinal,
            kind,
            fingerprint,
            input,
            status: EffectStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            failure_history: Vec::new(),
            created_at: now,
            settled_at: None,
        }
    }

    pub fn complete(&mut self, output: Value, now: DateTime<Utc>) {
        self.status = EffectStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.settled_at = Some(now);
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = EffectStatus::Failed;
        self.error = Some(error);
        self.settled_at = Some(now);
    }

    pub fn is_breakpoint(&self) -> bool {
        matches!(self.kind, EffectKind::Breakpoint)
    }

    pub fn task_name(&self) -> Option<&str> {
        match &self.kind {
            EffectKind::Task { task } => Some(task),
            _ => None,
        }
    }
}

/// Failure classification attached to a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Executor,
    ReplayMismatch,
    Conflict,
    Configuration,
    Process,
    Storage,
    Other,
}

/// Error attached to a run that transitioned to `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    #[serde(default)]
    pub effect_id: Option<EffectId>,
    pub message: String,
}

/// Runner-owned state of one run (`runs/<run_id>/run.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub process_id: String,
    pub input: Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of start/resume invocations that drove the process function.
    pub invocations: u32,
    #[serde(default)]
    pub output: Option<Value>,
    /// Breakpoint the run is suspended on.
    #[serde(default)]
    pub waiting_on: Option<EffectId>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
}

impl RunRecord {
    pub fn new(run_id: RunId, process_id: &str, input: Value, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            process_id: process_id.to_string(),
            input,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
            invocations: 0,
            output: None,
            waiting_on: None,
            failure: None,
        }
    }
}

/// Breakpoint request as written by process code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub question: String,
    #[serde(default)]
    pub context: Value,
    /// Optional contract the resolution must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_schema: Option<Value>,
}

impl BreakpointSpec {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: Value::Null,
            resolution_schema: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_resolution_schema(mut self, schema: Value) -> Self {
        self.resolution_schema = Some(schema);
        self
    }
}

/// Operator-facing view of a breakpoint effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakpointRecord {
    pub run_id: RunId,
    pub breakpoint_id: EffectId,
    pub question: String,
    pub context: Value,
    pub resolution: Option<Value>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BreakpointRecord {
    /// Build the view from a journal record; `None` for non-breakpoint effects.
    pub fn from_effect(run_id: &RunId, record: &EffectRecord) -> Option<Self> {
        if !record.is_breakpoint() {
            return None;
        }
        let spec: BreakpointSpec = serde_json::from_value(record.input.clone()).ok()?;
        Some(Self {
            run_id: run_id.clone(),
            breakpoint_id: record.effect_id.clone(),
            question: spec.question,
            context: spec.context,
            resolution: record.output.clone(),
            requested_at: record.created_at,
            resolved_at: record.settled_at,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effect_ids_are_stable_per_ordinal() {
        assert_eq!(EffectId::from_ordinal(1).as_str(), "ef-000001");
        assert_eq!(EffectId::from_ordinal(42), EffectId::from_ordinal(42));
        assert_eq!(EffectId::from_ordinal(1_234_567).ordinal(), 1_234_567);
    }

    #[test]
    fn effect_id_parse_rejects_foreign_ids() {
        assert_eq!(EffectId::parse("ef-000003"), Some(EffectId::from_ordinal(3)));
        assert_eq!(EffectId::parse("ef-3"), Some(EffectId::from_ordinal(3)));
        assert_eq!(EffectId::parse("ef-000000"), None);
        assert_eq!(EffectId::parse("task-1"), None);
    }

    #[test]
    fn effect_record_serializes_kind_inline() {
        let record = EffectRecord::pending(
            2,
            EffectKind::Task {
                task: "lint".to_string(),
            },
            json!({"x": 1}),
            "abc".to_string(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["kind"], "task");
        assert_eq!(value["task"], "lint");
        assert_eq!(value["effect_id"], "ef-000002");
        assert_eq!(value["status"], "pending");

        let back: EffectRecord = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn breakpoint_view_only_for_breakpoints() {
        let spec = BreakpointSpec::new("ok?").with_context(json!({"files": ["a.md"]}));
        let mut record = EffectRecord::pending(
            1,
            EffectKind::Breakpoint,
            serde_json::to_value(&spec).expect("spec"),
            "fp".to_string(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        let run_id = RunId::from("run-1");

        let view = BreakpointRecord::from_effect(&run_id, &record).expect("view");
        assert_eq!(view.question, "ok?");
        assert!(view.is_pending());

        record.complete(json!({"approved": true}), DateTime::<Utc>::UNIX_EPOCH);
        let view = BreakpointRecord::from_effect(&run_id, &record).expect("view");
        assert_eq!(view.resolution, Some(json!({"approved": true})));

        record.kind = EffectKind::Clock;
        assert!(BreakpointRecord::from_effect(&run_id, &record).is_none());
    }
}
