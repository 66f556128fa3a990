//! CLI tests for inspecting runs and resolving breakpoints.
//!
//! Suspends a run through the library, then spawns the orchestrator binary
//! against the same state directory and checks output and exit codes.

use std::process::{Command, Output};

use serde_json::json;

use orchestrator::exit_codes;
use orchestrator::test_support::{TestState, object_schema};
use orchestrator::{
    BreakpointSpec, ProcessDefinition, ProcessRunner, RunStatus, TaskDefinition, TaskPayload,
    TaskRegistry,
};

fn approval_runner(state: &TestState) -> ProcessRunner {
    let draft = TaskDefinition::function("draft", object_schema(&["text"]));
    let mut registry = TaskRegistry::new();
    registry
        .register_fn(draft.clone(), |_| Ok(json!({"text": "release notes"})))
        .expect("register");
    state
        .builder()
        .registry(registry)
        .process(ProcessDefinition::new("release", move |ctx, _| {
            let text = ctx.task(&draft, TaskPayload::function(json!({})))?;
            let decision = ctx.breakpoint(
                BreakpointSpec::new("publish?")
                    .with_context(text)
                    .with_resolution_schema(object_schema(&["approved"])),
            )?;
            Ok(decision)
        }))
        .build()
        .expect("build")
}

fn cli(state: &TestState, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .arg("--state-dir")
        .arg(state.path())
        .args(args)
        .output()
        .expect("spawn orchestrator")
}

#[test]
fn breakpoints_lists_and_resolve_records_decision() {
    let state = TestState::new();
    let runner = approval_runner(&state);
    let report = runner.start("release", json!({})).expect("start");
    let run_id = report.run_id.to_string();

    let listed = cli(&state, &["breakpoints"]);
    assert_eq!(listed.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&listed.stdout);
    assert!(stdout.contains(&run_id));
    assert!(stdout.contains("ef-000002"));
    assert!(stdout.contains("publish?"));

    let invalid = cli(
        &state,
        &["resolve", &run_id, "ef-000002", "--json", r#"{"ok":1}"#],
    );
    assert_eq!(invalid.status.code(), Some(exit_codes::INVALID));

    let pending = cli(&state, &["breakpoint", &run_id, "ef-000002"]);
    assert_eq!(pending.status.code(), Some(exit_codes::OK));
    let shown: serde_json::Value = serde_json::from_slice(&pending.stdout).expect("json");
    assert_eq!(shown["question"], json!("publish?"));
    assert_eq!(shown["context"], json!({"text": "release notes"}));
    assert_eq!(shown["resolution"], json!(null));

    let resolved = cli(
        &state,
        &["resolve", &run_id, "ef-000002", "--json", r#"{"approved":true}"#],
    );
    assert_eq!(resolved.status.code(), Some(exit_codes::OK));

    let shown = cli(&state, &["breakpoint", &run_id, "ef-000002"]);
    let shown: serde_json::Value = serde_json::from_slice(&shown.stdout).expect("json");
    assert_eq!(shown["resolution"], json!({"approved": true}));
    assert!(shown["resolved_at"].is_string());

    let task_effect = cli(&state, &["breakpoint", &run_id, "ef-000001"]);
    assert_eq!(task_effect.status.code(), Some(exit_codes::NOT_FOUND));

    let repeated = cli(
        &state,
        &["resolve", &run_id, "ef-000002", "--json", r#"{"approved":true}"#],
    );
    assert_eq!(repeated.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&repeated.stdout).contains("already resolved"));

    let conflicting = cli(
        &state,
        &["resolve", &run_id, "ef-000002", "--json", r#"{"approved":false}"#],
    );
    assert_eq!(conflicting.status.code(), Some(exit_codes::CONFLICT));

    let empty = cli(&state, &["breakpoints", "--run", &run_id]);
    assert_eq!(empty.status.code(), Some(exit_codes::OK));
    assert!(empty.stdout.is_empty());

    let resumed = runner.resume(&report.run_id).expect("resume");
    assert_eq!(resumed.status(), RunStatus::Completed);
    assert_eq!(resumed.output(), Some(&json!({"approved": true})));
}

#[test]
fn status_and_effects_report_missing_runs() {
    let state = TestState::new();
    let init = cli(&state, &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let status = cli(&state, &["status", "run-missing"]);
    assert_eq!(status.status.code(), Some(exit_codes::NOT_FOUND));
    let effects = cli(&state, &["effects", "run-missing"]);
    assert_eq!(effects.status.code(), Some(exit_codes::NOT_FOUND));

    let unknown = cli(&state, &["resolve", "run-missing", "ef-000001", "--json", "true"]);
    assert_eq!(unknown.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn status_prints_the_run_record() {
    let state = TestState::new();
    let runner = approval_runner(&state);
    let report = runner.start("release", json!({})).expect("start");

    let output = cli(&state, &["status", report.run_id.as_str()]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let run: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(run["status"], json!("suspended"));
    assert_eq!(run["waiting_on"], json!("ef-000002"));

    let effects = cli(&state, &["effects", report.run_id.as_str()]);
    let stdout = String::from_utf8_lossy(&effects.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("ef-000001\ttask 'draft'\tcompleted"));
    assert!(lines[1].starts_with("ef-000002\tbreakpoint\tpending"));
}
