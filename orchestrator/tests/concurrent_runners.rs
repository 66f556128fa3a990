//! Several runners sharing one state directory, as separate processes would.
//!
//! Each runner opens its own filesystem stores, so only the on-disk locks keep
//! them from driving the same run at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::json;

use orchestrator::io::executor::TaskRequest;
use orchestrator::io::run_store::{RUN_COMPLETED, RUN_FAILED};
use orchestrator::test_support::{TestState, object_schema};
use orchestrator::{
    BreakpointSpec, EffectId, ProcessDefinition, ProcessRunner, RunStatus, TaskDefinition,
    TaskPayload, TaskRegistry,
};

/// Approval process whose final task is slow and counted across runners.
fn publish_runner(state: &TestState, publish_calls: Arc<AtomicU32>) -> ProcessRunner {
    let draft = TaskDefinition::function("draft", object_schema(&["text"]));
    let publish = TaskDefinition::function("publish", object_schema(&["url"]));
    let mut registry = TaskRegistry::new();
    registry
        .register_fn(draft.clone(), |_: &TaskRequest<'_>| Ok(json!({"text": "notes"})))
        .expect("register draft");
    registry
        .register_fn(publish.clone(), move |_: &TaskRequest<'_>| {
            publish_calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(json!({"url": "https://example.test/notes"}))
        })
        .expect("register publish");

    state
        .builder()
        .registry(registry)
        .process(ProcessDefinition::new("release", move |ctx, _| {
            let text = ctx.task(&draft, TaskPayload::function(json!({})))?;
            ctx.breakpoint(BreakpointSpec::new("publish?").with_context(text))?;
            ctx.task(&publish, TaskPayload::function(json!({})))
        }))
        .build()
        .expect("build")
}

#[test]
fn concurrent_resumes_run_each_effect_once() {
    let state = TestState::new();
    let publish_calls = Arc::new(AtomicU32::new(0));
    let first = publish_runner(&state, publish_calls.clone());
    let second = publish_runner(&state, publish_calls.clone());

    let report = first.start("release", json!({})).expect("start");
    let run_id = report.run_id.clone();
    second
        .resolve(&run_id, &EffectId::from_ordinal(2), json!({"approved": true}))
        .expect("resolve");

    let barrier = Barrier::new(2);
    let reports: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = [&first, &second]
            .into_iter()
            .map(|runner| {
                let barrier = &barrier;
                let run_id = &run_id;
                scope.spawn(move || {
                    barrier.wait();
                    runner.resume(run_id)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join").expect("resume"))
            .collect()
    });

    assert_eq!(publish_calls.load(Ordering::SeqCst), 1);
    for report in &reports {
        assert_eq!(report.status(), RunStatus::Completed);
        assert_eq!(
            report.output(),
            Some(&json!({"url": "https://example.test/notes"}))
        );
    }

    let events = first.events(&run_id).expect("events");
    let completed = events.iter().filter(|event| event.event == RUN_COMPLETED).count();
    assert_eq!(completed, 1);
    assert!(events.iter().all(|event| event.event != RUN_FAILED));
    let ids: Vec<u64> = events.iter().map(|event| event.id).collect();
    let expected: Vec<u64> = (1..=ids.len() as u64).collect();
    assert_eq!(ids, expected);
    assert_eq!(second.effects(&run_id).expect("effects").len(), 3);
}

#[test]
fn starts_on_separate_runners_do_not_collide() {
    let state = TestState::new();
    let publish_calls = Arc::new(AtomicU32::new(0));
    let runners: Vec<ProcessRunner> = (0..3)
        .map(|_| publish_runner(&state, publish_calls.clone()))
        .collect();

    let run_ids: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = runners
            .iter()
            .map(|runner| scope.spawn(move || runner.start("release", json!({})).expect("start")))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join").run_id)
            .collect()
    });

    let mut unique = run_ids.clone();
    unique.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    unique.dedup();
    assert_eq!(unique.len(), 3);
    let pending = runners[0].list_pending_breakpoints(None).expect("pending");
    assert_eq!(pending.len(), 3);
}
