mod support;

use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, TryLockError};

use raceway_agent::{bind, current, AccessType, ContextCell, Error, EventKind};
use serde_json::json;

#[test]
fn fresh_trace_single_event() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell.clone());

    agent.track_state_change("counter", 5, 6, AccessType::Write);

    let events = agent.drain_pending();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    match &event.kind {
        EventKind::StateChange {
            variable,
            old_value,
            new_value,
            access_type,
            location,
        } => {
            assert_eq!(variable, "counter");
            assert_eq!(old_value, &json!(5));
            assert_eq!(new_value, &json!(6));
            assert_eq!(*access_type, AccessType::Write);
            assert!(location.contains("tracking.rs"), "location: {location}");
        }
        other => panic!("unexpected kind: {other:?}"),
    }
    assert_eq!(event.parent_id, None);
    assert_eq!(event.causality_vector.len(), 1);
    assert_eq!(event.causality_vector.get("svc-a#a1"), Some(1));

    let ctx = cell.snapshot();
    assert_eq!(ctx.root_event_id(), Some(event.id));
    assert_eq!(ctx.parent_event_id(), Some(event.id));
    assert_eq!(ctx.local_step(), 1);
}

#[test]
fn events_chain_and_own_counter_strictly_increases() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell.clone());

    agent.track_state_change("n", 0, 1, AccessType::Write);
    agent.track_state_change("n", 1, 2, AccessType::Write);
    agent.track_state_change("n", 2, 3, AccessType::Write);

    let events = agent.drain_pending();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].parent_id, None);
    assert_eq!(events[1].parent_id, Some(events[0].id));
    assert_eq!(events[2].parent_id, Some(events[1].id));
    for (step, event) in events.iter().enumerate() {
        assert_eq!(event.causality_vector.get("svc-a#a1"), Some(step as u64 + 1));
    }
    assert_eq!(cell.snapshot().root_event_id(), Some(events[0].id));
    assert_eq!(cell.snapshot().local_step(), 3);
}

#[test]
fn event_metadata_reflects_config_and_context() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell.clone());

    agent.track_state_change("n", 0, 1, AccessType::Read);

    let events = agent.drain_pending();
    let metadata = &events[0].metadata;
    let ctx = cell.snapshot();
    assert_eq!(metadata.service_name, "svc-a");
    assert_eq!(metadata.instance_id, "a1");
    assert_eq!(metadata.environment, "test");
    assert_eq!(metadata.thread_id, ctx.execution_id());
    assert_eq!(metadata.process_id, std::process::id());
    assert_eq!(metadata.distributed_span_id, ctx.span_id());
    assert_eq!(metadata.upstream_span_id, None);
    assert_eq!(events[0].trace_id, ctx.trace_id());
    assert!(events[0].lock_set.is_empty());
}

#[test]
fn tracker_outside_context_captures_nothing() {
    let (agent, _shipper) = support::agent("svc-a", "a1");

    agent.track_state_change("n", 0, 1, AccessType::Write);
    agent.track_function_call("f", None, None);
    agent.track_http_request("GET", "/x", None, None);
    agent.track_lock_acquire("l", "Mutex");
    assert_eq!(agent.track_async_spawn("worker"), None);

    assert_eq!(agent.pending_events(), 0);
}

#[test]
fn propagation_outside_context_is_a_typed_error() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    assert!(matches!(
        agent.propagation_headers(),
        Err(Error::PropagationOutsideContext)
    ));
}

#[test]
fn track_function_measures_duration_and_returns_result() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    let result = agent.track_function("add", json!({"a": 2, "b": 3}), || 2 + 3);
    assert_eq!(result, 5);

    let events = agent.drain_pending();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        EventKind::FunctionCall {
            function_name,
            args,
            file,
            ..
        } => {
            assert_eq!(function_name, "add");
            assert_eq!(args, &json!({"a": 2, "b": 3}));
            assert!(file.contains("tracking.rs"));
        }
        other => panic!("unexpected kind: {other:?}"),
    }
    assert!(events[0].metadata.duration_ns.is_some());
}

#[test]
fn track_function_records_a_panicking_thunk() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        agent.track_function("explode", json!({}), || panic!("boom"))
    }));
    assert!(outcome.is_err());

    let events = agent.drain_pending();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].kind,
        EventKind::FunctionCall { function_name, .. } if function_name == "explode"
    ));
}

#[test]
fn http_request_response_pair() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    agent.track_http_request("POST", "/transfer", None, Some(json!({"amount": 10})));
    agent.track_http_response(200, None, None, 25);

    let events = agent.drain_pending();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].kind,
        EventKind::HttpRequest { method, url, .. } if method == "POST" && url == "/transfer"
    ));
    match &events[1].kind {
        EventKind::HttpResponse {
            status,
            duration_ms,
            ..
        } => {
            assert_eq!(*status, 200);
            assert_eq!(*duration_ms, 25);
        }
        other => panic!("unexpected kind: {other:?}"),
    }
    assert_eq!(events[1].metadata.duration_ns, Some(25_000_000));
    assert_eq!(events[1].parent_id, Some(events[0].id));
}

#[test]
fn scoped_lock_emits_acquire_and_release_on_panic() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    let lock = Mutex::new(100u64);
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut balance = agent.scoped_lock(&lock, "acct", "Mutex").unwrap();
        *balance -= 10;
        panic!("insufficient funds");
    }));
    assert!(outcome.is_err());

    let events = agent.drain_pending();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].kind,
        EventKind::LockAcquire { lock_id, lock_type, .. }
            if lock_id == "acct" && lock_type == "Mutex"
    ));
    assert!(matches!(
        &events[1].kind,
        EventKind::LockRelease { lock_id, lock_type, .. }
            if lock_id == "acct" && lock_type == "Mutex"
    ));

    // The lock was released during unwinding (poisoned, not held).
    assert!(matches!(lock.try_lock(), Err(TryLockError::Poisoned(_))));
}

#[test]
fn scoped_lock_outside_context_fails_before_taking_the_lock() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let lock = Mutex::new(());
    assert!(matches!(
        agent.scoped_lock(&lock, "acct", "Mutex"),
        Err(Error::ContextRequired)
    ));
    assert!(lock.try_lock().is_ok());
}

#[test]
fn scoped_lock_reports_a_poisoned_lock() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    let lock = Mutex::new(());
    let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _held = lock.lock().unwrap();
        panic!("poison it");
    }));

    assert!(matches!(
        agent.scoped_lock(&lock, "acct", "Mutex"),
        Err(Error::LockUnavailable { lock_id }) if lock_id == "acct"
    ));
    // Failing before the acquire event means no orphan acquire is recorded.
    assert_eq!(agent.pending_events(), 0);
}

#[test]
fn with_lock_gives_access_to_the_data() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    let lock = Mutex::new(5u64);
    let doubled = agent
        .with_lock(&lock, "acct", "Mutex", |guard| {
            **guard *= 2;
            **guard
        })
        .unwrap();
    assert_eq!(doubled, 10);
    assert_eq!(*lock.lock().unwrap(), 10);
    assert_eq!(agent.drain_pending().len(), 2);
}

#[test]
fn unrelated_threads_do_not_observe_the_binding() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);
    assert!(current().is_some());

    let agent_for_thread = agent.clone();
    std::thread::spawn(move || {
        assert!(current().is_none());
        // Captures on an unbound thread are silently discarded.
        agent_for_thread.track_state_change("n", 0, 1, AccessType::Write);
    })
    .join()
    .unwrap();

    assert_eq!(agent.pending_events(), 0);
}

#[test]
fn sibling_contexts_keep_separate_chains() {
    let (agent, _shipper) = support::agent("svc-a", "a1");

    let first = ContextCell::new(agent.new_context());
    let second = ContextCell::new(agent.new_context());
    {
        let _guard = bind(first.clone());
        agent.track_state_change("x", 0, 1, AccessType::Write);
    }
    {
        let _guard = bind(second.clone());
        agent.track_state_change("y", 0, 1, AccessType::Write);
    }

    let events = agent.drain_pending();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].trace_id, events[1].trace_id);
    assert_eq!(events[0].trace_id, first.snapshot().trace_id());
    assert_eq!(events[1].trace_id, second.snapshot().trace_id());
    // Both chains start at their own root.
    assert_eq!(events[0].parent_id, None);
    assert_eq!(events[1].parent_id, None);
}

#[test]
fn async_spawn_and_await_kinds() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    let task_id = agent.track_async_spawn("settlement").unwrap();
    agent.track_async_await(&task_id);

    let events = agent.drain_pending();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].kind,
        EventKind::AsyncSpawn { task_id: spawned, task_name, .. }
            if spawned == &task_id && task_name == "settlement"
    ));
    assert!(matches!(
        &events[1].kind,
        EventKind::AsyncAwait { future_id, .. } if future_id == &task_id
    ));
}

#[test]
fn track_error_captures_the_taxonomy_fields() {
    let (agent, _shipper) = support::agent("svc-a", "a1");
    let cell = ContextCell::new(agent.new_context());
    let _guard = bind(cell);

    agent.track_error(
        "InsufficientFunds",
        "balance would go negative",
        vec!["transfer".into(), "debit".into()],
    );

    let events = agent.drain_pending();
    match &events[0].kind {
        EventKind::Error {
            error_type,
            message,
            stack_trace,
        } => {
            assert_eq!(error_type, "InsufficientFunds");
            assert_eq!(message, "balance would go negative");
            assert_eq!(stack_trace.len(), 2);
        }
        other => panic!("unexpected kind: {other:?}"),
    }
}
