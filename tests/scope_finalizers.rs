//! Scopes: finalizer ordering, exactly-once release and scope trees.

#[macro_use]
mod common;

use common::*;
use effectum::{Effect, ErrorKind, Exit, Scope, ScopeExit};
use std::convert::Infallible;
use std::time::Duration;

fn record(log: &EventLog, name: &'static str) -> Effect<(), Infallible> {
    let log = log.clone();
    Effect::add_finalizer(move |exit: &ScopeExit| {
        let log = log.clone();
        let outcome = if exit.is_success() {
            "ok"
        } else if exit.is_interrupted() {
            "interrupted"
        } else {
            "failed"
        };
        Effect::sync(move || log.push(format!("{name}:{outcome}")))
    })
}

fn three_finalizers(log: &EventLog) -> Effect<(), Infallible> {
    record(log, "A")
        .and_then(record(log, "B"))
        .and_then(record(log, "C"))
}

#[test]
fn finalizers_run_in_reverse_on_success() {
    init_test_logging();
    test_phase!("finalizers_run_in_reverse_on_success");
    let runtime = test_runtime_single();
    let log = EventLog::new();

    let program = three_finalizers(&log)
        .widen::<String>()
        .and_then(Effect::succeed(5_u32))
        .scoped();
    let value = runtime.run_sync(program).expect("program succeeds");

    assert_eq!(value, 5);
    assert_eq!(log.events(), vec!["C:ok", "B:ok", "A:ok"]);
    test_complete!("finalizers_run_in_reverse_on_success");
}

#[test]
fn finalizers_see_the_failure() {
    init_test_logging();
    test_phase!("finalizers_see_the_failure");
    let runtime = test_runtime_single();
    let log = EventLog::new();

    let program = three_finalizers(&log)
        .widen::<String>()
        .and_then(Effect::<u32, String>::fail("broken".to_string()))
        .scoped();
    let exit = runtime.run_sync_exit(program);

    assert_exit_failure!(exit, "broken".to_string());
    assert_eq!(log.events(), vec!["C:failed", "B:failed", "A:failed"]);
    test_complete!("finalizers_see_the_failure");
}

#[test]
fn finalizers_run_once_on_interrupt() {
    init_test_logging();
    test_phase!("finalizers_run_once_on_interrupt");
    let runtime = test_runtime();
    let log = EventLog::new();

    let program = three_finalizers(&log)
        .widen::<String>()
        .and_then(Effect::<(), String>::never())
        .scoped();
    let fiber = runtime.run_fork(program);
    std::thread::sleep(Duration::from_millis(10));
    assert!(log.events().is_empty(), "nothing released while running");

    assert_exit_interrupted!(fiber.interrupt());
    assert_eq!(
        log.events(),
        vec!["C:interrupted", "B:interrupted", "A:interrupted"]
    );
    test_complete!("finalizers_run_once_on_interrupt");
}

#[test]
fn add_finalizer_without_scope_dies() {
    init_test_logging();
    test_phase!("add_finalizer_without_scope_dies");
    let runtime = test_runtime_single();

    let exit = runtime.run_sync_exit(Effect::add_finalizer(|_| Effect::unit()));
    let kind = exit
        .cause()
        .and_then(effectum::Cause::first_defect)
        .and_then(effectum::Defect::error_kind);

    assert_with_log!(
        kind == Some(ErrorKind::NoEnclosingScope),
        "defect names the missing scope",
        Some(ErrorKind::NoEnclosingScope),
        kind
    );
    test_complete!("add_finalizer_without_scope_dies");
}

#[test]
fn closed_scope_rejects_new_finalizers() {
    init_test_logging();
    test_phase!("closed_scope_rejects_new_finalizers");
    let runtime = test_runtime_single();
    let scope = Scope::root();

    let closing = scope.close(Exit::Success(()));
    let adding = scope.add_finalizer(|_| Effect::unit());
    let exit = runtime.run_sync_exit(closing.and_then(adding));
    let kind = exit
        .cause()
        .and_then(effectum::Cause::first_defect)
        .and_then(effectum::Defect::error_kind);

    assert_eq!(kind, Some(ErrorKind::ScopeClosed));
    test_complete!("closed_scope_rejects_new_finalizers");
}

#[test]
fn closing_twice_runs_finalizers_once() {
    init_test_logging();
    test_phase!("closing_twice_runs_finalizers_once");
    let runtime = test_runtime_single();
    let scope = Scope::root();
    let log = EventLog::new();

    let program = scope
        .extend(three_finalizers(&log))
        .and_then(scope.close(Exit::Success(())))
        .and_then(scope.close(Exit::Success(())));
    runtime.run_sync(program).expect("program succeeds");

    assert!(scope.is_closed());
    assert_eq!(log.events(), vec!["C:ok", "B:ok", "A:ok"]);
    test_complete!("closing_twice_runs_finalizers_once");
}

#[test]
fn failing_finalizer_does_not_stop_the_rest() {
    init_test_logging();
    test_phase!("failing_finalizer_does_not_stop_the_rest");
    let runtime = test_runtime_single();
    let log = EventLog::new();

    let program = record(&log, "A")
        .and_then(Effect::add_finalizer(|_| Effect::die_message("finalizer broke")))
        .and_then(record(&log, "C"))
        .scoped();
    let exit = runtime.run_sync_exit(program);

    assert_exit_die!(exit);
    assert_eq!(log.events(), vec!["C:ok", "A:ok"]);
    test_complete!("failing_finalizer_does_not_stop_the_rest");
}

#[test]
fn closing_a_parent_closes_open_children() {
    init_test_logging();
    test_phase!("closing_a_parent_closes_open_children");
    let runtime = test_runtime_single();
    let parent = Scope::root();
    let log = EventLog::new();

    let child = runtime.run_sync(parent.fork()).expect("fork succeeds");
    runtime
        .run_sync(child.extend(record(&log, "child")))
        .expect("register succeeds");
    runtime
        .run_sync(parent.extend(record(&log, "parent")))
        .expect("register succeeds");
    assert_eq!(parent.finalizer_count(), 2);

    runtime
        .run_sync(parent.close(Exit::Success(())))
        .expect("close succeeds");

    assert!(child.is_closed());
    assert_eq!(log.events(), vec!["parent:ok", "child:ok"]);
    test_complete!("closing_a_parent_closes_open_children");
}

#[test]
fn closing_a_child_early_detaches_it() {
    init_test_logging();
    test_phase!("closing_a_child_early_detaches_it");
    let runtime = test_runtime_single();
    let parent = Scope::root();
    let log = EventLog::new();

    let child = runtime.run_sync(parent.fork()).expect("fork succeeds");
    runtime
        .run_sync(child.extend(record(&log, "child")))
        .expect("register succeeds");
    assert_eq!(parent.finalizer_count(), 1);

    runtime
        .run_sync(child.close(Exit::Success(())))
        .expect("close succeeds");
    assert_eq!(parent.finalizer_count(), 0);

    runtime
        .run_sync(parent.close(Exit::Success(())))
        .expect("close succeeds");
    assert_eq!(log.events(), vec!["child:ok"]);
    test_complete!("closing_a_child_early_detaches_it");
}

#[test]
fn nested_scoped_regions_close_innermost_first() {
    init_test_logging();
    test_phase!("nested_scoped_regions_close_innermost_first");
    let runtime = test_runtime_single();
    let log = EventLog::new();

    let inner = record(&log, "inner").scoped();
    let after_inner = log.clone();
    let program = record(&log, "outer")
        .and_then(inner)
        .and_then(Effect::sync(move || after_inner.push("body")))
        .scoped();
    runtime.run_sync(program).expect("program succeeds");

    assert_eq!(log.events(), vec!["inner:ok", "body", "outer:ok"]);
    test_complete!("nested_scoped_regions_close_innermost_first");
}

#[test]
fn run_scoped_closes_with_the_exit() {
    init_test_logging();
    test_phase!("run_scoped_closes_with_the_exit");
    let runtime = test_runtime();
    let log = EventLog::new();

    let resource_log = log.clone();
    let resource = Effect::acquire_release(
        Effect::<&str, String>::succeed("file"),
        move |name, exit| {
            let log = resource_log.clone();
            let ok = exit.is_success();
            Effect::sync(move || log.push(format!("close {name} ok={ok}")))
        },
    );
    let exit = runtime.run_scoped(resource.map(str::len));

    assert_exit_success!(exit, 4);
    assert_eq!(log.events(), vec!["close file ok=true"]);
    test_complete!("run_scoped_closes_with_the_exit");
}

#[test]
fn scope_lookup_without_scope_dies() {
    init_test_logging();
    test_phase!("scope_lookup_without_scope_dies");
    let runtime = test_runtime_single();

    assert_exit_die!(runtime.run_sync_exit(Effect::scope()));
    let found = runtime
        .run_sync(Effect::scope().map(|_| true).scoped())
        .expect("scope present");
    assert!(found);
    test_complete!("scope_lookup_without_scope_dies");
}
