// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scopes driven from running fibers.

use std::sync::Arc;

use parking_lot::Mutex;
use rask_fiber::{
    Cause, Deferred, Effect, ExecutionStrategy, Exit, FiberContext, FiberId, Runtime, Scope,
};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: impl Into<String>) {
    log.lock().push(entry.into());
}

#[test]
fn nested_scopes_release_in_registration_order() {
    let log: Log = Arc::default();
    let body_log = log.clone();
    let rt = Runtime::default();
    let out = rt.unsafe_run_sync(Effect::<u32, String>::new(move |cx: FiberContext| async move {
        let outer_log = body_log.clone();
        cx.scoped(ExecutionStrategy::Sequential, move |outer: Scope| async move {
            let l = outer_log.clone();
            outer.on_close(async move { record(&l, "outer") }).await;
            let inner = outer.fork(ExecutionStrategy::Sequential);
            let l = outer_log.clone();
            inner.on_close(async move { record(&l, "inner") }).await;
            Ok::<_, Cause<String>>(7)
        })
        .await
    }));
    assert_eq!(out, Ok(7));
    // The child scope closer was registered after the outer finalizer.
    assert_eq!(*log.lock(), vec!["outer".to_string(), "inner".to_string()]);
}

#[test]
fn failing_body_still_runs_finalizers_with_its_exit() {
    let seen: Arc<Mutex<Option<bool>>> = Arc::default();
    let sink = seen.clone();
    let rt = Runtime::default();
    let out = rt.unsafe_run_sync(Effect::<(), String>::new(move |cx: FiberContext| async move {
        cx.scoped(ExecutionStrategy::Parallel, move |scope: Scope| async move {
            scope
                .add_finalizer(move |exit| async move {
                    *sink.lock() = Some(exit.is_failure());
                })
                .await;
            Err::<(), _>(Cause::fail("broken".to_string()))
        })
        .await
    }));
    assert_eq!(out, Err(rask_fiber::RunError::Failure("broken".to_string())));
    assert_eq!(*seen.lock(), Some(true));
}

#[tokio::test]
async fn finalizers_are_shielded_from_interruption() {
    let log: Log = Arc::default();
    let gate: Deferred<(), String> = Deferred::make(FiberId::None);
    let entered: Deferred<(), String> = Deferred::make(FiberId::None);

    let rt = Runtime::default();
    let body_log = log.clone();
    let body_gate = gate.clone();
    let body_entered = entered.clone();
    let fiber = rt.unsafe_fork(Effect::<(), String>::new(move |cx: FiberContext| async move {
        let finalizer_cx = cx.clone();
        cx.scoped(ExecutionStrategy::Sequential, move |scope: Scope| async move {
            scope
                .on_close(async move {
                    body_entered.succeed(());
                    let waited = finalizer_cx.await_deferred(&body_gate).await;
                    record(&body_log, format!("released: {}", waited.is_ok()));
                })
                .await;
            Ok::<_, Cause<String>>(())
        })
        .await
    }));

    entered.await_exit().await;
    let by = FiberId::runtime(12, 0);
    fiber.interrupt_as_fork(by.clone());
    gate.succeed(());
    let exit = fiber.await_exit().await;
    assert_eq!(*log.lock(), vec!["released: true".to_string()]);
    // The interrupt held off during closing lands once the scope is done.
    assert!(exit.is_interrupted());
    assert!(exit.cause().unwrap().interruptors().contains(&by));
}

#[tokio::test]
async fn closing_twice_runs_finalizers_once() {
    let log: Log = Arc::default();
    let scope = Scope::make(ExecutionStrategy::Sequential);
    let l = log.clone();
    scope.on_close(async move { record(&l, "closed") }).await;
    assert_eq!(scope.close(Exit::succeed(())).await, Exit::succeed(()));
    assert_eq!(scope.close(Exit::fail(())).await, Exit::succeed(()));
    assert_eq!(*log.lock(), vec!["closed".to_string()]);
    assert_eq!(scope.closed_with(), Some(Exit::succeed(())));
}
