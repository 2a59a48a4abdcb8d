// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end runs through the public runtime entry points.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rask_fiber::{
    registry, Cause, Deferred, Effect, Exit, FiberContext, FiberId, FiberRef, FiberStatus, ForkOptions,
    RunError, Runtime, RuntimeConfig, RuntimeFlag, RuntimeFlagsPatch, SyncScheduler, HostScheduler, Track,
};

fn appended(log: &Vec<&'static str>, entry: &'static str) -> Vec<&'static str> {
    let mut next = log.clone();
    next.push(entry);
    next
}

async fn until_suspended<A, E>(fiber: &rask_fiber::Fiber<A, E>)
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    while !fiber.status().is_suspended() {
        tokio::task::yield_now().await;
    }
}

fn completed_later(value: i32, delay: Duration) -> Deferred<i32, String> {
    let cell: Deferred<i32, String> = Deferred::make(FiberId::None);
    let completer = cell.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        completer.succeed(value);
    });
    cell
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parent_joins_child_waiting_on_another_thread() {
    let rt = Runtime::default();
    let cell = completed_later(42, Duration::from_millis(20));
    let out = rt
        .unsafe_run_promise(Effect::<i32, String>::new(move |cx: FiberContext| async move {
            let child = cx.fork(Effect::new(move |cx: FiberContext| async move { cx.await_deferred(&cell).await }));
            child.join(&cx).await
        }))
        .await;
    assert_eq!(out, Ok(42));
}

#[test]
fn sync_run_of_async_work_reports_the_fiber() {
    let rt = Runtime::default();
    let cell = completed_later(1, Duration::from_millis(50));
    let err = rt
        .unsafe_run_sync(Effect::<i32, String>::new(move |cx: FiberContext| async move {
            cx.await_deferred(&cell).await
        }))
        .unwrap_err();
    match err {
        // Without FiberRoots the suspended fiber is not registered.
        RunError::AsyncFiber {
            fiber_id: FiberId::Runtime(id),
        } => assert!(!registry::contains(id)),
        other => panic!("expected AsyncFiber, got {:?}", other),
    }
}

#[test]
fn squashed_errors_keep_their_kind() {
    let rt = Runtime::default();
    assert_eq!(
        rt.unsafe_run_sync(Effect::<(), String>::fail("bad".into())),
        Err(RunError::Failure("bad".to_string()))
    );
    let died = rt.unsafe_run_sync(Effect::<(), String>::sync(|_| panic!("boom")));
    assert!(matches!(died, Err(RunError::Defect(_))));
    let by = FiberId::runtime(9000, 0);
    let interrupted = rt.unsafe_run_sync(Effect::<(), String>::fail_cause(Cause::interrupt(by.clone())));
    assert_eq!(interrupted, Err(RunError::Interrupted(by)));
}

#[test]
fn child_ref_writes_merge_on_join() {
    let log: FiberRef<Vec<&'static str>> = FiberRef::builder("join_log", Vec::new())
        .join(|parent: &Vec<&'static str>, child: &Vec<&'static str>| {
            let mut merged = parent.clone();
            merged.extend(child.iter().filter(|entry| !parent.contains(*entry)));
            merged
        })
        .build();
    let rt = Runtime::default();
    let r = log.clone();
    let out = rt.unsafe_run_sync(Effect::<Vec<&'static str>, ()>::new(move |cx: FiberContext| async move {
        cx.update_ref(&r, |v| appended(v, "parent"));
        let left_ref = r.clone();
        let left = cx.fork(Effect::<(), ()>::sync(move |cx| {
            cx.update_ref(&left_ref, |v| appended(v, "left"));
            Ok(())
        }));
        let right_ref = r.clone();
        let right = cx.fork(Effect::<(), ()>::sync(move |cx| {
            cx.update_ref(&right_ref, |v| appended(v, "right"));
            Ok(())
        }));
        left.join(&cx).await?;
        right.join(&cx).await?;
        Ok(cx.get_ref(&r))
    }));
    assert_eq!(out, Ok(vec!["parent", "left", "right"]));
}

#[test]
fn unjoined_child_writes_stay_invisible() {
    let counter: FiberRef<u32> = FiberRef::make("unjoined", 1);
    let rt = Runtime::default();
    let r = counter.clone();
    let out = rt.unsafe_run_sync(Effect::<u32, ()>::new(move |cx: FiberContext| async move {
        let child_ref = r.clone();
        let child = cx.fork(Effect::<(), ()>::sync(move |cx| {
            cx.set_ref(&child_ref, 99);
            Ok(())
        }));
        let _ = child.await_exit().await;
        Ok(cx.get_ref(&r))
    }));
    assert_eq!(out, Ok(1));
}

#[test]
fn supervisor_tracks_children() {
    let track = Track::new();
    let rt = Runtime::default().with_supervisor(track.clone());
    let out = rt.unsafe_run_sync(Effect::<(), ()>::new(|cx: FiberContext| async move {
        let a = cx.fork(Effect::<(), ()>::succeed(()));
        let b = cx.fork(Effect::<(), ()>::succeed(()));
        a.join(&cx).await?;
        b.join(&cx).await
    }));
    assert_eq!(out, Ok(()));
    assert_eq!(track.started().len(), 3);
    assert_eq!(track.ended().len(), 3);
    assert!(track.live().is_empty());
}

#[test]
fn fiber_roots_are_listed_while_running() {
    let rt = Runtime::default().update_runtime_flags(RuntimeFlagsPatch::enable(RuntimeFlag::FiberRoots));
    let sched = Arc::new(SyncScheduler::new(HostScheduler::current()));
    let gate: Deferred<(), ()> = Deferred::make(FiberId::runtime(31337, 0));
    let waiting = gate.clone();
    let fiber = rt.unsafe_fork_with(
        Effect::new(move |cx: FiberContext| async move { cx.await_deferred(&waiting).await }),
        ForkOptions {
            scheduler: Some(sched.clone()),
            parent: None,
        },
    );
    sched.flush();

    assert!(registry::contains(fiber.id()));
    let snapshot = registry::roots()
        .into_iter()
        .find(|s| s.id == fiber.id())
        .expect("registered");
    assert!(matches!(snapshot.status, FiberStatus::Suspended { .. }));
    assert!(registry::dump().contains("Suspended(blocking on #31337)"));

    gate.succeed(());
    // Resumed on the host scheduler after the flush.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while fiber.poll().is_none() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(fiber.poll(), Some(Exit::succeed(())));
    assert!(!registry::contains(fiber.id()));
}

#[test]
fn untracked_fibers_stay_out_of_the_registry() {
    let rt = Runtime::default();
    let id = rt
        .unsafe_run_sync(Effect::<rask_fiber::RuntimeFiberId, ()>::sync(|cx| {
            assert!(!registry::contains(cx.id()));
            Ok(cx.id())
        }))
        .unwrap();
    assert!(!registry::contains(id));
}

#[tokio::test]
async fn interrupting_a_fiber_reports_the_interruptor() {
    let rt = Runtime::default();
    let never: Deferred<(), String> = Deferred::make(FiberId::None);
    let waiting = never.clone();
    let fiber = rt.unsafe_fork(Effect::new(move |cx: FiberContext| async move { cx.await_deferred(&waiting).await }));
    until_suspended(&fiber).await;
    let by = FiberId::runtime(77, 0);
    let exit = fiber.interrupt_as(by.clone()).await;
    assert!(exit.is_interrupted());
    assert!(exit.cause().unwrap().interruptors().contains(&by));
}

#[tokio::test]
async fn uninterruptible_region_finishes_before_interrupt_lands() {
    let rt = Runtime::default();
    let gate: Deferred<u32, String> = Deferred::make(FiberId::None);
    let waiting = gate.clone();
    let progress = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let seen = progress.clone();
    let fiber = rt.unsafe_fork(Effect::<u32, String>::new(move |cx: FiberContext| async move {
        let n = cx
            .uninterruptible(async {
                let n = cx.await_deferred(&waiting).await?;
                seen.store(n, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, Cause<String>>(n)
            })
            .await?;
        Ok(n + 1)
    }));
    until_suspended(&fiber).await;
    fiber.interrupt_as_fork(FiberId::runtime(5, 0));
    gate.succeed(7);
    let exit = fiber.await_exit().await;
    assert!(exit.is_interrupted());
    assert_eq!(progress.load(std::sync::atomic::Ordering::SeqCst), 7);
}

#[test]
fn config_builds_runtime() {
    let config = RuntimeConfig::from_toml(
        r#"
        runtime_flags = ["CooperativeYielding"]
        max_ops_before_yield = 4
        unhandled_errors_log_level = "off"
        "#,
    )
    .unwrap();
    let rt = Runtime::from_config(&config).unwrap();
    assert!(!rt.runtime_flags().interruption());
    let out = rt.unsafe_run_sync(Effect::<u32, ()>::new(|cx: FiberContext| async move {
        for _ in 0..10 {
            cx.maybe_yield().await;
        }
        Ok(cx.get_ref(rask_fiber::fiber_refs::builtin::current_max_ops_before_yield()))
    }));
    assert_eq!(out, Ok(4));
}
