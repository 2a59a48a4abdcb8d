// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Running fibers.
//!
//! A fiber is an effect body driven by a `FiberTask` on some scheduler,
//! plus the state the body sees through its `FiberContext`: ref snapshot,
//! runtime flags, and pending interruptions. `Fiber<A, E>` is the handle
//! other code holds to observe, join, or interrupt it.

use std::cell::RefCell;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::future::{select, Either};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::Level;

use crate::context::Context;
use crate::deferred::{AwaitExit, Deferred};
use crate::effect::Effect;
use crate::exit::{Cause, Defect, Exit};
use crate::fiber_id::{FiberId, FiberIdGenerator, RuntimeFiberId};
use crate::fiber_refs::builtin::{
    current_context, current_max_ops_before_yield, current_scheduler, current_supervisor,
    interrupted_cause, unhandled_errors_log_level,
};
use crate::fiber_refs::{FiberRef, FiberRefValue, FiberRefs};
use crate::registry;
use crate::runtime_flags::{RuntimeFlag, RuntimeFlags, RuntimeFlagsPatch};
use crate::scheduler::Scheduler;
use crate::supervisor::SupervisorRef;
use crate::task::FiberTask;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<RuntimeFiberId>> = const { RefCell::new(None) };
}

/// Fiber being polled on this thread, if it runs with `CurrentFiber` set.
pub fn current_fiber_id() -> Option<RuntimeFiberId> {
    CURRENT_FIBER.with(|cell| *cell.borrow())
}

/// Observable state of a fiber.
#[derive(Debug, Clone, PartialEq)]
pub enum FiberStatus {
    Running {
        runtime_flags: RuntimeFlags,
    },
    Suspended {
        runtime_flags: RuntimeFlags,
        blocking_on: FiberId,
    },
    Done,
}

impl FiberStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, FiberStatus::Suspended { .. })
    }

    /// Whether an interrupt would be honored right now.
    pub fn interruptible(&self) -> bool {
        match self {
            FiberStatus::Running { runtime_flags } | FiberStatus::Suspended { runtime_flags, .. } => {
                runtime_flags.interruptible()
            }
            FiberStatus::Done => false,
        }
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberStatus::Running { .. } => f.write_str("Running"),
            FiberStatus::Suspended { blocking_on, .. } => {
                write!(f, "Suspended(blocking on {})", blocking_on)
            }
            FiberStatus::Done => f.write_str("Done"),
        }
    }
}

enum Phase {
    Running,
    Suspended(FiberId),
    Done,
}

struct FiberState {
    refs: FiberRefs,
    flags: RuntimeFlags,
    phase: Phase,
}

pub(crate) struct FiberCore {
    id: RuntimeFiberId,
    parent: Option<FiberId>,
    state: Mutex<FiberState>,
    interrupt_signal: Deferred<(), Infallible>,
    scheduler: Arc<dyn Scheduler>,
    id_generator: Option<Arc<FiberIdGenerator>>,
    ops_since_yield: AtomicU32,
}

impl FiberCore {
    pub(crate) fn id(&self) -> RuntimeFiberId {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<&FiberId> {
        self.parent.as_ref()
    }

    pub(crate) fn status(&self) -> FiberStatus {
        let state = self.state.lock();
        match &state.phase {
            Phase::Running => FiberStatus::Running {
                runtime_flags: state.flags,
            },
            Phase::Suspended(blocking_on) => FiberStatus::Suspended {
                runtime_flags: state.flags,
                blocking_on: blocking_on.clone(),
            },
            Phase::Done => FiberStatus::Done,
        }
    }

    fn refs(&self) -> FiberRefs {
        self.state.lock().refs.clone()
    }

    fn flags(&self) -> RuntimeFlags {
        self.state.lock().flags
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    fn interruptors(&self) -> Cause<Infallible> {
        self.state.lock().refs.get_or_default(interrupted_cause())
    }

    fn next_child_id(&self) -> RuntimeFiberId {
        match &self.id_generator {
            Some(generator) => generator.make(),
            None => FiberIdGenerator::global().make(),
        }
    }

    /// Record an interruption request and wake the fiber if it is
    /// suspended interruptibly. Requests against a finished fiber are
    /// dropped.
    fn interrupt_as(&self, by: FiberId) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Done) {
                return;
            }
            let cause = Cause::parallel(
                state.refs.get_or_default(interrupted_cause()),
                Cause::interrupt(by.clone()),
            );
            state.refs = state.refs.updated_as(self.id, interrupted_cause(), cause);
        }
        tracing::debug!(fiber = %self.id, by = %by, "interrupt requested");
        self.interrupt_signal.succeed(());
    }
}

impl fmt::Debug for FiberCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberCore")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Fiber handle
// ---------------------------------------------------------------------------

/// Handle to a forked fiber producing `Exit<A, E>`.
pub struct Fiber<A, E> {
    core: Arc<FiberCore>,
    exit: Deferred<A, E>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            exit: self.exit.clone(),
        }
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn id(&self) -> RuntimeFiberId {
        self.core.id
    }

    pub fn fiber_id(&self) -> FiberId {
        FiberId::Runtime(self.core.id)
    }

    pub fn status(&self) -> FiberStatus {
        self.core.status()
    }

    pub fn runtime_flags(&self) -> RuntimeFlags {
        self.core.flags()
    }

    /// Current ref snapshot of the fiber.
    pub fn snapshot_refs(&self) -> FiberRefs {
        self.core.refs()
    }

    /// The exit, if the fiber has finished. Never suspends.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.exit.poll()
    }

    /// Wait for the exit without merging any fiber state.
    pub fn await_exit(&self) -> AwaitExit<A, E> {
        self.exit.await_exit()
    }

    pub fn add_observer(&self, callback: impl FnOnce(Exit<A, E>) + Send + 'static) {
        self.exit.add_observer(callback);
    }

    /// Request interruption without waiting for the fiber to stop.
    pub fn interrupt_as_fork(&self, by: FiberId) {
        self.core.interrupt_as(by);
    }

    /// Request interruption and wait for the resulting exit.
    pub async fn interrupt_as(&self, by: FiberId) -> Exit<A, E> {
        self.interrupt_as_fork(by);
        self.await_exit().await
    }

    /// Wait for the fiber from inside another fiber, then merge its refs
    /// and runtime flags into the caller. Interruptible.
    pub async fn join(&self, cx: &FiberContext) -> Result<A, Cause<E>> {
        let exit = match cx.await_raw(&self.exit).await {
            Ok(exit) => exit,
            Err(interrupted) => return Err(interrupted.widen()),
        };
        cx.inherit_all(&self.core);
        exit.into_result()
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.core.id)
            .field("status", &self.core.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FiberContext
// ---------------------------------------------------------------------------

/// The running fiber, as seen by its own body.
#[derive(Clone)]
pub struct FiberContext {
    core: Arc<FiberCore>,
}

impl FiberContext {
    pub fn id(&self) -> RuntimeFiberId {
        self.core.id
    }

    pub fn fiber_id(&self) -> FiberId {
        FiberId::Runtime(self.core.id)
    }

    pub fn parent(&self) -> Option<&FiberId> {
        self.core.parent.as_ref()
    }

    pub fn status(&self) -> FiberStatus {
        self.core.status()
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.core.scheduler.clone()
    }

    pub fn context(&self) -> Context {
        self.get_ref(current_context())
    }

    /// Service of type `T` from the fiber's context.
    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.context().get::<T>()
    }

    // -- runtime flags ------------------------------------------------------

    pub fn runtime_flags(&self) -> RuntimeFlags {
        self.core.flags()
    }

    pub fn update_runtime_flags(&self, patch: RuntimeFlagsPatch) {
        let mut state = self.core.state.lock();
        state.flags = state.flags.patch(patch);
    }

    /// Run `body` with `patch` applied, then revert exactly the bits the
    /// patch changed. An interrupt that arrived while the region held it
    /// off takes effect on exit if the restored flags are interruptible.
    pub async fn with_runtime_flags<T, E, F>(&self, patch: RuntimeFlagsPatch, body: F) -> Result<T, Cause<E>>
    where
        F: Future<Output = Result<T, Cause<E>>>,
    {
        let old = self.runtime_flags();
        let new = old.patch(patch);
        self.update_runtime_flags(old.diff(new));
        let out = body.await;
        self.update_runtime_flags(new.diff(old));
        let value = out?;
        self.check_interrupt::<E>()?;
        Ok(value)
    }

    /// Run `body` with interruption disabled. An interrupt that arrived
    /// meanwhile takes effect once the region ends, if the fiber is then
    /// interruptible.
    pub async fn uninterruptible<T, E, F>(&self, body: F) -> Result<T, Cause<E>>
    where
        F: Future<Output = Result<T, Cause<E>>>,
    {
        self.with_runtime_flags(RuntimeFlagsPatch::disable(RuntimeFlag::Interruption), body)
            .await
    }

    pub async fn interruptible<T, E, F>(&self, body: F) -> Result<T, Cause<E>>
    where
        F: Future<Output = Result<T, Cause<E>>>,
    {
        self.with_runtime_flags(RuntimeFlagsPatch::enable(RuntimeFlag::Interruption), async {
            self.check_interrupt::<E>()?;
            body.await
        })
        .await
    }

    /// Uninterruptible region whose body may re-enable the interruptibility
    /// that was in effect on entry.
    pub async fn uninterruptible_mask<T, E, F, Fut>(&self, f: F) -> Result<T, Cause<E>>
    where
        F: FnOnce(InterruptibilityRestorer) -> Fut,
        Fut: Future<Output = Result<T, Cause<E>>>,
    {
        let restorer = InterruptibilityRestorer {
            cx: self.clone(),
            restore: self.runtime_flags().interruption(),
        };
        self.uninterruptible(f(restorer)).await
    }

    // -- interruption -------------------------------------------------------

    pub fn is_interrupted(&self) -> bool {
        !self.core.interruptors().is_empty()
    }

    /// Every interruption requested against this fiber so far.
    pub fn interrupt_cause(&self) -> Cause<Infallible> {
        self.core.interruptors()
    }

    /// `Err` with the interruption cause if an interrupt is pending and the
    /// fiber may honor it.
    pub fn check_interrupt<E>(&self) -> Result<(), Cause<E>> {
        if !self.runtime_flags().interruptible() {
            return Ok(());
        }
        let cause = self.core.interruptors();
        if cause.is_empty() {
            Ok(())
        } else {
            Err(cause.widen())
        }
    }

    /// Complete `deferred` with an interruption by this fiber.
    pub fn interrupt_deferred<A, E>(&self, deferred: &Deferred<A, E>) -> bool
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        deferred.interrupt_as(self.fiber_id())
    }

    // -- refs ---------------------------------------------------------------

    pub fn fiber_refs(&self) -> FiberRefs {
        self.core.refs()
    }

    pub fn set_fiber_refs(&self, refs: FiberRefs) {
        self.core.state.lock().refs = refs;
    }

    pub fn get_ref<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> A {
        self.core.state.lock().refs.get_or_default(fiber_ref)
    }

    pub fn set_ref<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>, value: A) {
        let mut state = self.core.state.lock();
        state.refs = state.refs.updated_as(self.core.id, fiber_ref, value);
    }

    pub fn update_ref<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>, f: impl FnOnce(&A) -> A) {
        let current = self.get_ref(fiber_ref);
        self.set_ref(fiber_ref, f(&current));
    }

    /// Run `body` with `fiber_ref` set to `value`, restoring the previous
    /// value afterwards.
    pub async fn locally<A, T, E, F>(&self, fiber_ref: &FiberRef<A>, value: A, body: F) -> Result<T, Cause<E>>
    where
        A: FiberRefValue,
        F: Future<Output = Result<T, Cause<E>>>,
    {
        let previous = self.get_ref(fiber_ref);
        self.set_ref(fiber_ref, value);
        let out = body.await;
        self.set_ref(fiber_ref, previous);
        out
    }

    // -- forking and waiting -----------------------------------------------

    /// Start `effect` as a child. The child inherits this fiber's refs
    /// (through each ref's fork) and runtime flags.
    pub fn fork<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let child_id = self.core.next_child_id();
        let (refs, flags) = {
            let state = self.core.state.lock();
            (state.refs.fork_as(child_id), state.flags)
        };
        let scheduler = refs
            .get_or_default(current_scheduler())
            .0
            .unwrap_or_else(|| self.core.scheduler.clone());
        spawn(
            FiberSpawn {
                id: child_id,
                parent: Some(self.fiber_id()),
                refs,
                flags,
                scheduler,
                id_generator: self.core.id_generator.clone(),
                report_unhandled: false,
            },
            effect,
            None,
        )
    }

    /// Suspend until `deferred` completes. If this fiber is interrupted
    /// while waiting interruptibly, returns its interruption cause instead.
    pub async fn await_deferred<A, E>(&self, deferred: &Deferred<A, E>) -> Result<A, Cause<E>>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        match self.await_raw(deferred).await {
            Ok(exit) => exit.into_result(),
            Err(interrupted) => Err(interrupted.widen()),
        }
    }

    pub(crate) async fn await_raw<A, E>(&self, deferred: &Deferred<A, E>) -> Result<Exit<A, E>, Cause<Infallible>>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        if let Some(exit) = deferred.poll() {
            return Ok(exit);
        }
        let interruptible = self.runtime_flags().interruptible();
        if interruptible {
            let cause = self.core.interruptors();
            if !cause.is_empty() {
                return Err(cause);
            }
        }

        self.core.set_phase(Phase::Suspended(deferred.blocking_on().clone()));
        let outcome = if interruptible {
            match select(deferred.await_exit(), self.core.interrupt_signal.await_exit()).await {
                Either::Left((exit, _)) => Ok(exit),
                Either::Right(_) => Err(self.core.interruptors()),
            }
        } else {
            Ok(deferred.await_exit().await)
        };
        self.core.set_phase(Phase::Running);
        outcome
    }

    /// Give other fibers a turn.
    pub async fn yield_now(&self) {
        self.core.ops_since_yield.store(0, Ordering::Relaxed);
        YieldOnce { yielded: false }.await
    }

    /// Count one step against the yield budget and yield if the scheduler
    /// says the budget is spent. No-op without `CooperativeYielding`.
    pub async fn maybe_yield(&self) {
        if !self.runtime_flags().cooperative_yielding() {
            return;
        }
        let ops = self.core.ops_since_yield.fetch_add(1, Ordering::Relaxed) + 1;
        let max_ops = self.get_ref(current_max_ops_before_yield());
        if self.core.scheduler.should_yield(ops, max_ops) {
            self.yield_now().await;
        }
    }

    /// Merge a finished child's refs and runtime flags into this fiber.
    /// Interruptibility and wind-down are never inherited.
    pub(crate) fn inherit_all(&self, child: &FiberCore) {
        let (child_refs, child_flags) = {
            let state = child.state.lock();
            (state.refs.clone(), state.flags)
        };
        let mut state = self.core.state.lock();
        state.refs = state.refs.join_as(self.core.id, &child_refs);
        let patch = state
            .flags
            .diff(child_flags)
            .exclude(RuntimeFlag::Interruption)
            .exclude(RuntimeFlag::WindDown);
        state.flags = state.flags.patch(patch);
    }
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext").field("id", &self.core.id).finish()
    }
}

/// Re-enables the interruptibility in effect when an
/// `uninterruptible_mask` region was entered.
pub struct InterruptibilityRestorer {
    cx: FiberContext,
    restore: bool,
}

impl InterruptibilityRestorer {
    pub async fn restore<T, E, F>(&self, body: F) -> Result<T, Cause<E>>
    where
        F: Future<Output = Result<T, Cause<E>>>,
    {
        if self.restore {
            self.cx.interruptible(body).await
        } else {
            body.await
        }
    }
}

struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// Spawning and driving
// ---------------------------------------------------------------------------

pub(crate) struct FiberSpawn {
    pub id: RuntimeFiberId,
    pub parent: Option<FiberId>,
    pub refs: FiberRefs,
    pub flags: RuntimeFlags,
    pub scheduler: Arc<dyn Scheduler>,
    pub id_generator: Option<Arc<FiberIdGenerator>>,
    /// Log the failure if nothing observes the exit.
    pub report_unhandled: bool,
}

/// Build the fiber, announce it, and submit its first step. `on_exit` is
/// attached before the first step so it counts as a waiter.
pub(crate) fn spawn<A, E>(
    spawn: FiberSpawn,
    effect: Effect<A, E>,
    on_exit: Option<Box<dyn FnOnce(Exit<A, E>) + Send>>,
) -> Fiber<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let FiberSpawn {
        id,
        parent,
        refs,
        flags,
        scheduler,
        id_generator,
        report_unhandled,
    } = spawn;
    let supervisor = refs.get_or_default(current_supervisor());
    let tracked = flags.fiber_roots();

    let core = Arc::new(FiberCore {
        id,
        parent,
        state: Mutex::new(FiberState {
            refs,
            flags,
            phase: Phase::Running,
        }),
        interrupt_signal: Deferred::make(FiberId::Runtime(id)),
        scheduler: scheduler.clone(),
        id_generator,
        ops_since_yield: AtomicU32::new(0),
    });
    let exit = Deferred::make(FiberId::Runtime(id));
    if let Some(callback) = on_exit {
        exit.add_observer(callback);
    }
    let fiber = Fiber {
        core: core.clone(),
        exit: exit.clone(),
    };

    tracing::debug!(fiber = %id, parent = ?core.parent, flags = %flags, "fiber forked");
    supervisor.on_start(id, core.parent.as_ref(), flags);
    if tracked {
        registry::register(&core);
    }

    let cx = FiberContext { core };
    let driver = drive(cx, effect, exit, supervisor, tracked, report_unhandled);
    FiberTask::new(id, Box::pin(driver), scheduler).schedule();
    fiber
}

async fn drive<A, E>(
    cx: FiberContext,
    effect: Effect<A, E>,
    exit_cell: Deferred<A, E>,
    supervisor: SupervisorRef,
    tracked: bool,
    report_unhandled: bool,
) where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let exit: Exit<A, E> = match cx.check_interrupt::<E>() {
        // Interrupted before its first step.
        Err(cause) => Exit::fail_cause(cause),
        Ok(()) => match std::panic::catch_unwind(AssertUnwindSafe(|| effect.run(cx.clone()))) {
            Err(payload) => Exit::die(Defect::from_panic(payload)),
            Ok(body) => {
                let guarded = WithCurrentFiber {
                    cx: cx.clone(),
                    inner: AssertUnwindSafe(body).catch_unwind(),
                };
                match guarded.await {
                    // A pending interrupt still lands on a body that
                    // finished without another check.
                    Ok(Ok(value)) => match cx.check_interrupt::<E>() {
                        Ok(()) => Exit::succeed(value),
                        Err(cause) => Exit::fail_cause(cause),
                    },
                    Ok(Err(cause)) => Exit::fail_cause(cause),
                    Err(payload) => Exit::die(Defect::from_panic(payload)),
                }
            }
        },
    };

    cx.core.set_phase(Phase::Done);
    if tracked {
        registry::unregister(cx.id());
    }
    let erased = exit.erase();
    tracing::trace!(fiber = %cx.id(), success = erased.is_success(), "fiber done");
    supervisor.on_end(cx.id(), &erased);
    if report_unhandled && exit_cell.waiter_count() == 0 {
        log_unhandled(&cx, &erased);
    }
    exit_cell.done(exit);
}

/// Log a failure that no one is waiting for.
fn log_unhandled(cx: &FiberContext, exit: &Exit<(), ()>) {
    let Exit::Failure(cause) = exit else { return };
    if cause.is_interrupted_only() {
        return;
    }
    let Some(level) = cx.get_ref(unhandled_errors_log_level()) else {
        return;
    };
    let fiber = cx.id();
    if level == Level::ERROR {
        tracing::error!(fiber = %fiber, cause = %cause, "fiber terminated with an unhandled error");
    } else if level == Level::WARN {
        tracing::warn!(fiber = %fiber, cause = %cause, "fiber terminated with an unhandled error");
    } else if level == Level::INFO {
        tracing::info!(fiber = %fiber, cause = %cause, "fiber terminated with an unhandled error");
    } else if level == Level::DEBUG {
        tracing::debug!(fiber = %fiber, cause = %cause, "fiber terminated with an unhandled error");
    } else {
        tracing::trace!(fiber = %fiber, cause = %cause, "fiber terminated with an unhandled error");
    }
}

/// Publishes the fiber as the thread's current fiber while it is polled,
/// when `CurrentFiber` is enabled.
struct WithCurrentFiber<F> {
    cx: FiberContext,
    inner: F,
}

impl<F: Future + Unpin> Future for WithCurrentFiber<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, task: &mut TaskContext<'_>) -> Poll<F::Output> {
        if !self.cx.runtime_flags().current_fiber() {
            return Pin::new(&mut self.inner).poll(task);
        }
        let id = self.cx.id();
        let previous = CURRENT_FIBER.with(|cell| cell.borrow_mut().replace(id));
        let out = Pin::new(&mut self.inner).poll(task);
        CURRENT_FIBER.with(|cell| *cell.borrow_mut() = previous);
        out
    }
}
