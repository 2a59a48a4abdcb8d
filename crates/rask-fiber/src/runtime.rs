// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Top-level driver.
//!
//! A `Runtime` bundles the service context, runtime flags, and ref snapshot
//! that new root fibers start from, and offers the entry points that start
//! effects from outside any fiber: fire-and-forget, synchronous, and
//! future-based.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::deferred::{AwaitExit, Deferred};
use crate::effect::Effect;
use crate::error::{ConfigError, RunError};
use crate::exit::{Cause, Defect, Exit};
use crate::fiber::{spawn, Fiber, FiberSpawn};
use crate::fiber_id::{FiberId, FiberIdGenerator, RuntimeFiberId};
use crate::fiber_refs::builtin::{
    current_context, current_max_ops_before_yield, current_scheduler, current_supervisor,
    unhandled_errors_log_level,
};
use crate::fiber_refs::{FiberRef, FiberRefValue, FiberRefs};
use crate::runtime_flags::{RuntimeFlags, RuntimeFlagsPatch};
use crate::scheduler::{HostScheduler, Scheduler, SchedulerRef, SyncScheduler};
use crate::supervisor::{Supervisor, SupervisorRef};

/// Callback receiving a fiber's exit.
pub type ExitCallback<A, E> = Box<dyn FnOnce(Exit<A, E>) + Send>;

/// Per-fork overrides.
#[derive(Clone, Default)]
pub struct ForkOptions {
    /// Run the fiber, and by default its children, on this scheduler.
    pub scheduler: Option<Arc<dyn Scheduler>>,
    /// Reported to the supervisor and in fiber dumps.
    pub parent: Option<FiberId>,
}

impl fmt::Debug for ForkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkOptions")
            .field("scheduler", &self.scheduler.is_some())
            .field("parent", &self.parent)
            .finish()
    }
}

#[derive(Clone)]
pub struct Runtime {
    context: Context,
    runtime_flags: RuntimeFlags,
    fiber_refs: FiberRefs,
    id_generator: Option<Arc<FiberIdGenerator>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(Context::empty(), RuntimeFlags::DEFAULT, FiberRefs::empty())
    }
}

impl Runtime {
    pub fn new(context: Context, runtime_flags: RuntimeFlags, fiber_refs: FiberRefs) -> Self {
        Self {
            context,
            runtime_flags,
            fiber_refs,
            id_generator: None,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let level = config.log_level()?;
        if config.host_worker_threads > 0 && !HostScheduler::configure_global(config.host_worker_threads) {
            tracing::warn!(
                workers = config.host_worker_threads,
                "host runtime already running; worker count not applied"
            );
        }
        Ok(Runtime::default()
            .with_runtime_flags(config.flags())
            .with_fiber_ref(current_max_ops_before_yield(), config.max_ops_before_yield)
            .with_fiber_ref(unhandled_errors_log_level(), level))
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn runtime_flags(&self) -> RuntimeFlags {
        self.runtime_flags
    }

    pub fn fiber_refs(&self) -> &FiberRefs {
        &self.fiber_refs
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_runtime_flags(mut self, runtime_flags: RuntimeFlags) -> Self {
        self.runtime_flags = runtime_flags;
        self
    }

    pub fn update_runtime_flags(mut self, patch: RuntimeFlagsPatch) -> Self {
        self.runtime_flags = self.runtime_flags.patch(patch);
        self
    }

    pub fn with_fiber_refs(mut self, fiber_refs: FiberRefs) -> Self {
        self.fiber_refs = fiber_refs;
        self
    }

    /// Default value of `fiber_ref` for every fiber this runtime starts.
    pub fn with_fiber_ref<A: FiberRefValue>(mut self, fiber_ref: &FiberRef<A>, value: A) -> Self {
        self.fiber_refs = self
            .fiber_refs
            .updated_as(RuntimeFiberId::ROOT, fiber_ref, value);
        self
    }

    pub fn with_supervisor(self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.with_fiber_ref(current_supervisor(), SupervisorRef::new(supervisor))
    }

    pub fn with_scheduler(self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.with_fiber_ref(current_scheduler(), SchedulerRef::new(scheduler))
    }

    /// Draw fiber ids from `generator` instead of the process-wide one.
    pub fn with_id_generator(mut self, generator: Arc<FiberIdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    fn next_id(&self) -> RuntimeFiberId {
        match &self.id_generator {
            Some(generator) => generator.make(),
            None => FiberIdGenerator::global().make(),
        }
    }

    // -- forking ------------------------------------------------------------

    /// Start `effect` as a new root fiber. Never fails.
    pub fn unsafe_fork<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        self.fork_observed(effect, ForkOptions::default(), None, false)
    }

    pub fn unsafe_fork_with<A, E>(&self, effect: Effect<A, E>, options: ForkOptions) -> Fiber<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        self.fork_observed(effect, options, None, false)
    }

    fn fork_observed<A, E>(
        &self,
        effect: Effect<A, E>,
        options: ForkOptions,
        on_exit: Option<ExitCallback<A, E>>,
        report_unhandled: bool,
    ) -> Fiber<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let id = self.next_id();
        let mut refs = self
            .fiber_refs
            .updated_as(id, current_context(), self.context.clone());
        if let Some(scheduler) = &options.scheduler {
            refs = refs.updated_as(id, current_scheduler(), SchedulerRef::new(scheduler.clone()));
        }
        let refs = refs.fork_as(id);
        let scheduler = match options.scheduler {
            Some(scheduler) => scheduler,
            None => refs.get_or_default(current_scheduler()).resolve(),
        };
        spawn(
            FiberSpawn {
                id,
                parent: options.parent,
                refs,
                flags: self.runtime_flags,
                scheduler,
                id_generator: self.id_generator.clone(),
                report_unhandled,
            },
            effect,
            on_exit,
        )
    }

    // -- running ------------------------------------------------------------

    /// Start `effect`, delivering its exit to `on_exit` if given. Without
    /// an observer a failure is logged at `unhandled_errors_log_level`.
    /// The returned handle can interrupt the fiber.
    pub fn unsafe_run<A, E>(&self, effect: Effect<A, E>, on_exit: Option<ExitCallback<A, E>>) -> Cancel<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let report_unhandled = on_exit.is_none();
        let fiber = self.fork_observed(effect, ForkOptions::default(), on_exit, report_unhandled);
        Cancel {
            runtime: self.clone(),
            fiber,
        }
    }

    /// Run `effect` to completion on the calling thread. If it suspends on
    /// work that only completes asynchronously, the exit is an
    /// [`Defect::AsyncFiber`] naming the fiber, which keeps running on the
    /// host scheduler.
    pub fn unsafe_run_sync_exit<A, E>(&self, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let scheduler = Arc::new(SyncScheduler::new(HostScheduler::current()));
        let options = ForkOptions {
            scheduler: Some(scheduler.clone()),
            parent: None,
        };
        let fiber = self.fork_observed(effect, options, None, false);
        scheduler.flush();
        match fiber.poll() {
            Some(exit) => exit,
            None => {
                tracing::warn!(
                    fiber = %fiber.id(),
                    status = %fiber.status(),
                    "synchronous run suspended on asynchronous work"
                );
                Exit::die(Defect::async_fiber(fiber.fiber_id()))
            }
        }
    }

    pub fn unsafe_run_sync<A, E>(&self, effect: Effect<A, E>) -> Result<A, RunError<E>>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        self.unsafe_run_sync_exit(effect)
            .into_result()
            .map_err(Cause::squash)
    }

    /// Start `effect` now; the returned future resolves with its exit.
    pub fn unsafe_run_promise_exit<A, E>(&self, effect: Effect<A, E>) -> AwaitExit<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let result: Deferred<A, E> = Deferred::make(FiberId::None);
        let cell = result.clone();
        self.fork_observed(
            effect,
            ForkOptions::default(),
            Some(Box::new(move |exit: Exit<A, E>| cell.unsafe_done(exit))),
            false,
        );
        result.await_exit()
    }

    /// Start `effect` now; the returned future resolves with its value or
    /// the squashed failure.
    pub fn unsafe_run_promise<A, E>(
        &self,
        effect: Effect<A, E>,
    ) -> impl Future<Output = Result<A, RunError<E>>> + Send + 'static
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let exit = self.unsafe_run_promise_exit(effect);
        async move { exit.await.into_result().map_err(Cause::squash) }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.context)
            .field("runtime_flags", &self.runtime_flags)
            .field("fiber_refs", &self.fiber_refs)
            .finish()
    }
}

/// Handle returned by [`Runtime::unsafe_run`].
pub struct Cancel<A, E> {
    runtime: Runtime,
    fiber: Fiber<A, E>,
}

impl<A, E> Cancel<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn fiber(&self) -> &Fiber<A, E> {
        &self.fiber
    }

    /// Interrupt the fiber as `fiber_id` (or as no fiber) and deliver its
    /// final exit to `on_exit`. The interruption itself runs as a new fiber
    /// on the same runtime.
    pub fn cancel(self, fiber_id: Option<FiberId>, on_exit: Option<ExitCallback<A, E>>) {
        let fiber = self.fiber;
        let by = fiber_id.unwrap_or(FiberId::None);
        let interrupt = Effect::<Exit<A, E>, E>::new(move |_| async move { Ok(fiber.interrupt_as(by).await) });
        let on_exit = on_exit.map(|callback| {
            Box::new(move |exit: Exit<Exit<A, E>, E>| callback(exit.flatten())) as ExitCallback<Exit<A, E>, E>
        });
        self.runtime.unsafe_run(interrupt, on_exit);
    }
}

impl<A, E> fmt::Debug for Cancel<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel").field("fiber", &self.fiber).finish()
    }
}
