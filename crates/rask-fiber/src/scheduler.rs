// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Where fiber tasks get polled.
//!
//! `HostScheduler` hands tasks to a tokio runtime. `SyncScheduler` buffers
//! tasks so a synchronous run can drain them on the calling thread, then
//! forwards anything scheduled afterwards to its fallback.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime as TokioRuntime};

use crate::task::FiberTask;

/// Executes fiber tasks.
pub trait Scheduler: Send + Sync + 'static {
    /// Arrange for `task.run()` to be called.
    fn schedule(&self, task: Arc<FiberTask>);

    /// Whether a fiber that has performed `ops` steps since its last yield
    /// should yield now, given its budget.
    fn should_yield(&self, ops: u32, max_ops: u32) -> bool {
        ops >= max_ops
    }
}

/// Identity of a scheduler stored in a fiber ref.
#[derive(Clone)]
pub struct SchedulerRef(pub Option<Arc<dyn Scheduler>>);

impl SchedulerRef {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        SchedulerRef(Some(scheduler))
    }

    /// The stored scheduler, or the host scheduler when unset.
    pub fn resolve(&self) -> Arc<dyn Scheduler> {
        match &self.0 {
            Some(scheduler) => scheduler.clone(),
            None => HostScheduler::current(),
        }
    }
}

impl PartialEq for SchedulerRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            _ => false,
        }
    }
}

impl fmt::Debug for SchedulerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("SchedulerRef(custom)"),
            None => f.write_str("SchedulerRef(host)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Host scheduler
// ---------------------------------------------------------------------------

static HOST_RUNTIME: OnceLock<Option<TokioRuntime>> = OnceLock::new();
static HOST_WORKER_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Runs each task step as a tokio task.
pub struct HostScheduler {
    handle: Option<Handle>,
}

impl HostScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Scheduler on the ambient tokio runtime, or on the process-wide host
    /// runtime when called outside of one.
    pub fn current() -> Arc<dyn Scheduler> {
        match Handle::try_current() {
            Ok(handle) => Arc::new(HostScheduler::new(handle)),
            Err(_) => HostScheduler::global(),
        }
    }

    /// Scheduler on the process-wide host runtime, built on first use.
    pub fn global() -> Arc<dyn Scheduler> {
        let handle = host_runtime().map(|rt| rt.handle().clone());
        Arc::new(HostScheduler { handle })
    }

    /// Worker count for the process-wide runtime; 0 picks the core count.
    /// Returns false if the runtime was already built.
    pub fn configure_global(worker_threads: usize) -> bool {
        HOST_WORKER_THREADS.store(worker_threads, Ordering::Release);
        HOST_RUNTIME.get().is_none()
    }
}

impl Scheduler for HostScheduler {
    fn schedule(&self, task: Arc<FiberTask>) {
        match &self.handle {
            Some(handle) => {
                handle.spawn(async move { task.run() });
            }
            None => task.run(),
        }
    }
}

fn host_runtime() -> Option<&'static TokioRuntime> {
    HOST_RUNTIME
        .get_or_init(|| {
            let requested = HOST_WORKER_THREADS.load(Ordering::Acquire);
            let workers = if requested == 0 {
                thread::available_parallelism()
                    .map(|p| p.get())
                    .unwrap_or(4)
            } else {
                requested
            };
            match Builder::new_multi_thread()
                .worker_threads(workers)
                .thread_name("fiber-host")
                .enable_all()
                .build()
            {
                Ok(rt) => {
                    tracing::debug!(workers, "host runtime started");
                    Some(rt)
                }
                Err(err) => {
                    // Tasks then run inline on whichever thread wakes them.
                    tracing::error!(error = %err, "cannot start host runtime");
                    None
                }
            }
        })
        .as_ref()
}

// ---------------------------------------------------------------------------
// Sync scheduler
// ---------------------------------------------------------------------------

struct SyncQueue {
    tasks: VecDeque<Arc<FiberTask>>,
    deferred: bool,
}

/// Buffers tasks until `flush`. Once flushed, later tasks go to the
/// fallback scheduler.
pub struct SyncScheduler {
    queue: Mutex<SyncQueue>,
    fallback: Arc<dyn Scheduler>,
}

impl SyncScheduler {
    pub fn new(fallback: Arc<dyn Scheduler>) -> Self {
        Self {
            queue: Mutex::new(SyncQueue {
                tasks: VecDeque::new(),
                deferred: false,
            }),
            fallback,
        }
    }

    /// Run buffered tasks on the calling thread, including tasks they
    /// schedule, until none remain. Then switch to forwarding mode.
    pub fn flush(&self) {
        let mut ran = 0usize;
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.deferred = true;
                        break;
                    }
                }
            };
            next.run();
            ran += 1;
        }
        tracing::trace!(ran, "sync scheduler flushed");
    }

    pub fn is_deferred(&self) -> bool {
        self.queue.lock().deferred
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }
}

impl Scheduler for SyncScheduler {
    fn schedule(&self, task: Arc<FiberTask>) {
        {
            let mut queue = self.queue.lock();
            if !queue.deferred {
                queue.tasks.push_back(task);
                return;
            }
        }
        self.fallback.schedule(task);
    }
}
