// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pollable unit of work behind every fiber.
//!
//! A task owns the fiber's type-erased driver future. Wakers re-submit the
//! task to the scheduler it was created with; the state machine guarantees
//! a task is queued at most once and never polled concurrently.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

use crate::fiber_id::RuntimeFiberId;
use crate::scheduler::Scheduler;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Task lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Suspended, waiting for a waker.
    Idle = 0,
    /// Handed to the scheduler, not yet polled.
    Scheduled = 1,
    /// Being polled.
    Running = 2,
    /// Woken while being polled; re-submitted once the poll returns.
    Notified = 3,
    /// Driver finished; the future has been dropped.
    Complete = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Scheduled,
            2 => Self::Running,
            3 => Self::Notified,
            _ => Self::Complete,
        }
    }
}

pub struct FiberTask {
    fiber_id: RuntimeFiberId,
    state: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    scheduler: Arc<dyn Scheduler>,
}

impl FiberTask {
    pub(crate) fn new(
        fiber_id: RuntimeFiberId,
        future: BoxFuture,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fiber_id,
            state: AtomicU8::new(TaskState::Idle as u8),
            future: Mutex::new(Some(future)),
            scheduler,
        })
    }

    pub fn fiber_id(&self) -> RuntimeFiberId {
        self.fiber_id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_complete(&self) -> bool {
        self.state() == TaskState::Complete
    }

    /// Submit the task to its scheduler unless it is already queued,
    /// running, or finished. A wake during a poll is remembered and
    /// replayed when the poll returns.
    pub(crate) fn schedule(self: &Arc<Self>) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let next = match TaskState::from_u8(current) {
                TaskState::Idle => TaskState::Scheduled,
                TaskState::Running => TaskState::Notified,
                TaskState::Scheduled | TaskState::Notified | TaskState::Complete => return,
            };
            if self
                .state
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if next == TaskState::Scheduled {
                    self.scheduler.schedule(self.clone());
                }
                return;
            }
        }
    }

    /// Poll the driver once. Called by schedulers for each dequeued task.
    pub fn run(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                TaskState::Scheduled as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Stale entry: already run or finished.
            return;
        }

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let finished = {
            let mut slot = self.future.lock();
            match slot.as_mut() {
                None => true,
                Some(fut) => match fut.as_mut().poll(&mut cx) {
                    Poll::Ready(()) => {
                        *slot = None;
                        true
                    }
                    Poll::Pending => false,
                },
            }
        };

        if finished {
            self.state.store(TaskState::Complete as u8, Ordering::Release);
            return;
        }

        if self
            .state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Woken mid-poll.
            self.state.store(TaskState::Scheduled as u8, Ordering::Release);
            self.scheduler.schedule(self.clone());
        }
    }
}

impl Wake for FiberTask {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

impl fmt::Debug for FiberTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberTask")
            .field("fiber_id", &self.fiber_id)
            .field("state", &self.state())
            .finish()
    }
}
