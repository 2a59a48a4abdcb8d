// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-assignment cell that fibers can suspend on.
//!
//! A `Deferred` starts pending and is completed at most once with an `Exit`.
//! Waiters registered before completion are resumed with that exit; waiters
//! arriving later observe it immediately.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::exit::{Cause, Defect, Exit};
use crate::fiber_id::FiberId;

type Callback<A, E> = Box<dyn FnOnce(Exit<A, E>) + Send>;

struct Waiter<A, E> {
    id: u64,
    callback: Callback<A, E>,
}

enum State<A, E> {
    Pending(Vec<Waiter<A, E>>),
    Done(Exit<A, E>),
}

struct Inner<A, E> {
    state: Mutex<State<A, E>>,
    blocking_on: FiberId,
    next_waiter: AtomicU64,
}

/// A one-shot, multi-reader completion cell.
pub struct Deferred<A, E> {
    inner: Arc<Inner<A, E>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, E> Deferred<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// A pending cell. `blocking_on` names the fiber expected to complete
    /// it and is reported in the status of fibers waiting on it.
    pub fn make(blocking_on: FiberId) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                blocking_on,
                next_waiter: AtomicU64::new(0),
            }),
        }
    }

    pub fn blocking_on(&self) -> &FiberId {
        &self.inner.blocking_on
    }

    /// Complete with `exit`. Returns `false` if the cell was already done;
    /// the earlier exit is kept.
    pub fn done(&self, exit: Exit<A, E>) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Done(exit.clone());
                    waiters
                }
            }
        };
        tracing::trace!(
            blocking_on = %self.inner.blocking_on,
            waiters = waiters.len(),
            "deferred completed"
        );
        // Callbacks run outside the lock; they may re-enter this cell.
        for waiter in waiters {
            (waiter.callback)(exit.clone());
        }
        true
    }

    /// Complete without reporting whether this call won.
    pub fn unsafe_done(&self, exit: Exit<A, E>) {
        if !self.done(exit) {
            tracing::trace!(blocking_on = %self.inner.blocking_on, "deferred already completed");
        }
    }

    pub fn complete(&self, result: Result<A, Cause<E>>) -> bool {
        self.done(result.into())
    }

    pub fn succeed(&self, value: A) -> bool {
        self.done(Exit::succeed(value))
    }

    pub fn fail(&self, error: E) -> bool {
        self.done(Exit::fail(error))
    }

    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.done(Exit::fail_cause(cause))
    }

    pub fn die(&self, defect: Defect) -> bool {
        self.done(Exit::die(defect))
    }

    pub fn interrupt_as(&self, fiber_id: FiberId) -> bool {
        self.done(Exit::interrupt(fiber_id))
    }

    /// The exit, if already completed. Never suspends.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        match &*self.inner.state.lock() {
            State::Pending(_) => None,
            State::Done(exit) => Some(exit.clone()),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Number of callbacks currently waiting for completion.
    pub fn waiter_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Pending(waiters) => waiters.len(),
            State::Done(_) => 0,
        }
    }

    /// Run `callback` with the exit once it is available. Runs immediately
    /// on the calling thread if the cell is already done.
    pub fn add_observer(&self, callback: impl FnOnce(Exit<A, E>) + Send + 'static) {
        let _ = self.register(Box::new(callback));
    }

    /// Future resolving to the exit. Dropping it before completion
    /// unregisters its waiter.
    pub fn await_exit(&self) -> AwaitExit<A, E> {
        AwaitExit {
            deferred: self.clone(),
            waker: Arc::new(Mutex::new(None)),
            waiter: None,
        }
    }

    /// Register a callback; returns its id if it was queued rather than run.
    fn register(&self, callback: Callback<A, E>) -> Option<u64> {
        let exit = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(waiters) => {
                    let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
                    waiters.push(Waiter { id, callback });
                    return Some(id);
                }
                State::Done(exit) => exit.clone(),
            }
        };
        callback(exit);
        None
    }

    fn unregister(&self, id: u64) {
        if let State::Pending(waiters) = &mut *self.inner.state.lock() {
            waiters.retain(|w| w.id != id);
        }
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Deferred")
            .field("blocking_on", &self.inner.blocking_on)
            .field("done", &done)
            .finish()
    }
}

/// Future returned by [`Deferred::await_exit`].
pub struct AwaitExit<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    deferred: Deferred<A, E>,
    waker: Arc<Mutex<Option<Waker>>>,
    waiter: Option<u64>,
}

impl<A, E> Future for AwaitExit<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(exit) = this.deferred.poll() {
            this.waiter = None;
            return Poll::Ready(exit);
        }
        *this.waker.lock() = Some(cx.waker().clone());
        if this.waiter.is_none() {
            let slot = this.waker.clone();
            this.waiter = this.deferred.register(Box::new(move |_exit| {
                if let Some(waker) = slot.lock().take() {
                    waker.wake();
                }
            }));
            if this.waiter.is_none() {
                // Completed between the check and registration.
                if let Some(exit) = this.deferred.poll() {
                    return Poll::Ready(exit);
                }
            }
        }
        Poll::Pending
    }
}

impl<A, E> Drop for AwaitExit<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(id) = self.waiter.take() {
            self.deferred.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cell() -> Deferred<i32, String> {
        Deferred::make(FiberId::runtime(1, 0))
    }

    #[test]
    fn first_completion_wins() {
        let d = cell();
        assert!(d.succeed(1));
        assert!(!d.succeed(2));
        assert!(!d.fail("late".into()));
        assert_eq!(d.poll(), Some(Exit::succeed(1)));
    }

    #[test]
    fn poll_does_not_suspend() {
        let d = cell();
        assert_eq!(d.poll(), None);
        assert!(!d.is_done());
        d.unsafe_done(Exit::fail("boom".into()));
        assert!(d.is_done());
        assert_eq!(d.poll(), Some(Exit::fail("boom".to_string())));
    }

    #[test]
    fn observers_fire_once_with_final_exit() {
        let d = cell();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            d.add_observer(move |exit| {
                assert_eq!(exit, Exit::succeed(7));
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(d.waiter_count(), 3);
        d.succeed(7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let late = hits.clone();
        d.add_observer(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn dropped_await_unregisters() {
        let d = cell();
        {
            let mut fut = d.await_exit();
            let waker = futures_util::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
            assert_eq!(d.waiter_count(), 1);
        }
        assert_eq!(d.waiter_count(), 0);
    }

    #[test]
    fn interrupt_as_records_interruptor() {
        let d = cell();
        let by = FiberId::runtime(9, 0);
        assert!(d.interrupt_as(by.clone()));
        let exit = d.poll().unwrap();
        assert!(exit.is_interrupted());
        assert!(exit.cause().unwrap().interruptors().contains(&by));
    }

    #[tokio::test]
    async fn concurrent_waiters_see_single_exit() {
        let d = cell();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.await_exit().await })
            })
            .collect();

        let completers: Vec<_> = (0..8)
            .map(|n| {
                let d = d.clone();
                std::thread::spawn(move || d.succeed(n))
            })
            .collect();
        let wins = completers
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let expected = d.poll().unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), expected);
        }
    }
}
