// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Hierarchical resource scopes.
//!
//! A scope collects finalizers and runs each of them exactly once when it
//! closes. Child scopes forked from a parent are closed by the parent if
//! nobody closed them first, so no finalizer outlives its root scope.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{join_all, BoxFuture};
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::exit::{Cause, Defect, Exit, ScopeExit};
use crate::fiber::FiberContext;
use crate::runtime_flags::{RuntimeFlag, RuntimeFlagsPatch};

/// How a closing scope runs its finalizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// One after another, in registration order.
    #[default]
    Sequential,
    /// All at once.
    Parallel,
    /// At most `n` at a time.
    ParallelN(usize),
}

type Finalizer = Box<dyn FnOnce(ScopeExit) -> BoxFuture<'static, Exit<(), Infallible>> + Send>;

/// Registration handle, usable with [`Scope::remove_finalizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizerKey(u64);

enum ScopeState {
    Open {
        finalizers: Vec<(FinalizerKey, Finalizer)>,
        next_key: u64,
    },
    Closed(ScopeExit),
}

struct ScopeInner {
    id: u64,
    strategy: ExecutionStrategy,
    state: Mutex<ScopeState>,
    /// Parent and the key of the finalizer that closes this scope there.
    parent: Mutex<Option<(Weak<ScopeInner>, FinalizerKey)>>,
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub fn make(strategy: ExecutionStrategy) -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                strategy,
                state: Mutex::new(ScopeState::Open {
                    finalizers: Vec::new(),
                    next_key: 0,
                }),
                parent: Mutex::new(None),
            }),
        }
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.inner.strategy
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.state.lock(), ScopeState::Closed(_))
    }

    /// Exit the scope was closed with.
    pub fn closed_with(&self) -> Option<ScopeExit> {
        match &*self.inner.state.lock() {
            ScopeState::Open { .. } => None,
            ScopeState::Closed(exit) => Some(exit.clone()),
        }
    }

    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.len(),
            ScopeState::Closed(_) => 0,
        }
    }

    /// Register `finalizer` to run with the close exit. On a scope that is
    /// already closed it runs right away with the recorded exit, and its
    /// outcome is returned.
    pub async fn add_finalizer<F, Fut>(&self, finalizer: F) -> Exit<(), Infallible>
    where
        F: FnOnce(ScopeExit) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Finalizer = Box::new(move |exit| {
            let fut = finalizer(exit);
            async move {
                fut.await;
                Exit::Success(())
            }
            .boxed()
        });
        match self.try_add(boxed) {
            Ok(_) => Exit::Success(()),
            Err((finalizer, exit)) => run_one(finalizer, exit).await,
        }
    }

    /// Register a finalizer that does not look at the close exit.
    pub async fn on_close<Fut>(&self, finalizer: Fut) -> Exit<(), Infallible>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_finalizer(move |_| finalizer).await
    }

    /// Drop a registration before it runs. Returns whether it was present.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
        match &mut *self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => {
                let before = finalizers.len();
                finalizers.retain(|(k, _)| *k != key);
                finalizers.len() != before
            }
            ScopeState::Closed(_) => false,
        }
    }

    fn try_add(&self, finalizer: Finalizer) -> Result<FinalizerKey, (Finalizer, ScopeExit)> {
        match &mut *self.inner.state.lock() {
            ScopeState::Open {
                finalizers,
                next_key,
            } => {
                let key = FinalizerKey(*next_key);
                *next_key += 1;
                finalizers.push((key, finalizer));
                Ok(key)
            }
            ScopeState::Closed(exit) => Err((finalizer, exit.clone())),
        }
    }

    /// Child scope closed by this one unless closed first. Forking from a
    /// closed scope yields a child that is already closed with the same
    /// exit.
    pub fn fork(&self, strategy: ExecutionStrategy) -> Scope {
        let child = Scope::make(strategy);
        let closer = child.clone();
        let finalizer: Finalizer = Box::new(move |exit| async move { closer.close(exit).await }.boxed());
        match self.try_add(finalizer) {
            Ok(key) => {
                *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), key));
            }
            Err((_, exit)) => {
                *child.inner.state.lock() = ScopeState::Closed(exit);
            }
        }
        child
    }

    /// Close with `exit`, running every finalizer once. Later calls are
    /// no-ops that succeed.
    pub async fn close(&self, exit: ScopeExit) -> Exit<(), Infallible> {
        let finalizers = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, ScopeState::Closed(exit.clone())) {
                ScopeState::Open { finalizers, .. } => finalizers,
                closed @ ScopeState::Closed(_) => {
                    *state = closed;
                    return Exit::Success(());
                }
            }
        };

        if let Some((parent, key)) = self.inner.parent.lock().take() {
            if let Some(parent) = parent.upgrade() {
                Scope { inner: parent }.remove_finalizer(key);
            }
        }

        let count = finalizers.len();
        let finalizers: Vec<Finalizer> = finalizers.into_iter().map(|(_, f)| f).collect();
        let result = run_all(self.inner.strategy, finalizers, exit).await;
        match &result {
            Exit::Success(()) => {
                tracing::trace!(scope = self.inner.id, finalizers = count, "scope closed");
            }
            Exit::Failure(cause) => {
                tracing::warn!(scope = self.inner.id, finalizers = count, cause = %cause, "scope finalizers failed");
            }
        }
        result
    }

    /// Lend the scope to `body` without closing it.
    pub async fn extend<A, E, F, Fut>(&self, body: F) -> Result<A, Cause<E>>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<A, Cause<E>>>,
    {
        body(self.clone()).await
    }

    /// Run `body` in a fresh scope, then close the scope with the body's
    /// outcome. Finalizer failures are folded into the result.
    pub async fn use_scope<A, E, F, Fut>(strategy: ExecutionStrategy, body: F) -> Result<A, Cause<E>>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<A, Cause<E>>>,
    {
        let scope = Scope::make(strategy);
        let exit: Exit<A, E> = body(scope.clone()).await.into();
        let finalized = scope.close(exit.erase()).await;
        exit.then_finalized(finalized).into_result()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("strategy", &self.inner.strategy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FiberContext {
    /// [`Scope::use_scope`] on this fiber, closing the scope with
    /// `WindDown` set so interruption cannot reach the finalizers. An
    /// interrupt that arrives while closing lands after they finish.
    pub async fn scoped<A, E, F, Fut>(&self, strategy: ExecutionStrategy, body: F) -> Result<A, Cause<E>>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<A, Cause<E>>>,
    {
        let scope = Scope::make(strategy);
        let exit: Exit<A, E> = body(scope.clone()).await.into();
        let erased = exit.erase();
        let closing = async { Ok::<_, Cause<Infallible>>(scope.close(erased).await) };
        let finalized = match self
            .with_runtime_flags(RuntimeFlagsPatch::enable(RuntimeFlag::WindDown), closing)
            .await
        {
            Ok(finalized) => finalized,
            Err(cause) => Exit::Failure(cause),
        };
        exit.then_finalized(finalized).into_result()
    }
}

async fn run_one(finalizer: Finalizer, exit: ScopeExit) -> Exit<(), Infallible> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| finalizer(exit))) {
        Ok(fut) => fut,
        Err(payload) => return Exit::die(Defect::from_panic(payload)),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(exit) => exit,
        Err(payload) => Exit::die(Defect::from_panic(payload)),
    }
}

async fn run_all(
    strategy: ExecutionStrategy,
    finalizers: Vec<Finalizer>,
    exit: ScopeExit,
) -> Exit<(), Infallible> {
    let cause = match strategy {
        ExecutionStrategy::Sequential => {
            let mut cause = Cause::Empty;
            for finalizer in finalizers {
                if let Exit::Failure(failed) = run_one(finalizer, exit.clone()).await {
                    cause = Cause::sequential(cause, failed);
                }
            }
            cause
        }
        ExecutionStrategy::Parallel => {
            let runs: Vec<_> = finalizers.into_iter().map(|f| run_one(f, exit.clone())).collect();
            let exits = join_all(runs).await;
            parallel_cause(exits)
        }
        ExecutionStrategy::ParallelN(width) => {
            let runs: Vec<_> = finalizers.into_iter().map(|f| run_one(f, exit.clone())).collect();
            let exits: Vec<_> = stream::iter(runs)
                .buffer_unordered(width.max(1))
                .collect()
                .await;
            parallel_cause(exits)
        }
    };
    if cause.is_empty() {
        Exit::Success(())
    } else {
        Exit::Failure(cause)
    }
}

fn parallel_cause(exits: Vec<Exit<(), Infallible>>) -> Cause<Infallible> {
    exits.into_iter().fold(Cause::Empty, |acc, exit| match exit {
        Exit::Success(()) => acc,
        Exit::Failure(cause) => Cause::parallel(acc, cause),
    })
}
