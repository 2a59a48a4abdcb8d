// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber outcomes.
//!
//! `Exit` is what a fiber produces; `Cause` records every way it can fail.
//! Typed failures, defects (panics), and interruption travel on the same
//! channel but stay distinguishable.

use std::any::Any;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::error::RunError;
use crate::fiber_id::FiberId;

/// An unexpected failure: a panic or a violated runtime invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    Panic(Arc<str>),
    Message(Arc<str>),
    /// A synchronous run hit an asynchronous suspension.
    AsyncFiber(FiberId),
}

impl Defect {
    pub fn message(msg: impl Into<String>) -> Self {
        Defect::Message(Arc::from(msg.into()))
    }

    /// Capture a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Defect::Panic(Arc::from(msg))
    }

    pub fn async_fiber(fiber_id: FiberId) -> Self {
        Defect::AsyncFiber(fiber_id)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::Panic(msg) => write!(f, "panicked: {}", msg),
            Defect::Message(msg) => f.write_str(msg),
            Defect::AsyncFiber(id) => write!(
                f,
                "fiber {} cannot be resolved synchronously; it suspended on an asynchronous operation",
                id
            ),
        }
    }
}

/// Full failure description of a fiber.
///
/// Queries, `map`, `erase` and `squash` walk the tree with explicit stacks.
/// The derived `Clone`, `PartialEq`, `Debug` and drop glue still recurse
/// once per nesting level.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    Empty,
    Fail(E),
    Die(Defect),
    Interrupt(FiberId),
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    pub fn interrupt(fiber_id: FiberId) -> Self {
        Cause::Interrupt(fiber_id)
    }

    /// `left` then `right`; empty sides vanish.
    pub fn sequential(left: Cause<E>, right: Cause<E>) -> Self {
        match (left, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Sequential(Box::new(left), Box::new(right)),
        }
    }

    /// `left` alongside `right`; empty sides vanish.
    pub fn parallel(left: Cause<E>, right: Cause<E>) -> Self {
        match (left, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Parallel(Box::new(left), Box::new(right)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leaves().next().is_none()
    }

    fn leaves(&self) -> Leaves<'_, E> {
        Leaves { work: vec![self] }
    }

    pub fn failures(&self) -> Vec<&E> {
        self.leaves()
            .filter_map(|c| match c {
                Cause::Fail(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn defects(&self) -> Vec<&Defect> {
        self.leaves()
            .filter_map(|c| match c {
                Cause::Die(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        self.leaves()
            .filter_map(|c| match c {
                Cause::Interrupt(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_failure(&self) -> bool {
        self.leaves().any(|c| matches!(c, Cause::Fail(_)))
    }

    pub fn is_die(&self) -> bool {
        self.leaves().any(|c| matches!(c, Cause::Die(_)))
    }

    pub fn is_interrupted(&self) -> bool {
        self.leaves().any(|c| matches!(c, Cause::Interrupt(_)))
    }

    /// Interrupted, with no failure or defect alongside.
    pub fn is_interrupted_only(&self) -> bool {
        let mut interrupted = false;
        for leaf in self.leaves() {
            match leaf {
                Cause::Interrupt(_) => interrupted = true,
                _ => return false,
            }
        }
        interrupted
    }

    /// Rebuild the tree with `f` applied to every typed failure. Walks with
    /// an explicit stack, so arbitrarily deep causes are fine.
    pub fn map<F>(self, f: impl Fn(E) -> F + Copy) -> Cause<F> {
        let mut work = vec![Rebuild::Visit(self)];
        let mut built: Vec<Cause<F>> = Vec::new();
        while let Some(step) = work.pop() {
            match step {
                Rebuild::Visit(Cause::Sequential(l, r)) => {
                    work.push(Rebuild::Sequential);
                    work.push(Rebuild::Visit(*r));
                    work.push(Rebuild::Visit(*l));
                }
                Rebuild::Visit(Cause::Parallel(l, r)) => {
                    work.push(Rebuild::Parallel);
                    work.push(Rebuild::Visit(*r));
                    work.push(Rebuild::Visit(*l));
                }
                Rebuild::Visit(Cause::Empty) => built.push(Cause::Empty),
                Rebuild::Visit(Cause::Fail(e)) => built.push(Cause::Fail(f(e))),
                Rebuild::Visit(Cause::Die(d)) => built.push(Cause::Die(d)),
                Rebuild::Visit(Cause::Interrupt(id)) => built.push(Cause::Interrupt(id)),
                Rebuild::Sequential => join_top(&mut built, Cause::Sequential),
                Rebuild::Parallel => join_top(&mut built, Cause::Parallel),
            }
        }
        built.pop().unwrap_or(Cause::Empty)
    }

    /// Same shape with typed errors replaced by `()`.
    pub fn erase(&self) -> Cause<()> {
        let mut work = vec![Rebuild::Visit(self)];
        let mut built: Vec<Cause<()>> = Vec::new();
        while let Some(step) = work.pop() {
            match step {
                Rebuild::Visit(Cause::Sequential(l, r)) => {
                    work.push(Rebuild::Sequential);
                    work.push(Rebuild::Visit(&**r));
                    work.push(Rebuild::Visit(&**l));
                }
                Rebuild::Visit(Cause::Parallel(l, r)) => {
                    work.push(Rebuild::Parallel);
                    work.push(Rebuild::Visit(&**r));
                    work.push(Rebuild::Visit(&**l));
                }
                Rebuild::Visit(Cause::Empty) => built.push(Cause::Empty),
                Rebuild::Visit(Cause::Fail(_)) => built.push(Cause::Fail(())),
                Rebuild::Visit(Cause::Die(d)) => built.push(Cause::Die(d.clone())),
                Rebuild::Visit(Cause::Interrupt(id)) => built.push(Cause::Interrupt(id.clone())),
                Rebuild::Sequential => join_top(&mut built, Cause::Sequential),
                Rebuild::Parallel => join_top(&mut built, Cause::Parallel),
            }
        }
        built.pop().unwrap_or(Cause::Empty)
    }

    /// Collapse to the single most relevant error: a typed failure, then a
    /// defect, then interruption.
    pub fn squash(self) -> RunError<E> {
        let mut defect = None;
        let mut interruptors = Vec::new();
        let mut work = vec![self];
        while let Some(next) = work.pop() {
            match next {
                Cause::Empty => {}
                Cause::Fail(e) => return RunError::Failure(e),
                Cause::Die(d) => {
                    defect.get_or_insert(d);
                }
                Cause::Interrupt(id) => interruptors.push(id),
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    work.push(*r);
                    work.push(*l);
                }
            }
        }
        match defect {
            Some(Defect::AsyncFiber(fiber_id)) => RunError::AsyncFiber { fiber_id },
            Some(d) => RunError::Defect(d),
            None if !interruptors.is_empty() => {
                RunError::Interrupted(FiberId::combine_all(interruptors))
            }
            None => RunError::Defect(Defect::message("fiber exited with an empty cause")),
        }
    }
}

impl Cause<Infallible> {
    /// Widen a cause that cannot carry a typed failure.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

/// Pending step of an iterative tree rebuild.
enum Rebuild<N> {
    Visit(N),
    Sequential,
    Parallel,
}

/// Replace the top two built nodes (left below right) with their join.
fn join_top<F>(built: &mut Vec<Cause<F>>, node: fn(Box<Cause<F>>, Box<Cause<F>>) -> Cause<F>) {
    if let (Some(right), Some(left)) = (built.pop(), built.pop()) {
        built.push(node(Box::new(left), Box::new(right)));
    }
}

struct Leaves<'a, E> {
    work: Vec<&'a Cause<E>>,
}

impl<'a, E> Iterator for Leaves<'a, E> {
    type Item = &'a Cause<E>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(next) = self.work.pop() {
            match next {
                Cause::Empty => {}
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    self.work.push(r);
                    self.work.push(l);
                }
                leaf => return Some(leaf),
            }
        }
        None
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => f.write_str("Empty"),
            Cause::Fail(e) => write!(f, "Fail({:?})", e),
            Cause::Die(d) => write!(f, "Die({})", d),
            Cause::Interrupt(id) => write!(f, "Interrupt({})", id),
            Cause::Sequential(l, r) => write!(f, "Sequential({}, {})", l, r),
            Cause::Parallel(l, r) => write!(f, "Parallel({}, {})", l, r),
        }
    }
}

/// Outcome of a fiber.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

/// Exit seen by scope finalizers: value and typed error erased.
pub type ScopeExit = Exit<(), ()>;

impl<A, E> Exit<A, E> {
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::Die(defect))
    }

    pub fn interrupt(fiber_id: FiberId) -> Self {
        Exit::Failure(Cause::Interrupt(fiber_id))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    pub fn map_err<F>(self, f: impl Fn(E) -> F + Copy) -> Exit<A, F> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    pub fn erase(&self) -> ScopeExit {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(cause) => Exit::Failure(cause.erase()),
        }
    }

    /// Fold the outcome of a finalizer into this exit. A failing finalizer
    /// turns success into failure and is sequenced after an existing cause.
    pub fn then_finalized(self, finalizer: Exit<(), Infallible>) -> Exit<A, E> {
        match (self, finalizer) {
            (exit, Exit::Success(())) => exit,
            (Exit::Success(_), Exit::Failure(fin)) => Exit::Failure(fin.widen()),
            (Exit::Failure(cause), Exit::Failure(fin)) => {
                Exit::Failure(Cause::sequential(cause, fin.widen()))
            }
        }
    }

    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<A, E> Exit<Exit<A, E>, E> {
    pub fn flatten(self) -> Exit<A, E> {
        match self {
            Exit::Success(inner) => inner,
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }
}

impl<A, E> From<Result<A, Cause<E>>> for Exit<A, E> {
    fn from(result: Result<A, Cause<E>>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(cause) => Exit::Failure(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> FiberId {
        FiberId::runtime(n, 0)
    }

    #[test]
    fn sequential_drops_empty_sides() {
        let c: Cause<&str> = Cause::sequential(Cause::Empty, Cause::fail("x"));
        assert_eq!(c, Cause::Fail("x"));
        assert!(Cause::<()>::sequential(Cause::Empty, Cause::Empty).is_empty());
    }

    #[test]
    fn leaves_are_collected() {
        let c: Cause<&str> = Cause::parallel(
            Cause::sequential(Cause::fail("a"), Cause::die(Defect::message("boom"))),
            Cause::interrupt(id(3)),
        );
        assert_eq!(c.failures(), vec![&"a"]);
        assert_eq!(c.defects().len(), 1);
        assert!(c.interruptors().contains(&id(3)));
        assert!(!c.is_interrupted_only());
    }

    fn dismantle<T>(cause: Cause<T>) {
        let mut work = vec![cause];
        while let Some(next) = work.pop() {
            if let Cause::Sequential(l, r) | Cause::Parallel(l, r) = next {
                work.push(*l);
                work.push(*r);
            }
        }
    }

    #[test]
    fn map_and_erase_handle_deep_chains() {
        let depth = 200_000u32;
        let mut chain: Cause<u32> = Cause::fail(0);
        for n in 1..depth {
            chain = Cause::Sequential(Box::new(chain), Box::new(Cause::fail(n)));
        }
        let erased = chain.erase();
        assert_eq!(erased.failures().len(), depth as usize);
        let mapped = chain.map(|n| n as u64 * 2);
        let failures = mapped.failures();
        assert_eq!(failures.first(), Some(&&0u64));
        assert_eq!(failures.last(), Some(&&((depth as u64 - 1) * 2)));
        dismantle(erased);
        dismantle(mapped);
    }

    #[test]
    fn map_keeps_shape() {
        let c: Cause<&str> = Cause::Parallel(
            Box::new(Cause::Sequential(Box::new(Cause::fail("a")), Box::new(Cause::Empty))),
            Box::new(Cause::interrupt(id(4))),
        );
        let mapped = c.clone().map(str::len);
        assert_eq!(
            mapped,
            Cause::Parallel(
                Box::new(Cause::Sequential(Box::new(Cause::Fail(1)), Box::new(Cause::Empty))),
                Box::new(Cause::Interrupt(id(4))),
            )
        );
        assert_eq!(c.erase(), mapped.map(|_| ()));
    }

    #[test]
    fn interrupted_only() {
        let c: Cause<()> = Cause::parallel(Cause::interrupt(id(1)), Cause::interrupt(id(2)));
        assert!(c.is_interrupted_only());
        assert!(!Cause::<()>::Empty.is_interrupted_only());
    }

    #[test]
    fn squash_prefers_failure_then_defect_then_interrupt() {
        let c: Cause<&str> = Cause::sequential(Cause::die(Defect::message("d")), Cause::fail("e"));
        assert!(matches!(c.squash(), RunError::Failure("e")));

        let c: Cause<&str> =
            Cause::sequential(Cause::interrupt(id(1)), Cause::die(Defect::message("d")));
        assert!(matches!(c.squash(), RunError::Defect(_)));

        let c: Cause<&str> = Cause::interrupt(id(1));
        match c.squash() {
            RunError::Interrupted(by) => assert_eq!(by, id(1)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn then_finalized_sequences_causes() {
        let fin: Exit<(), Infallible> = Exit::die(Defect::message("fin"));
        let exit: Exit<i32, &str> = Exit::fail("body");
        match exit.then_finalized(fin.clone()) {
            Exit::Failure(Cause::Sequential(l, r)) => {
                assert_eq!(*l, Cause::Fail("body"));
                assert!(matches!(*r, Cause::Die(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        let ok: Exit<i32, &str> = Exit::succeed(1);
        assert!(ok.then_finalized(fin).is_failure());
    }

    #[test]
    fn from_panic_extracts_message() {
        let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(Defect::from_panic(payload), Defect::Panic(Arc::from("kaboom")));
    }
}
