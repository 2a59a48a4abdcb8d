// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber-local reference definitions.
//!
//! A `FiberRef<A>` is a process-wide identity; the values live in each
//! fiber's `FiberRefs`. The definition decides what a child sees right after
//! fork, how a child's value merges back on join, and how two values are
//! diffed and patched.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::runtime_flags::{RuntimeFlags, RuntimeFlagsPatch};

/// Type-erased ref value as stored in a `FiberRefs` stack.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Type-erased patch produced by a ref's differ.
pub type AnyPatch = Arc<dyn Any + Send + Sync>;

/// Bound for values a `FiberRef` can hold.
pub trait FiberRefValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> FiberRefValue for T {}

/// Diff/patch algebra over values of type `A`.
///
/// Laws: `patch(diff(old, new), old) == new`, `patch(empty(), a) == a`,
/// `combine` is associative.
pub trait Differ<A>: Send + Sync + 'static {
    type Patch: Clone + Send + Sync + 'static;

    fn empty(&self) -> Self::Patch;
    fn diff(&self, old: &A, new: &A) -> Self::Patch;
    fn combine(&self, first: &Self::Patch, second: &Self::Patch) -> Self::Patch;
    fn patch(&self, patch: &Self::Patch, old: &A) -> A;
}

/// Whole-value replacement. The patch carries the new value, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateDiffer;

impl<A: FiberRefValue> Differ<A> for UpdateDiffer {
    type Patch = Option<A>;

    fn empty(&self) -> Self::Patch {
        None
    }

    fn diff(&self, old: &A, new: &A) -> Self::Patch {
        if old == new {
            None
        } else {
            Some(new.clone())
        }
    }

    fn combine(&self, first: &Self::Patch, second: &Self::Patch) -> Self::Patch {
        second.clone().or_else(|| first.clone())
    }

    fn patch(&self, patch: &Self::Patch, old: &A) -> A {
        match patch {
            Some(new) => new.clone(),
            None => old.clone(),
        }
    }
}

/// Differ whose patches are `RuntimeFlagsPatch`es.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeFlagsDiffer;

impl Differ<RuntimeFlags> for RuntimeFlagsDiffer {
    type Patch = RuntimeFlagsPatch;

    fn empty(&self) -> Self::Patch {
        RuntimeFlagsPatch::EMPTY
    }

    fn diff(&self, old: &RuntimeFlags, new: &RuntimeFlags) -> Self::Patch {
        old.diff(*new)
    }

    fn combine(&self, first: &Self::Patch, second: &Self::Patch) -> Self::Patch {
        first.and_then(*second)
    }

    fn patch(&self, patch: &Self::Patch, old: &RuntimeFlags) -> RuntimeFlags {
        old.patch(*patch)
    }
}

/// Identity of a ref inside `FiberRefs` maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberRefKey(u64);

static NEXT_REF_KEY: AtomicU64 = AtomicU64::new(0);

impl FiberRefKey {
    fn fresh() -> Self {
        FiberRefKey(NEXT_REF_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Operations `FiberRefs` needs without knowing the value type.
pub(crate) trait ErasedRef: Send + Sync {
    fn key(&self) -> FiberRefKey;
    fn name(&self) -> &str;
    fn initial(&self) -> AnyValue;
    fn fork(&self, value: &AnyValue) -> AnyValue;
    fn join(&self, parent: &AnyValue, child: &AnyValue) -> AnyValue;
    fn diff(&self, old: &AnyValue, new: &AnyValue) -> AnyPatch;
    fn patch(&self, patch: &AnyPatch, old: &AnyValue) -> AnyValue;
    fn value_eq(&self, a: &AnyValue, b: &AnyValue) -> bool;
}

type ForkFn<A> = Box<dyn Fn(&A) -> A + Send + Sync>;
type JoinFn<A> = Box<dyn Fn(&A, &A) -> A + Send + Sync>;
type DiffFn<A> = Box<dyn Fn(&A, &A) -> AnyPatch + Send + Sync>;
type PatchFn<A> = Box<dyn Fn(&AnyPatch, &A) -> A + Send + Sync>;

pub(crate) struct RefCore<A> {
    key: FiberRefKey,
    name: String,
    initial: A,
    fork: ForkFn<A>,
    join: JoinFn<A>,
    diff: DiffFn<A>,
    patch: PatchFn<A>,
}

impl<A: FiberRefValue> RefCore<A> {
    fn typed<'a>(&self, value: &'a AnyValue) -> Option<&'a A> {
        value.downcast_ref::<A>()
    }

    fn boxed(value: A) -> AnyValue {
        Arc::new(value)
    }
}

impl<A: FiberRefValue> ErasedRef for RefCore<A> {
    fn key(&self) -> FiberRefKey {
        self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initial(&self) -> AnyValue {
        Self::boxed(self.initial.clone())
    }

    fn fork(&self, value: &AnyValue) -> AnyValue {
        match self.typed(value) {
            Some(v) => Self::boxed((self.fork)(v)),
            None => value.clone(),
        }
    }

    fn join(&self, parent: &AnyValue, child: &AnyValue) -> AnyValue {
        match (self.typed(parent), self.typed(child)) {
            (Some(p), Some(c)) => Self::boxed((self.join)(p, c)),
            _ => child.clone(),
        }
    }

    fn diff(&self, old: &AnyValue, new: &AnyValue) -> AnyPatch {
        match (self.typed(old), self.typed(new)) {
            (Some(o), Some(n)) => (self.diff)(o, n),
            _ => Arc::new(()),
        }
    }

    fn patch(&self, patch: &AnyPatch, old: &AnyValue) -> AnyValue {
        match self.typed(old) {
            Some(o) => Self::boxed((self.patch)(patch, o)),
            None => old.clone(),
        }
    }

    fn value_eq(&self, a: &AnyValue, b: &AnyValue) -> bool {
        match (self.typed(a), self.typed(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A fiber-local reference holding values of type `A`.
pub struct FiberRef<A> {
    core: Arc<RefCore<A>>,
}

impl<A: FiberRefValue> FiberRef<A> {
    /// Ref whose child value is a copy of the parent's and whose join keeps
    /// the child's value.
    pub fn make(name: impl Into<String>, initial: A) -> Self {
        Self::builder(name, initial).build()
    }

    pub fn builder(name: impl Into<String>, initial: A) -> FiberRefBuilder<A, UpdateDiffer> {
        FiberRefBuilder {
            name: name.into(),
            initial,
            fork: None,
            join: None,
            differ: UpdateDiffer,
        }
    }

    pub fn key(&self) -> FiberRefKey {
        self.core.key
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn initial(&self) -> &A {
        &self.core.initial
    }

    pub fn fork_value(&self, value: &A) -> A {
        (self.core.fork)(value)
    }

    pub fn join_values(&self, parent: &A, child: &A) -> A {
        (self.core.join)(parent, child)
    }

    pub(crate) fn erased(&self) -> Arc<dyn ErasedRef> {
        self.core.clone()
    }
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("key", &self.core.key)
            .field("name", &self.core.name)
            .finish()
    }
}

/// Builder for refs with custom fork/join behavior or a custom differ.
pub struct FiberRefBuilder<A, D> {
    name: String,
    initial: A,
    fork: Option<ForkFn<A>>,
    join: Option<JoinFn<A>>,
    differ: D,
}

impl<A: FiberRefValue, D: Differ<A>> FiberRefBuilder<A, D> {
    pub fn fork(mut self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Self {
        self.fork = Some(Box::new(f));
        self
    }

    pub fn join(mut self, f: impl Fn(&A, &A) -> A + Send + Sync + 'static) -> Self {
        self.join = Some(Box::new(f));
        self
    }

    pub fn differ<D2: Differ<A>>(self, differ: D2) -> FiberRefBuilder<A, D2> {
        FiberRefBuilder {
            name: self.name,
            initial: self.initial,
            fork: self.fork,
            join: self.join,
            differ,
        }
    }

    pub fn build(self) -> FiberRef<A> {
        let differ = Arc::new(self.differ);
        let diff_with = differ.clone();
        let patch_with = differ;
        FiberRef {
            core: Arc::new(RefCore {
                key: FiberRefKey::fresh(),
                name: self.name,
                initial: self.initial,
                fork: self
                    .fork
                    .unwrap_or_else(|| Box::new(|value: &A| value.clone()) as ForkFn<A>),
                join: self
                    .join
                    .unwrap_or_else(|| Box::new(|_: &A, child: &A| child.clone()) as JoinFn<A>),
                diff: Box::new(move |old: &A, new: &A| {
                    Arc::new(diff_with.diff(old, new)) as AnyPatch
                }),
                patch: Box::new(move |patch: &AnyPatch, old: &A| {
                    match patch.downcast_ref::<D::Patch>() {
                        Some(p) => patch_with.patch(p, old),
                        None => old.clone(),
                    }
                }),
            }),
        }
    }
}

/// Handle to a ref of unknown value type.
#[derive(Clone)]
pub struct AnyFiberRef(pub(crate) Arc<dyn ErasedRef>);

impl AnyFiberRef {
    pub fn key(&self) -> FiberRefKey {
        self.0.key()
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl fmt::Debug for AnyFiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({})", self.0.name())
    }
}

impl<A: FiberRefValue> From<&FiberRef<A>> for AnyFiberRef {
    fn from(r: &FiberRef<A>) -> Self {
        AnyFiberRef(r.erased())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_differ_roundtrip() {
        let d = UpdateDiffer;
        let p = Differ::<i32>::diff(&d, &1, &5);
        assert_eq!(d.patch(&p, &1), 5);
        assert_eq!(Differ::<i32>::diff(&d, &3, &3), None);
        assert_eq!(d.patch(&Differ::<i32>::empty(&d), &3), 3);
    }

    #[test]
    fn custom_fork_and_join() {
        let r = FiberRef::builder("depth", 0u32)
            .fork(|d| d + 1)
            .join(|parent, child| (*parent).max(*child))
            .build();
        assert_eq!(r.fork_value(&2), 3);
        assert_eq!(r.join_values(&4, &2), 4);
    }

    #[test]
    fn refs_have_distinct_keys() {
        let a = FiberRef::make("a", 1);
        let b = FiberRef::make("a", 1);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.clone().key());
    }
}
