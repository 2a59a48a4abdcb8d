// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-fiber inheritable state.
//!
//! `FiberRefs` maps each ref to the stack of fibers in the current lineage
//! that wrote it, newest on top. The top value is what the owning fiber
//! sees. Values are immutable snapshots: every update returns a new map and
//! only the touched stack is copied.

mod ancestor;
pub mod builtin;
mod fiber_ref;
mod patch;

pub use fiber_ref::{
    AnyFiberRef, AnyPatch, AnyValue, Differ, FiberRef, FiberRefBuilder, FiberRefKey,
    FiberRefValue, RuntimeFlagsDiffer, UpdateDiffer,
};
pub use patch::FiberRefsPatch;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ancestor::{find_ancestor, Ancestor, Frame};
use fiber_ref::ErasedRef;

use crate::fiber_id::RuntimeFiberId;

#[derive(Clone)]
struct RefStack {
    fiber_ref: Arc<dyn ErasedRef>,
    /// Oldest first; never empty.
    frames: Arc<Vec<Frame<AnyValue>>>,
}

impl RefStack {
    fn single(fiber_ref: Arc<dyn ErasedRef>, fiber_id: RuntimeFiberId, value: AnyValue) -> Self {
        Self {
            fiber_ref,
            frames: Arc::new(vec![Frame { fiber_id, value }]),
        }
    }

    fn head(&self) -> &Frame<AnyValue> {
        // `frames` is constructed non-empty and `delete` removes whole stacks.
        &self.frames[self.frames.len() - 1]
    }

    fn pushed(&self, fiber_id: RuntimeFiberId, value: AnyValue) -> Self {
        let mut frames = (*self.frames).clone();
        frames.push(Frame { fiber_id, value });
        Self {
            fiber_ref: self.fiber_ref.clone(),
            frames: Arc::new(frames),
        }
    }

    fn head_replaced(&self, fiber_id: RuntimeFiberId, value: AnyValue) -> Self {
        let mut frames = (*self.frames).clone();
        if let Some(top) = frames.last_mut() {
            *top = Frame { fiber_id, value };
        }
        Self {
            fiber_ref: self.fiber_ref.clone(),
            frames: Arc::new(frames),
        }
    }
}

/// Snapshot of every fiber-ref value visible to one fiber.
#[derive(Clone, Default)]
pub struct FiberRefs {
    locals: HashMap<FiberRefKey, RefStack>,
}

impl FiberRefs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    /// Every ref with a value in this snapshot.
    pub fn fiber_refs(&self) -> Vec<AnyFiberRef> {
        self.locals
            .values()
            .map(|stack| AnyFiberRef(stack.fiber_ref.clone()))
            .collect()
    }

    pub fn contains<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> bool {
        self.locals.contains_key(&fiber_ref.key())
    }

    pub fn get<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> Option<A> {
        self.locals
            .get(&fiber_ref.key())
            .and_then(|stack| stack.head().value.downcast_ref::<A>().cloned())
    }

    pub fn get_or_default<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> A {
        self.get(fiber_ref)
            .unwrap_or_else(|| fiber_ref.initial().clone())
    }

    /// Fiber that wrote the visible value of `fiber_ref`.
    pub fn owner<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> Option<RuntimeFiberId> {
        self.locals
            .get(&fiber_ref.key())
            .map(|stack| stack.head().fiber_id)
    }

    /// Depth of the writer stack for `fiber_ref` (0 if absent).
    pub fn stack_depth<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> usize {
        self.locals
            .get(&fiber_ref.key())
            .map_or(0, |stack| stack.frames.len())
    }

    pub fn updated_as<A: FiberRefValue>(
        &self,
        fiber_id: RuntimeFiberId,
        fiber_ref: &FiberRef<A>,
        value: A,
    ) -> FiberRefs {
        self.updated_as_erased(fiber_id, &fiber_ref.erased(), Arc::new(value))
    }

    pub(crate) fn updated_as_erased(
        &self,
        fiber_id: RuntimeFiberId,
        fiber_ref: &Arc<dyn ErasedRef>,
        value: AnyValue,
    ) -> FiberRefs {
        let key = fiber_ref.key();
        let next = match self.locals.get(&key) {
            None => RefStack::single(fiber_ref.clone(), fiber_id, value),
            Some(stack) => {
                let head = stack.head();
                if head.fiber_id == fiber_id {
                    if fiber_ref.value_eq(&head.value, &value) {
                        return self.clone();
                    }
                    stack.head_replaced(fiber_id, value)
                } else {
                    stack.pushed(fiber_id, value)
                }
            }
        };
        let mut locals = self.locals.clone();
        locals.insert(key, next);
        FiberRefs { locals }
    }

    pub fn delete<A: FiberRefValue>(&self, fiber_ref: &FiberRef<A>) -> FiberRefs {
        self.delete_key(fiber_ref.key())
    }

    pub(crate) fn delete_key(&self, key: FiberRefKey) -> FiberRefs {
        if !self.locals.contains_key(&key) {
            return self.clone();
        }
        let mut locals = self.locals.clone();
        locals.remove(&key);
        FiberRefs { locals }
    }

    pub(crate) fn head_erased(&self, key: FiberRefKey) -> Option<&AnyValue> {
        self.locals.get(&key).map(|stack| &stack.head().value)
    }

    /// Snapshot for a child fiber. Each ref's `fork` transforms the visible
    /// value; a changed value is pushed as the child's own frame.
    pub fn fork_as(&self, child_id: RuntimeFiberId) -> FiberRefs {
        let locals = self
            .locals
            .iter()
            .map(|(key, stack)| {
                let old = &stack.head().value;
                let forked = stack.fiber_ref.fork(old);
                let next = if stack.fiber_ref.value_eq(old, &forked) {
                    stack.clone()
                } else {
                    stack.pushed(child_id, forked)
                };
                (*key, next)
            })
            .collect();
        FiberRefs { locals }
    }

    /// Merge a finished child's snapshot into `self` on behalf of
    /// `fiber_id`, the fiber performing the join.
    pub fn join_as(&self, fiber_id: RuntimeFiberId, child: &FiberRefs) -> FiberRefs {
        let mut locals = self.locals.clone();

        for (key, child_stack) in &child.locals {
            let child_head = child_stack.head();
            // Written by the joining fiber itself: nothing new from the child.
            if child_head.fiber_id == fiber_id {
                continue;
            }
            let fiber_ref = &child_stack.fiber_ref;
            let child_value = &child_head.value;

            let Some(parent_stack) = locals.get(key).cloned() else {
                let initial = fiber_ref.initial();
                if fiber_ref.value_eq(child_value, &initial) {
                    continue;
                }
                let joined = fiber_ref.join(&initial, child_value);
                locals.insert(*key, RefStack::single(fiber_ref.clone(), fiber_id, joined));
                continue;
            };

            let initial;
            let ancestor = match find_ancestor(&parent_stack.frames, &child_stack.frames) {
                Ancestor::Initial => {
                    initial = fiber_ref.initial();
                    &initial
                }
                Ancestor::Shared {
                    child_modified: false,
                    ..
                } => continue,
                Ancestor::Shared { value, .. } => value,
            };

            let patch = fiber_ref.diff(ancestor, child_value);
            let parent_head = parent_stack.head();
            let old_value = &parent_head.value;
            let patched = fiber_ref.patch(&patch, old_value);
            let new_value = fiber_ref.join(old_value, &patched);
            if fiber_ref.value_eq(old_value, &new_value) {
                continue;
            }
            let next = if parent_head.fiber_id == fiber_id {
                parent_stack.head_replaced(fiber_id, new_value)
            } else {
                parent_stack.pushed(fiber_id, new_value)
            };
            locals.insert(*key, next);
        }

        FiberRefs { locals }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for stack in self.locals.values() {
            list.entry(&format_args!(
                "{}@{} (depth {})",
                stack.fiber_ref.name(),
                stack.head().fiber_id,
                stack.frames.len()
            ));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counter whose patches are deltas, so concurrent changes compose.
    struct Delta;

    impl Differ<i64> for Delta {
        type Patch = i64;

        fn empty(&self) -> i64 {
            0
        }

        fn diff(&self, old: &i64, new: &i64) -> i64 {
            new - old
        }

        fn combine(&self, first: &i64, second: &i64) -> i64 {
            first + second
        }

        fn patch(&self, patch: &i64, old: &i64) -> i64 {
            old + patch
        }
    }

    fn id(n: u64) -> RuntimeFiberId {
        RuntimeFiberId::new(n, 1_000 + n)
    }

    #[test]
    fn update_replaces_own_head_and_pushes_foreign() {
        let r = FiberRef::make("r", 0);
        let refs = FiberRefs::empty().updated_as(id(1), &r, 1);
        let refs = refs.updated_as(id(1), &r, 2);
        assert_eq!(refs.stack_depth(&r), 1);
        let refs = refs.updated_as(id(2), &r, 3);
        assert_eq!(refs.stack_depth(&r), 2);
        assert_eq!(refs.get(&r), Some(3));
        assert_eq!(refs.owner(&r), Some(id(2)));
    }

    #[test]
    fn get_or_default_falls_back_to_initial() {
        let r = FiberRef::make("r", 7);
        assert_eq!(FiberRefs::empty().get(&r), None);
        assert_eq!(FiberRefs::empty().get_or_default(&r), 7);
    }

    #[test]
    fn delete_removes_ref() {
        let r = FiberRef::make("r", 0);
        let refs = FiberRefs::empty().updated_as(id(1), &r, 5).delete(&r);
        assert!(!refs.contains(&r));
    }

    #[test]
    fn fork_pushes_only_changed_values() {
        let same = FiberRef::make("same", 1);
        let bumped = FiberRef::builder("bumped", 0).fork(|v| v + 1).build();
        let parent = FiberRefs::empty()
            .updated_as(id(1), &same, 1)
            .updated_as(id(1), &bumped, 10);
        let child = parent.fork_as(id(2));
        assert_eq!(child.stack_depth(&same), 1);
        assert_eq!(child.owner(&same), Some(id(1)));
        assert_eq!(child.get(&bumped), Some(11));
        assert_eq!(child.owner(&bumped), Some(id(2)));
    }

    #[test]
    fn fork_then_join_without_child_writes_is_noop() {
        let r = FiberRef::make("r", 0);
        let parent = FiberRefs::empty().updated_as(id(1), &r, 42);
        let child = parent.fork_as(id(2));
        let joined = parent.join_as(id(1), &child);
        assert_eq!(joined.get(&r), Some(42));
        assert_eq!(joined.stack_depth(&r), 1);
        assert_eq!(joined.owner(&r), Some(id(1)));
    }

    #[test]
    fn child_write_propagates() {
        let r = FiberRef::make("r", 0);
        let parent = FiberRefs::empty().updated_as(id(1), &r, 1);
        let child = parent.fork_as(id(2)).updated_as(id(2), &r, 9);
        let joined = parent.join_as(id(1), &child);
        assert_eq!(joined.get(&r), Some(9));
        assert_eq!(joined.owner(&r), Some(id(1)));
        assert_eq!(joined.stack_depth(&r), 1);
    }

    #[test]
    fn child_change_layers_on_parent_change() {
        let r = FiberRef::builder("counter", 0i64).differ(Delta).build();
        let parent = FiberRefs::empty().updated_as(id(1), &r, 1);
        let child = parent.fork_as(id(2));

        // Parent moves on after the fork.
        let parent = parent.updated_as(id(1), &r, 10);
        // Child adds 5 to what it saw.
        let child = child.updated_as(id(2), &r, 6);

        let joined = parent.join_as(id(1), &child);
        assert_eq!(joined.get(&r), Some(15));
    }

    #[test]
    fn ref_unknown_to_parent_is_added_unless_initial() {
        let r = FiberRef::make("r", 0);
        let fresh = FiberRef::make("fresh", 0);
        let parent = FiberRefs::empty();
        let child = parent
            .fork_as(id(2))
            .updated_as(id(2), &r, 3)
            .updated_as(id(2), &fresh, 0);
        let joined = parent.join_as(id(1), &child);
        assert_eq!(joined.get(&r), Some(3));
        assert_eq!(joined.owner(&r), Some(id(1)));
        assert!(!joined.contains(&fresh));
    }

    #[test]
    fn join_uses_ref_join() {
        let r = FiberRef::builder("max", 0)
            .join(|parent: &i32, child: &i32| (*parent).max(*child))
            .build();
        let parent = FiberRefs::empty().updated_as(id(1), &r, 8);
        let child = parent.fork_as(id(2)).updated_as(id(2), &r, 3);
        let joined = parent.join_as(id(1), &child);
        assert_eq!(joined.get(&r), Some(8));
    }

    #[test]
    fn immutable_snapshots() {
        let r = FiberRef::make("r", 0);
        let a = FiberRefs::empty().updated_as(id(1), &r, 1);
        let b = a.updated_as(id(1), &r, 2);
        assert_eq!(a.get(&r), Some(1));
        assert_eq!(b.get(&r), Some(2));
    }
}
