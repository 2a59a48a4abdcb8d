// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Diffs between two `FiberRefs` snapshots.

use std::fmt;
use std::sync::Arc;

use super::fiber_ref::{AnyFiberRef, AnyPatch, AnyValue, ErasedRef};
use super::FiberRefs;
use crate::fiber_id::RuntimeFiberId;

/// Replayable description of how one snapshot became another.
pub enum FiberRefsPatch {
    Empty,
    Add { fiber_ref: AnyFiberRef, value: AnyValue },
    Remove { fiber_ref: AnyFiberRef },
    Update { fiber_ref: AnyFiberRef, patch: AnyPatch },
    AndThen(Box<FiberRefsPatch>, Box<FiberRefsPatch>),
}

impl FiberRefsPatch {
    pub fn and_then(self, that: FiberRefsPatch) -> FiberRefsPatch {
        FiberRefsPatch::AndThen(Box::new(self), Box::new(that))
    }

    pub fn is_empty(&self) -> bool {
        let mut work = vec![self];
        while let Some(next) = work.pop() {
            match next {
                FiberRefsPatch::Empty => {}
                FiberRefsPatch::AndThen(first, second) => {
                    work.push(second);
                    work.push(first);
                }
                _ => return false,
            }
        }
        true
    }

    /// Patch that turns `old` into `new`.
    pub fn diff(old: &FiberRefs, new: &FiberRefs) -> FiberRefsPatch {
        let mut missing = old.locals.clone();
        let mut patch = FiberRefsPatch::Empty;

        for (key, stack) in &new.locals {
            let new_value = &stack.head().value;
            let fiber_ref = AnyFiberRef(stack.fiber_ref.clone());
            match missing.remove(key) {
                Some(old_stack) => {
                    let old_value = &old_stack.head().value;
                    if !stack.fiber_ref.value_eq(old_value, new_value) {
                        let delta = stack.fiber_ref.diff(old_value, new_value);
                        patch = patch.and_then(FiberRefsPatch::Update {
                            fiber_ref,
                            patch: delta,
                        });
                    }
                }
                None => {
                    patch = patch.and_then(FiberRefsPatch::Add {
                        fiber_ref,
                        value: new_value.clone(),
                    });
                }
            }
        }

        for stack in missing.into_values() {
            patch = patch.and_then(FiberRefsPatch::Remove {
                fiber_ref: AnyFiberRef(stack.fiber_ref),
            });
        }
        patch
    }

    /// Replay onto `refs`, attributing every write to `fiber_id`.
    pub fn patch(&self, fiber_id: RuntimeFiberId, refs: &FiberRefs) -> FiberRefs {
        let mut out = refs.clone();
        let mut work: Vec<&FiberRefsPatch> = vec![self];
        while let Some(next) = work.pop() {
            match next {
                FiberRefsPatch::Empty => {}
                FiberRefsPatch::Add { fiber_ref, value } => {
                    out = out.updated_as_erased(fiber_id, &fiber_ref.0, value.clone());
                }
                FiberRefsPatch::Remove { fiber_ref } => {
                    out = out.delete_key(fiber_ref.key());
                }
                FiberRefsPatch::Update { fiber_ref, patch } => {
                    let current = current_or_initial(&out, &fiber_ref.0);
                    let updated = fiber_ref.0.patch(patch, &current);
                    out = out.updated_as_erased(fiber_id, &fiber_ref.0, updated);
                }
                FiberRefsPatch::AndThen(first, second) => {
                    work.push(second);
                    work.push(first);
                }
            }
        }
        out
    }
}

fn current_or_initial(refs: &FiberRefs, fiber_ref: &Arc<dyn ErasedRef>) -> AnyValue {
    refs.head_erased(fiber_ref.key())
        .cloned()
        .unwrap_or_else(|| fiber_ref.initial())
}

impl Default for FiberRefsPatch {
    fn default() -> Self {
        FiberRefsPatch::Empty
    }
}

// Long `AndThen` chains are unlinked iteratively.
impl Drop for FiberRefsPatch {
    fn drop(&mut self) {
        let FiberRefsPatch::AndThen(first, second) = self else {
            return;
        };
        let mut work = vec![
            std::mem::take(first.as_mut()),
            std::mem::take(second.as_mut()),
        ];
        while let Some(mut next) = work.pop() {
            if let FiberRefsPatch::AndThen(first, second) = &mut next {
                work.push(std::mem::take(first.as_mut()));
                work.push(std::mem::take(second.as_mut()));
            }
        }
    }
}

impl fmt::Debug for FiberRefsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberRefsPatch::Empty => f.write_str("Empty"),
            FiberRefsPatch::Add { fiber_ref, .. } => write!(f, "Add({})", fiber_ref.name()),
            FiberRefsPatch::Remove { fiber_ref } => write!(f, "Remove({})", fiber_ref.name()),
            FiberRefsPatch::Update { fiber_ref, .. } => write!(f, "Update({})", fiber_ref.name()),
            FiberRefsPatch::AndThen(first, second) => {
                write!(f, "AndThen({:?}, {:?})", first, second)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_refs::FiberRef;

    fn id(n: u64) -> RuntimeFiberId {
        RuntimeFiberId::new(n, 0)
    }

    #[test]
    fn diff_then_patch_reproduces_values() {
        let kept = FiberRef::make("kept", 0);
        let changed = FiberRef::make("changed", 0);
        let added = FiberRef::make("added", String::new());
        let removed = FiberRef::make("removed", false);

        let old = FiberRefs::empty()
            .updated_as(id(1), &kept, 1)
            .updated_as(id(1), &changed, 2)
            .updated_as(id(1), &removed, true);
        let new = old
            .updated_as(id(2), &changed, 20)
            .updated_as(id(2), &added, "hi".to_string())
            .delete(&removed);

        let patch = FiberRefsPatch::diff(&old, &new);
        let replayed = patch.patch(id(3), &old);
        assert_eq!(replayed.get(&kept), Some(1));
        assert_eq!(replayed.get(&changed), Some(20));
        assert_eq!(replayed.get(&added), Some("hi".to_string()));
        assert!(!replayed.contains(&removed));
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let r = FiberRef::make("r", 3);
        let refs = FiberRefs::empty().updated_as(id(1), &r, 4);
        assert!(FiberRefsPatch::diff(&refs, &refs).is_empty());
    }

    #[test]
    fn deep_and_then_chain_replays_and_drops() {
        let r = FiberRef::make("r", 0u64);
        let refs = FiberRefs::empty().updated_as(id(1), &r, 0);
        let mut patch = FiberRefsPatch::Empty;
        for n in 1..=20_000u64 {
            let step = FiberRefs::empty().updated_as(id(1), &r, n);
            let prev = FiberRefs::empty().updated_as(id(1), &r, n - 1);
            patch = patch.and_then(FiberRefsPatch::diff(&prev, &step));
        }
        let out = patch.patch(id(2), &refs);
        assert_eq!(out.get(&r), Some(20_000));
        drop(patch);
    }
}
