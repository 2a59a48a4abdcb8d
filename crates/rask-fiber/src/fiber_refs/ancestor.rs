// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ancestor resolution for fork/join merges.
//!
//! Given the parent's and the child's stacks for one ref, find the last
//! value both lineages share and whether the child wrote anything after it.
//! Stacks are stored oldest-first, so the visible value is the last frame.

use crate::fiber_id::RuntimeFiberId;

/// One entry of a ref's stack: the fiber that wrote `value`.
#[derive(Debug, Clone)]
pub(crate) struct Frame<V> {
    pub fiber_id: RuntimeFiberId,
    pub value: V,
}

/// Result of walking two stacks back to their common point.
#[derive(Debug, PartialEq)]
pub(crate) enum Ancestor<'a, V> {
    /// No shared frame: the ref's initial value is the ancestor and the
    /// child counts as having modified it.
    Initial,
    /// Both stacks reached a frame owned by the same fiber.
    Shared { value: &'a V, child_modified: bool },
}

/// Peel whichever frontier frame belongs to the later-started fiber until
/// both frontiers name the same fiber or one stack runs out.
pub(crate) fn find_ancestor<'a, V>(parent: &'a [Frame<V>], child: &'a [Frame<V>]) -> Ancestor<'a, V> {
    let mut parent_top = parent.len();
    let mut child_top = child.len();
    let mut child_modified = false;

    while parent_top > 0 && child_top > 0 {
        let parent_frame = &parent[parent_top - 1];
        let child_frame = &child[child_top - 1];
        match parent_frame.fiber_id.cmp(&child_frame.fiber_id) {
            std::cmp::Ordering::Less => {
                child_top -= 1;
                child_modified = true;
            }
            std::cmp::Ordering::Greater => {
                parent_top -= 1;
            }
            std::cmp::Ordering::Equal => {
                return Ancestor::Shared {
                    value: &child_frame.value,
                    child_modified,
                };
            }
        }
    }
    Ancestor::Initial
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u64, start: u64, value: i32) -> Frame<i32> {
        Frame {
            fiber_id: RuntimeFiberId::new(id, start),
            value,
        }
    }

    #[test]
    fn same_frontier_is_unmodified() {
        let parent = vec![frame(1, 10, 5)];
        let child = vec![frame(1, 10, 5)];
        assert_eq!(
            find_ancestor(&parent, &child),
            Ancestor::Shared {
                value: &5,
                child_modified: false
            }
        );
    }

    #[test]
    fn later_child_start_time_peels_child() {
        // Child started later; its own frame sits on top of the shared one.
        let parent = vec![frame(1, 10, 5)];
        let child = vec![frame(1, 10, 5), frame(2, 20, 8)];
        assert_eq!(
            find_ancestor(&parent, &child),
            Ancestor::Shared {
                value: &5,
                child_modified: true
            }
        );
    }

    #[test]
    fn later_parent_start_time_peels_parent() {
        // A sibling joined into the parent after the fork; skip past it.
        let parent = vec![frame(1, 10, 5), frame(3, 30, 9)];
        let child = vec![frame(1, 10, 5)];
        assert_eq!(
            find_ancestor(&parent, &child),
            Ancestor::Shared {
                value: &5,
                child_modified: false
            }
        );
    }

    #[test]
    fn equal_start_time_falls_back_to_id() {
        let parent = vec![frame(1, 10, 5), frame(4, 10, 6)];
        let child = vec![frame(1, 10, 5), frame(2, 10, 7)];
        // Parent frontier id 4 > child frontier id 2: parent peeled first,
        // then child id 2 > parent id 1: child peeled.
        assert_eq!(
            find_ancestor(&parent, &child),
            Ancestor::Shared {
                value: &5,
                child_modified: true
            }
        );
    }

    #[test]
    fn exhausted_stack_resolves_to_initial() {
        let parent = vec![frame(3, 30, 1)];
        let child = vec![frame(2, 20, 7)];
        assert_eq!(find_ancestor(&parent, &child), Ancestor::Initial);
        assert_eq!(find_ancestor::<i32>(&[], &child), Ancestor::Initial);
    }
}
