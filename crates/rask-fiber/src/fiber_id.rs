// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber identity.
//!
//! A `FiberId` names a logical thread. Runtime ids pair a counter value with
//! the wall-clock start time; the pair orders fibers by lineage (older first)
//! when fork/join has to decide which side wrote a value last.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a single running fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFiberId {
    pub id: u64,
    pub start_time_millis: u64,
}

impl RuntimeFiberId {
    /// Owner of values written outside any fiber (runtime-level defaults).
    pub const ROOT: RuntimeFiberId = RuntimeFiberId {
        id: 0,
        start_time_millis: 0,
    };

    pub fn new(id: u64, start_time_millis: u64) -> Self {
        Self {
            id,
            start_time_millis,
        }
    }
}

// Lineage order: start time first, id breaks ties.
impl Ord for RuntimeFiberId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_time_millis
            .cmp(&other.start_time_millis)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for RuntimeFiberId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RuntimeFiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Identity of zero, one, or several fibers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum FiberId {
    #[default]
    None,
    Runtime(RuntimeFiberId),
    Composite(CompositeIds),
}

/// Member set of a composite id.
///
/// Members may themselves be composites. Dropping is iterative so that
/// arbitrarily deep nestings don't exhaust the stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CompositeIds {
    ids: BTreeSet<FiberId>,
}

impl CompositeIds {
    pub fn new(ids: BTreeSet<FiberId>) -> Self {
        Self { ids }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FiberId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Drop for CompositeIds {
    fn drop(&mut self) {
        let mut pending: Vec<FiberId> = std::mem::take(&mut self.ids).into_iter().collect();
        while let Some(id) = pending.pop() {
            if let FiberId::Composite(mut nested) = id {
                pending.extend(std::mem::take(&mut nested.ids));
            }
        }
    }
}

impl FiberId {
    pub fn runtime(id: u64, start_time_millis: u64) -> Self {
        FiberId::Runtime(RuntimeFiberId::new(id, start_time_millis))
    }

    /// Composite over the given members, without flattening.
    pub fn composite(ids: impl IntoIterator<Item = FiberId>) -> Self {
        FiberId::Composite(CompositeIds::new(ids.into_iter().collect()))
    }

    /// Allocate a fresh runtime id from the process-wide generator.
    pub fn unsafe_make() -> Self {
        FiberId::Runtime(FiberIdGenerator::global().make())
    }

    pub fn is_none(&self) -> bool {
        match self {
            FiberId::None => true,
            FiberId::Runtime(_) => false,
            FiberId::Composite(_) => self.runtime_ids().is_empty(),
        }
    }

    /// Combine two ids. `None` is the identity on both sides.
    pub fn combine(self, that: FiberId) -> FiberId {
        match (self, that) {
            (FiberId::None, that) => that,
            (this, FiberId::None) => this,
            (FiberId::Composite(mut left), FiberId::Composite(mut right)) => {
                let mut ids = std::mem::take(&mut left.ids);
                ids.append(&mut right.ids);
                FiberId::Composite(CompositeIds::new(ids))
            }
            (FiberId::Composite(mut set), single) | (single, FiberId::Composite(mut set)) => {
                let mut ids = std::mem::take(&mut set.ids);
                ids.insert(single);
                FiberId::Composite(CompositeIds::new(ids))
            }
            (left, right) => FiberId::composite([left, right]),
        }
    }

    /// Fold `combine` over many ids.
    pub fn combine_all(ids: impl IntoIterator<Item = FiberId>) -> FiberId {
        ids.into_iter().fold(FiberId::None, FiberId::combine)
    }

    /// Every runtime id reachable from this one.
    pub fn runtime_ids(&self) -> BTreeSet<RuntimeFiberId> {
        let mut out = BTreeSet::new();
        let mut work: Vec<&FiberId> = vec![self];
        while let Some(next) = work.pop() {
            match next {
                FiberId::None => {}
                FiberId::Runtime(id) => {
                    out.insert(*id);
                }
                FiberId::Composite(set) => work.extend(set.iter()),
            }
        }
        out
    }

    /// Flattened set of raw integer ids.
    pub fn ids(&self) -> BTreeSet<u64> {
        self.runtime_ids().into_iter().map(|id| id.id).collect()
    }

    /// `None` for an empty id, otherwise the id rebuilt from its members.
    pub fn to_option(&self) -> Option<FiberId> {
        match self {
            FiberId::None => None,
            FiberId::Runtime(id) => Some(FiberId::Runtime(*id)),
            FiberId::Composite(_) => {
                let members = self.runtime_ids();
                if members.is_empty() {
                    None
                } else {
                    Some(FiberId::combine_all(members.into_iter().map(FiberId::Runtime)))
                }
            }
        }
    }

    /// Human-readable name, e.g. `fiber-#3` or `fibers-#3,#7`.
    pub fn thread_name(&self) -> String {
        let ids = self.ids();
        let prefix = if ids.len() > 1 { "fibers-" } else { "fiber-" };
        let joined = ids
            .iter()
            .map(|id| format!("#{}", id))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{}", prefix, joined)
    }
}

impl From<RuntimeFiberId> for FiberId {
    fn from(id: RuntimeFiberId) -> Self {
        FiberId::Runtime(id)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberId::None => write!(f, "#none"),
            FiberId::Runtime(id) => write!(f, "{}", id),
            FiberId::Composite(_) => {
                let ids = self.ids();
                let joined = ids
                    .iter()
                    .map(|id| format!("#{}", id))
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "{}", joined)
            }
        }
    }
}

/// Monotonic source of fiber ids. Never reset; ids are never recycled.
#[derive(Debug)]
pub struct FiberIdGenerator {
    next: AtomicU64,
}

// Id 0 is reserved for `RuntimeFiberId::ROOT`.
static GLOBAL_GENERATOR: FiberIdGenerator = FiberIdGenerator::with_start(1);

impl FiberIdGenerator {
    pub const fn new() -> Self {
        Self::with_start(0)
    }

    pub const fn with_start(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// The generator shared by every runtime in the process.
    pub fn global() -> &'static FiberIdGenerator {
        &GLOBAL_GENERATOR
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub fn make(&self) -> RuntimeFiberId {
        RuntimeFiberId::new(self.next_id(), now_millis())
    }
}

impl Default for FiberIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
