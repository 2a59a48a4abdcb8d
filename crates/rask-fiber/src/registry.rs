// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Process-wide registry of root fibers, for fiber dumps.
//!
//! Fibers started with `FiberRoots` enabled register here until they
//! finish. Entries are weak so the registry never keeps a fiber alive.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::fiber::{FiberCore, FiberStatus};
use crate::fiber_id::{FiberId, RuntimeFiberId};

fn roots_map() -> &'static Mutex<BTreeMap<RuntimeFiberId, Weak<FiberCore>>> {
    static ROOTS: OnceLock<Mutex<BTreeMap<RuntimeFiberId, Weak<FiberCore>>>> = OnceLock::new();
    ROOTS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Point-in-time view of a registered fiber.
#[derive(Debug, Clone, PartialEq)]
pub struct FiberSnapshot {
    pub id: RuntimeFiberId,
    pub parent: Option<FiberId>,
    pub status: FiberStatus,
}

pub(crate) fn register(core: &Arc<FiberCore>) {
    roots_map().lock().insert(core.id(), Arc::downgrade(core));
}

pub(crate) fn unregister(id: RuntimeFiberId) {
    roots_map().lock().remove(&id);
}

/// Live registered fibers, oldest first.
pub fn roots() -> Vec<FiberSnapshot> {
    let mut map = roots_map().lock();
    map.retain(|_, core| core.strong_count() > 0);
    map.values()
        .filter_map(Weak::upgrade)
        .map(|core| FiberSnapshot {
            id: core.id(),
            parent: core.parent().cloned(),
            status: core.status(),
        })
        .collect()
}

pub fn contains(id: RuntimeFiberId) -> bool {
    roots_map()
        .lock()
        .get(&id)
        .is_some_and(|core| core.strong_count() > 0)
}

/// One line per live root: `fiber-#3 Suspended(blocking on #7)`.
pub fn dump() -> String {
    let mut out = String::new();
    for snapshot in roots() {
        let _ = writeln!(
            out,
            "{} {}",
            FiberId::Runtime(snapshot.id).thread_name(),
            snapshot.status
        );
    }
    out
}
