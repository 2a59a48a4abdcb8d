// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber lifecycle hooks.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::exit::ScopeExit;
use crate::fiber_id::{FiberId, RuntimeFiberId};
use crate::runtime_flags::RuntimeFlags;

/// Observes fibers starting and ending. Hooks run on the thread driving the
/// fiber and must not block.
pub trait Supervisor: Send + Sync + 'static {
    fn on_start(&self, _fiber_id: RuntimeFiberId, _parent: Option<&FiberId>, _flags: RuntimeFlags) {}

    fn on_end(&self, _fiber_id: RuntimeFiberId, _exit: &ScopeExit) {}
}

/// Supervisor held in a fiber ref. `None` means unsupervised.
#[derive(Clone, Default)]
pub struct SupervisorRef(pub Option<Arc<dyn Supervisor>>);

impl SupervisorRef {
    pub fn new(supervisor: Arc<dyn Supervisor>) -> Self {
        SupervisorRef(Some(supervisor))
    }

    pub(crate) fn on_start(&self, fiber_id: RuntimeFiberId, parent: Option<&FiberId>, flags: RuntimeFlags) {
        if let Some(sup) = &self.0 {
            sup.on_start(fiber_id, parent, flags);
        }
    }

    pub(crate) fn on_end(&self, fiber_id: RuntimeFiberId, exit: &ScopeExit) {
        if let Some(sup) = &self.0 {
            sup.on_end(fiber_id, exit);
        }
    }
}

impl PartialEq for SupervisorRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            _ => false,
        }
    }
}

impl fmt::Debug for SupervisorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "SupervisorRef(some)"
        } else {
            "SupervisorRef(none)"
        })
    }
}

/// Records the fibers it has seen start and end.
#[derive(Debug, Default)]
pub struct Track {
    started: Mutex<Vec<RuntimeFiberId>>,
    ended: Mutex<Vec<(RuntimeFiberId, ScopeExit)>>,
}

impl Track {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<RuntimeFiberId> {
        self.started.lock().clone()
    }

    pub fn ended(&self) -> Vec<(RuntimeFiberId, ScopeExit)> {
        self.ended.lock().clone()
    }

    /// Started but not yet ended.
    pub fn live(&self) -> Vec<RuntimeFiberId> {
        let ended = self.ended.lock();
        self.started
            .lock()
            .iter()
            .filter(|id| !ended.iter().any(|(done, _)| done == *id))
            .copied()
            .collect()
    }
}

impl Supervisor for Track {
    fn on_start(&self, fiber_id: RuntimeFiberId, _parent: Option<&FiberId>, _flags: RuntimeFlags) {
        self.started.lock().push(fiber_id);
    }

    fn on_end(&self, fiber_id: RuntimeFiberId, exit: &ScopeExit) {
        self.ended.lock().push((fiber_id, exit.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::Exit;

    #[test]
    fn track_records_lifecycle() {
        let track = Track::new();
        let sup = SupervisorRef::new(track.clone());
        let a = RuntimeFiberId::new(1, 0);
        let b = RuntimeFiberId::new(2, 0);
        sup.on_start(a, None, RuntimeFlags::DEFAULT);
        sup.on_start(b, Some(&FiberId::from(a)), RuntimeFlags::DEFAULT);
        sup.on_end(a, &Exit::succeed(()));
        assert_eq!(track.started(), vec![a, b]);
        assert_eq!(track.live(), vec![b]);
        assert_eq!(track.ended().len(), 1);
    }

    #[test]
    fn empty_ref_is_noop() {
        let sup = SupervisorRef::default();
        sup.on_end(RuntimeFiberId::new(1, 0), &Exit::succeed(()));
        assert_eq!(sup, SupervisorRef(None));
    }
}
