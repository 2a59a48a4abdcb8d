// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Refs the runtime itself reads.

use std::convert::Infallible;
use std::sync::OnceLock;

use tracing::Level;

use super::FiberRef;
use crate::context::Context;
use crate::exit::Cause;
use crate::scheduler::SchedulerRef;
use crate::supervisor::SupervisorRef;

/// Steps a fiber may take before cooperatively yielding.
pub const DEFAULT_MAX_OPS_BEFORE_YIELD: u32 = 2048;

/// Services visible to the fiber.
pub fn current_context() -> &'static FiberRef<Context> {
    static REF: OnceLock<FiberRef<Context>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::make("current_context", Context::empty()))
}

/// Scheduler new fibers are submitted to. Unset means the host scheduler.
pub fn current_scheduler() -> &'static FiberRef<SchedulerRef> {
    static REF: OnceLock<FiberRef<SchedulerRef>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::make("current_scheduler", SchedulerRef(None)))
}

pub fn current_supervisor() -> &'static FiberRef<SupervisorRef> {
    static REF: OnceLock<FiberRef<SupervisorRef>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::make("current_supervisor", SupervisorRef(None)))
}

pub fn current_max_ops_before_yield() -> &'static FiberRef<u32> {
    static REF: OnceLock<FiberRef<u32>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::make("current_max_ops_before_yield", DEFAULT_MAX_OPS_BEFORE_YIELD))
}

/// Level at which failures nobody observed are logged; `None` disables.
pub fn unhandled_errors_log_level() -> &'static FiberRef<Option<Level>> {
    static REF: OnceLock<FiberRef<Option<Level>>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::make("unhandled_errors_log_level", Some(Level::DEBUG)))
}

/// Interruptions requested against the fiber. A child starts clean and
/// never hands its interruptions back to the parent.
pub fn interrupted_cause() -> &'static FiberRef<Cause<Infallible>> {
    static REF: OnceLock<FiberRef<Cause<Infallible>>> = OnceLock::new();
    REF.get_or_init(|| {
        FiberRef::builder("interrupted_cause", Cause::Empty)
            .fork(|_| Cause::Empty)
            .join(|parent, _| parent.clone())
            .build()
    })
}
