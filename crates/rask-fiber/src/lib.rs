// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured-concurrency core for effect fibers.
//!
//! Fibers are effect bodies driven as tasks on a pluggable scheduler. Each
//! fiber carries inheritable state (`FiberRefs`) and behavior toggles
//! (`RuntimeFlags`); children fork both from their parent and merge them
//! back on join. Interruption is cooperative and respects
//! uninterruptible regions.
//!
//! Components:
//! - fiber_id: fiber identities and id generation
//! - runtime_flags: flag bitset and packed patches
//! - fiber_refs: ref stacks with fork/join ancestor resolution
//! - exit / error: outcomes, causes, boundary errors
//! - deferred: one-shot completion cells
//! - fiber / task / scheduler: fiber driver, wakeable tasks, schedulers
//! - scope: finalizer scopes with sequential or parallel release
//! - runtime / config: entry points and TOML configuration
//! - supervisor / registry: lifecycle hooks and root fiber dumps

pub mod config;
pub mod context;
pub mod deferred;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod fiber_id;
pub mod fiber_refs;
pub mod registry;
pub mod runtime;
pub mod runtime_flags;
pub mod scheduler;
pub mod scope;
pub mod supervisor;
pub mod task;

pub use config::RuntimeConfig;
pub use context::Context;
pub use deferred::{AwaitExit, Deferred};
pub use effect::Effect;
pub use error::{ConfigError, RunError};
pub use exit::{Cause, Defect, Exit, ScopeExit};
pub use fiber::{current_fiber_id, Fiber, FiberContext, FiberStatus, InterruptibilityRestorer};
pub use fiber_id::{FiberId, FiberIdGenerator, RuntimeFiberId};
pub use fiber_refs::{FiberRef, FiberRefs, FiberRefsPatch};
pub use runtime::{Cancel, ExitCallback, ForkOptions, Runtime};
pub use runtime_flags::{RuntimeFlag, RuntimeFlags, RuntimeFlagsPatch};
pub use scheduler::{HostScheduler, Scheduler, SchedulerRef, SyncScheduler};
pub use scope::{ExecutionStrategy, FinalizerKey, Scope};
pub use supervisor::{Supervisor, SupervisorRef, Track};
pub use task::{FiberTask, TaskState};
