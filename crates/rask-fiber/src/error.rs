// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Errors surfaced at the runtime boundary.

use thiserror::Error;

use crate::exit::Defect;
use crate::fiber_id::FiberId;

/// Why a throwing entry point (`unsafe_run_sync`, `unsafe_run_promise`)
/// produced no value. Typed failures stay distinguishable from defects and
/// interruption.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError<E> {
    #[error("fiber failed: {0:?}")]
    Failure(E),

    #[error("fiber died: {0}")]
    Defect(Defect),

    #[error("fiber interrupted by {0}")]
    Interrupted(FiberId),

    /// A synchronous run suspended on asynchronous work. The fiber keeps
    /// running; it shows up in `registry::roots()` only when the runtime
    /// has `FiberRoots` enabled.
    #[error("fiber {fiber_id} suspended during a synchronous run")]
    AsyncFiber { fiber_id: FiberId },
}

impl<E> RunError<E> {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunError::Failure(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunError::Interrupted(_))
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runtime config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize runtime config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("max_ops_before_yield must be positive")]
    ZeroYieldBudget,

    #[error("unknown log level `{0}`")]
    InvalidLogLevel(String),
}
