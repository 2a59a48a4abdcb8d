// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration, loadable from TOML.
//!
//! ```toml
//! runtime_flags = ["Interruption", "CooperativeYielding", "FiberRoots"]
//! max_ops_before_yield = 2048
//! host_worker_threads = 0
//! unhandled_errors_log_level = "debug"
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::ConfigError;
use crate::fiber_refs::builtin::DEFAULT_MAX_OPS_BEFORE_YIELD;
use crate::runtime_flags::{RuntimeFlag, RuntimeFlags};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flags every root fiber starts with.
    pub runtime_flags: Vec<RuntimeFlag>,
    /// Shorthand for adding `FiberRoots` to `runtime_flags`.
    pub fiber_roots: bool,
    pub max_ops_before_yield: u32,
    /// Workers for the process-wide host runtime. 0 uses the core count.
    pub host_worker_threads: usize,
    /// `trace` through `error`, or `off` to drop unhandled failures silently.
    pub unhandled_errors_log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_flags: RuntimeFlags::DEFAULT.flags().collect(),
            fiber_roots: false,
            max_ops_before_yield: DEFAULT_MAX_OPS_BEFORE_YIELD,
            host_worker_threads: 0,
            unhandled_errors_log_level: "debug".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ops_before_yield == 0 {
            return Err(ConfigError::ZeroYieldBudget);
        }
        self.log_level()?;
        Ok(())
    }

    pub fn flags(&self) -> RuntimeFlags {
        let flags = RuntimeFlags::make(&self.runtime_flags);
        if self.fiber_roots {
            flags.enable(RuntimeFlag::FiberRoots)
        } else {
            flags
        }
    }

    /// `None` when logging of unhandled failures is off.
    pub fn log_level(&self) -> Result<Option<Level>, ConfigError> {
        let raw = self.unhandled_errors_log_level.trim();
        if raw.eq_ignore_ascii_case("off") || raw.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        Level::from_str(raw)
            .map(Some)
            .map_err(|_| ConfigError::InvalidLogLevel(raw.to_string()))
    }
}
