// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime behavior flags.
//!
//! One bit per flag. The fiber loop checks `interruptible()` before honoring
//! an interrupt request; everything else is read at fork time or by the
//! scheduler.

mod patch;

pub use patch::RuntimeFlagsPatch;

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single behavioral toggle.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeFlag {
    /// Fiber may be interrupted.
    Interruption = 1 << 0,
    /// Running fiber is published as the thread's current fiber.
    CurrentFiber = 1 << 1,
    /// Supervisor sees every operation, not just start/end.
    OpSupervision = 1 << 2,
    /// Fiber contributes to runtime metrics.
    RuntimeMetrics = 1 << 3,
    /// Fiber is tracked by the global roots registry.
    FiberRoots = 1 << 4,
    /// Fiber is finalizing; interruption is suppressed.
    WindDown = 1 << 5,
    /// Fiber yields to the scheduler after a bounded number of steps.
    CooperativeYielding = 1 << 6,
}

impl RuntimeFlag {
    pub const ALL: [RuntimeFlag; 7] = [
        RuntimeFlag::Interruption,
        RuntimeFlag::CurrentFiber,
        RuntimeFlag::OpSupervision,
        RuntimeFlag::RuntimeMetrics,
        RuntimeFlag::FiberRoots,
        RuntimeFlag::WindDown,
        RuntimeFlag::CooperativeYielding,
    ];

    pub const fn bit(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeFlag::Interruption => "Interruption",
            RuntimeFlag::CurrentFiber => "CurrentFiber",
            RuntimeFlag::OpSupervision => "OpSupervision",
            RuntimeFlag::RuntimeMetrics => "RuntimeMetrics",
            RuntimeFlag::FiberRoots => "FiberRoots",
            RuntimeFlag::WindDown => "WindDown",
            RuntimeFlag::CooperativeYielding => "CooperativeYielding",
        }
    }
}

impl fmt::Display for RuntimeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitset of enabled `RuntimeFlag`s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RuntimeFlags(u32);

impl RuntimeFlags {
    pub const NONE: RuntimeFlags = RuntimeFlags(0);

    /// Flags a freshly built runtime starts with.
    pub const DEFAULT: RuntimeFlags = RuntimeFlags(
        RuntimeFlag::Interruption.bit() | RuntimeFlag::CooperativeYielding.bit(),
    );

    pub const fn from_bits(bits: u32) -> Self {
        RuntimeFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn make(flags: &[RuntimeFlag]) -> Self {
        RuntimeFlags(flags.iter().fold(0, |acc, f| acc | f.bit()))
    }

    pub fn is_enabled(self, flag: RuntimeFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_disabled(self, flag: RuntimeFlag) -> bool {
        !self.is_enabled(flag)
    }

    pub fn enable(self, flag: RuntimeFlag) -> Self {
        RuntimeFlags(self.0 | flag.bit())
    }

    pub fn disable(self, flag: RuntimeFlag) -> Self {
        RuntimeFlags(self.0 & !flag.bit())
    }

    pub fn enable_all(self, flags: RuntimeFlags) -> Self {
        RuntimeFlags(self.0 | flags.0)
    }

    pub fn disable_all(self, flags: RuntimeFlags) -> Self {
        RuntimeFlags(self.0 & !flags.0)
    }

    /// Whether an interrupt request may be honored right now.
    pub fn interruptible(self) -> bool {
        self.interruption() && !self.wind_down()
    }

    pub fn interruption(self) -> bool {
        self.is_enabled(RuntimeFlag::Interruption)
    }

    pub fn current_fiber(self) -> bool {
        self.is_enabled(RuntimeFlag::CurrentFiber)
    }

    pub fn op_supervision(self) -> bool {
        self.is_enabled(RuntimeFlag::OpSupervision)
    }

    pub fn runtime_metrics(self) -> bool {
        self.is_enabled(RuntimeFlag::RuntimeMetrics)
    }

    pub fn fiber_roots(self) -> bool {
        self.is_enabled(RuntimeFlag::FiberRoots)
    }

    pub fn wind_down(self) -> bool {
        self.is_enabled(RuntimeFlag::WindDown)
    }

    pub fn cooperative_yielding(self) -> bool {
        self.is_enabled(RuntimeFlag::CooperativeYielding)
    }

    /// Smallest patch taking `self` to `new`.
    pub fn diff(self, new: RuntimeFlags) -> RuntimeFlagsPatch {
        RuntimeFlagsPatch::make(self.0 ^ new.0, new.0)
    }

    pub fn patch(self, patch: RuntimeFlagsPatch) -> RuntimeFlags {
        let active = patch.active();
        RuntimeFlags((self.0 & !active) | (patch.enabled() & active))
    }

    /// Enabled flags in declaration order.
    pub fn flags(self) -> impl Iterator<Item = RuntimeFlag> {
        RuntimeFlag::ALL
            .into_iter()
            .filter(move |flag| self.is_enabled(*flag))
    }
}

impl From<RuntimeFlag> for RuntimeFlags {
    fn from(flag: RuntimeFlag) -> Self {
        RuntimeFlags(flag.bit())
    }
}

impl FromIterator<RuntimeFlag> for RuntimeFlags {
    fn from_iter<I: IntoIterator<Item = RuntimeFlag>>(iter: I) -> Self {
        iter.into_iter().fold(RuntimeFlags::NONE, RuntimeFlags::enable)
    }
}

impl fmt::Debug for RuntimeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RuntimeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.flags().map(RuntimeFlag::name).collect();
        write!(f, "RuntimeFlags({})", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_flag_sets() -> impl Iterator<Item = RuntimeFlags> {
        (0u32..128).map(RuntimeFlags::from_bits)
    }

    #[test]
    fn enable_and_disable() {
        for flags in all_flag_sets() {
            for flag in RuntimeFlag::ALL {
                assert!(flags.enable(flag).is_enabled(flag));
                assert!(flags.disable(flag).is_disabled(flag));
            }
        }
    }

    #[test]
    fn wind_down_blocks_interruption() {
        for flags in all_flag_sets() {
            if flags.wind_down() {
                assert!(!flags.interruptible(), "{}", flags);
            }
        }
        let flags = RuntimeFlags::make(&[RuntimeFlag::Interruption]);
        assert!(flags.interruptible());
        assert!(!flags.enable(RuntimeFlag::WindDown).interruptible());
    }

    #[test]
    fn diff_then_patch_reproduces_target() {
        for old in all_flag_sets() {
            for new in all_flag_sets() {
                assert_eq!(old.patch(old.diff(new)), new);
            }
        }
    }

    #[test]
    fn patch_diff_roundtrip() {
        for flags in all_flag_sets() {
            for active in 0u32..128 {
                for enabled in (0u32..128).step_by(7) {
                    let a = RuntimeFlagsPatch::make(active, enabled);
                    let applied = flags.patch(a);
                    assert_eq!(flags.patch(flags.diff(applied)), applied);
                }
            }
        }
    }

    #[test]
    fn inverse_roundtrip_both_directions() {
        for flags in all_flag_sets() {
            let forward = RuntimeFlags::NONE.diff(flags);
            assert_eq!(RuntimeFlags::NONE.patch(forward), flags);
            assert_eq!(flags.patch(forward.inverse()), RuntimeFlags::NONE);
        }
    }

    #[test]
    fn display_lists_enabled_flags() {
        let flags = RuntimeFlags::make(&[RuntimeFlag::Interruption, RuntimeFlag::WindDown]);
        assert_eq!(flags.to_string(), "RuntimeFlags(Interruption, WindDown)");
    }
}
