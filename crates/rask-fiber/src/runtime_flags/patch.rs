// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Diff type for `RuntimeFlags`.
//!
//! Layout: low half is the `active` mask (flags the patch touches), high
//! half the `enabled` mask (their target state). Enabled bits outside the
//! active mask are dropped on construction and never observed.

use std::fmt;

use super::{RuntimeFlag, RuntimeFlags};

const BIT_MASK: u32 = 0xFFFF;
const BIT_SHIFT: u32 = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RuntimeFlagsPatch(u32);

impl RuntimeFlagsPatch {
    pub const EMPTY: RuntimeFlagsPatch = RuntimeFlagsPatch(0);

    pub const fn make(active: u32, enabled: u32) -> Self {
        RuntimeFlagsPatch((active & BIT_MASK) | ((enabled & active & BIT_MASK) << BIT_SHIFT))
    }

    pub fn enable(flag: RuntimeFlag) -> Self {
        Self::make(flag.bit(), flag.bit())
    }

    pub fn disable(flag: RuntimeFlag) -> Self {
        Self::make(flag.bit(), 0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn active(self) -> u32 {
        self.0 & BIT_MASK
    }

    pub const fn enabled(self) -> u32 {
        (self.0 >> BIT_SHIFT) & BIT_MASK
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_active(self, flag: RuntimeFlag) -> bool {
        self.active() & flag.bit() != 0
    }

    pub fn is_enabled(self, flag: RuntimeFlag) -> bool {
        self.enabled() & flag.bit() != 0
    }

    pub fn is_disabled(self, flag: RuntimeFlag) -> bool {
        self.is_active(flag) && self.enabled() & flag.bit() == 0
    }

    pub fn includes(self, flag: RuntimeFlag) -> bool {
        self.is_active(flag)
    }

    /// Drop `flag` from the set of touched flags.
    pub fn exclude(self, flag: RuntimeFlag) -> Self {
        Self::make(self.active() & !flag.bit(), self.enabled())
    }

    /// Touch the union of both patches, enabling only what both enable.
    pub fn both(self, that: RuntimeFlagsPatch) -> Self {
        Self::make(self.active() | that.active(), self.enabled() & that.enabled())
    }

    /// Touch the union of both patches, enabling what either enables.
    pub fn either(self, that: RuntimeFlagsPatch) -> Self {
        Self::make(self.active() | that.active(), self.enabled() | that.enabled())
    }

    pub fn and_then(self, that: RuntimeFlagsPatch) -> Self {
        RuntimeFlagsPatch(self.0 | that.0)
    }

    /// Same flags touched, opposite target state.
    pub fn inverse(self) -> Self {
        Self::make(self.active(), !self.enabled())
    }

    pub fn enabled_set(self) -> RuntimeFlags {
        RuntimeFlags::from_bits(self.enabled())
    }

    pub fn disabled_set(self) -> RuntimeFlags {
        RuntimeFlags::from_bits(self.active() & !self.enabled())
    }
}

impl fmt::Debug for RuntimeFlagsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RuntimeFlagsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on: Vec<&str> = self.enabled_set().flags().map(RuntimeFlag::name).collect();
        let off: Vec<&str> = self.disabled_set().flags().map(RuntimeFlag::name).collect();
        write!(
            f,
            "RuntimeFlagsPatch(enabled = ({}), disabled = ({}))",
            on.join(", "),
            off.join(", ")
        )
    }
}
