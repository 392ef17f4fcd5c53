/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The AArch64 register file: physical-register descriptors, their
//! state machine, and the virtual-register arena.

use crate::{RegKind, SpillSlot, VirtReg};
use core::ops::{Index, IndexMut};

/// A physical AArch64 register, identified by its register-file index.
///
/// The index space covers `x0..x29`, `lr`, `sp`, `xzr`, `v0..v31` and a
/// trailing `SpilledReg` sentinel that only ever appears in dependency
/// post-conditions, never in the register file proper.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct RealReg(u8);

impl RealReg {
    pub const FIRST_GPR: RealReg = RealReg(0);
    /// `x30` doubles as the link register on AArch64.
    pub const LR: RealReg = RealReg(30);
    /// Last register the free-register search may hand out for GPR
    /// requests; `sp` and `xzr` sit above it.
    pub const LAST_ASSIGNABLE_GPR: RealReg = RealReg::LR;
    pub const SP: RealReg = RealReg(31);
    pub const XZR: RealReg = RealReg(32);
    pub const LAST_GPR: RealReg = RealReg::XZR;
    pub const FIRST_FPR: RealReg = RealReg(33);
    pub const LAST_FPR: RealReg = RealReg(64);
    /// Sentinel used as the "register number" of a spilled virtual in
    /// dependency post-conditions.
    pub const SPILLED: RealReg = RealReg(65);
    /// Size of the register file array, sentinel included.
    pub const NUM_REGISTERS: usize = 66;

    /// `x0..x29` by architectural number.
    #[inline(always)]
    pub const fn x(hw_enc: u8) -> Self {
        debug_assert!(hw_enc < 30);
        RealReg(hw_enc)
    }

    /// `v0..v31` by architectural number.
    #[inline(always)]
    pub const fn v(hw_enc: u8) -> Self {
        debug_assert!(hw_enc < 32);
        RealReg(Self::FIRST_FPR.0 + hw_enc)
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        debug_assert!(index < Self::NUM_REGISTERS);
        RealReg(index as u8)
    }

    /// Index into the register file array.
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The register number as encoded by the ISA for its kind.
    #[inline(always)]
    pub fn hw_enc(self) -> usize {
        match self.kind() {
            RegKind::Gpr => self.0 as usize,
            RegKind::Fpr => (self.0 - Self::FIRST_FPR.0) as usize,
        }
    }

    #[inline(always)]
    pub fn kind(self) -> RegKind {
        debug_assert!(self != Self::SPILLED);
        if self.0 <= Self::LAST_GPR.0 {
            RegKind::Gpr
        } else {
            RegKind::Fpr
        }
    }

    /// Whether the free-register search and the spill engine may ever
    /// hand this register out. `sp`, `xzr` and the sentinel never
    /// qualify.
    #[inline(always)]
    pub fn is_assignable(self) -> bool {
        self.0 <= Self::LAST_ASSIGNABLE_GPR.0
            || (self.0 >= Self::FIRST_FPR.0 && self.0 <= Self::LAST_FPR.0)
    }
}

impl core::fmt::Debug for RealReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "RealReg({})", self)
    }
}

impl core::fmt::Display for RealReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            RealReg::LR => write!(f, "lr"),
            RealReg::SP => write!(f, "sp"),
            RealReg::XZR => write!(f, "xzr"),
            RealReg::SPILLED => write!(f, "spilled"),
            r => match r.kind() {
                RegKind::Gpr => write!(f, "x{}", r.hw_enc()),
                RegKind::Fpr => write!(f, "v{}", r.hw_enc()),
            },
        }
    }
}

/// Physical-register allocation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegState {
    /// Available; holds nothing live.
    Free,
    /// Logically free but still wired to its last virtual. A deferred
    /// free used by OOL bookkeeping; the next free-register search that
    /// considers unlatched registers finalizes the transition.
    Unlatched,
    /// Bound to a virtual register.
    Assigned,
    /// Temporarily unavailable, e.g. an input of the current
    /// instruction that must not be clobbered.
    Blocked,
    /// Permanently unavailable (`sp`, `xzr`).
    Locked,
}

/// Opaque per-register flag bits, preserved across snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegFlags(pub u8);

/// A physical-register descriptor in the register file.
#[derive(Clone, Debug)]
pub struct RealRegData {
    reg: RealReg,
    kind: RegKind,
    state: RegState,
    assigned: Option<VirtReg>,
    weight: u32,
    flags: RegFlags,
}

impl RealRegData {
    pub fn new(reg: RealReg, kind: RegKind, state: RegState) -> Self {
        Self {
            reg,
            kind,
            state,
            assigned: None,
            weight: 0,
            flags: RegFlags::default(),
        }
    }

    #[inline(always)]
    pub fn reg(&self) -> RealReg {
        self.reg
    }

    #[inline(always)]
    pub fn kind(&self) -> RegKind {
        self.kind
    }

    #[inline(always)]
    pub fn state(&self) -> RegState {
        self.state
    }

    #[inline(always)]
    pub fn set_state(&mut self, state: RegState) {
        self.state = state;
    }

    #[inline(always)]
    pub fn assigned_register(&self) -> Option<VirtReg> {
        self.assigned
    }

    #[inline(always)]
    pub fn set_assigned_register(&mut self, virt: Option<VirtReg>) {
        self.assigned = virt;
    }

    #[inline(always)]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[inline(always)]
    pub fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }

    #[inline(always)]
    pub fn flags(&self) -> RegFlags {
        self.flags
    }

    #[inline(always)]
    pub fn set_flags(&mut self, flags: RegFlags) {
        self.flags = flags;
    }
}

/// A virtual register produced by earlier code generation.
///
/// Use counts drive the backward liveness bookkeeping: the future-use
/// count is decremented each time the walk consumes a use, and the
/// out-of-line use count tracks how many of the remaining uses sit
/// inside OOL sections.
#[derive(Clone, Debug)]
pub struct VirtRegData {
    kind: RegKind,
    assigned: Option<RealReg>,
    total_use_count: u32,
    future_use_count: u32,
    ool_use_count: u32,
    backing: Option<SpillSlot>,
    collected_reference: bool,
    pinning_array: Option<VirtReg>,
}

impl VirtRegData {
    pub fn new(kind: RegKind) -> Self {
        Self {
            kind,
            assigned: None,
            total_use_count: 0,
            future_use_count: 0,
            ool_use_count: 0,
            backing: None,
            collected_reference: false,
            pinning_array: None,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> RegKind {
        self.kind
    }

    #[inline(always)]
    pub fn assigned_register(&self) -> Option<RealReg> {
        self.assigned
    }

    #[inline(always)]
    pub fn set_assigned_register(&mut self, real: Option<RealReg>) {
        self.assigned = real;
    }

    #[inline(always)]
    pub fn total_use_count(&self) -> u32 {
        self.total_use_count
    }

    #[inline(always)]
    pub fn future_use_count(&self) -> u32 {
        self.future_use_count
    }

    #[inline(always)]
    pub fn out_of_line_use_count(&self) -> u32 {
        self.ool_use_count
    }

    pub fn set_use_counts(&mut self, total: u32, future: u32, out_of_line: u32) {
        self.total_use_count = total;
        self.future_use_count = future;
        self.ool_use_count = out_of_line;
    }

    #[inline(always)]
    pub fn set_future_use_count(&mut self, count: u32) {
        self.future_use_count = count;
    }

    #[inline(always)]
    pub fn inc_future_use_count(&mut self) {
        self.future_use_count += 1;
    }

    #[inline(always)]
    pub fn dec_out_of_line_use_count(&mut self) {
        self.ool_use_count = self.ool_use_count.saturating_sub(1);
    }

    #[inline(always)]
    pub fn backing_storage(&self) -> Option<SpillSlot> {
        self.backing
    }

    #[inline(always)]
    pub fn set_backing_storage(&mut self, slot: Option<SpillSlot>) {
        self.backing = slot;
    }

    #[inline(always)]
    pub fn contains_collected_reference(&self) -> bool {
        self.collected_reference
    }

    pub fn set_contains_collected_reference(&mut self, yes: bool) {
        self.collected_reference = yes;
    }

    #[inline(always)]
    pub fn contains_internal_pointer(&self) -> bool {
        self.pinning_array.is_some()
    }

    #[inline(always)]
    pub fn pinning_array(&self) -> Option<VirtReg> {
        self.pinning_array
    }

    pub fn set_pinning_array(&mut self, array: Option<VirtReg>) {
        self.pinning_array = array;
    }
}

/// Arena of virtual-register descriptors, indexed by [`VirtReg`].
#[derive(Clone, Debug, Default)]
pub struct VirtRegs {
    regs: Vec<VirtRegData>,
}

impl VirtRegs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh virtual with the given use counts (total, future,
    /// out-of-line).
    pub fn new_virtual(&mut self, kind: RegKind, total: u32, out_of_line: u32) -> VirtReg {
        let mut data = VirtRegData::new(kind);
        data.set_use_counts(total, total, out_of_line);
        self.regs.push(data);
        VirtReg::new(self.regs.len() - 1)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VirtReg, &VirtRegData)> {
        self.regs
            .iter()
            .enumerate()
            .map(|(i, data)| (VirtReg::new(i), data))
    }
}

impl Index<VirtReg> for VirtRegs {
    type Output = VirtRegData;

    fn index(&self, virt: VirtReg) -> &VirtRegData {
        &self.regs[virt.index()]
    }
}

impl IndexMut<VirtReg> for VirtRegs {
    fn index_mut(&mut self, virt: VirtReg) -> &mut VirtRegData {
        &mut self.regs[virt.index()]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_ranges() {
        assert_eq!(RealReg::x(0).index(), 0);
        assert_eq!(RealReg::x(29).index(), 29);
        assert_eq!(RealReg::v(0), RealReg::FIRST_FPR);
        assert_eq!(RealReg::v(31), RealReg::LAST_FPR);
        assert_eq!(RealReg::x(5).kind(), RegKind::Gpr);
        assert_eq!(RealReg::LR.kind(), RegKind::Gpr);
        assert_eq!(RealReg::v(17).kind(), RegKind::Fpr);
        assert!(RealReg::LR.is_assignable());
        assert!(!RealReg::SP.is_assignable());
        assert!(!RealReg::XZR.is_assignable());
        assert!(!RealReg::SPILLED.is_assignable());
    }

    #[test]
    fn test_register_names() {
        assert_eq!(RealReg::x(7).to_string(), "x7");
        assert_eq!(RealReg::LR.to_string(), "lr");
        assert_eq!(RealReg::XZR.to_string(), "xzr");
        assert_eq!(RealReg::v(31).to_string(), "v31");
    }
}
