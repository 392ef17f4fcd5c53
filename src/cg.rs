/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Code-generator state the allocator collaborates with: the
//! compile-scoped arenas (virtual registers, instruction stream, spill
//! pool), the out-of-line path the backward walk is currently in, and
//! the bookkeeping lists consumed at OOL boundaries.

use crate::inst::InstStream;
use crate::reg::VirtRegs;
use crate::spill::SpillPool;
use crate::VirtReg;

/// Allocation options.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Disable out-of-line code support: spill slots are released
    /// eagerly and no OOL bookkeeping is performed.
    pub disable_ool: bool,
    /// Add extra diagnostics to debug logs.
    pub trace_cg: bool,
}

/// Which part of the stream the backward walk is currently assigning.
///
/// An OOL section has two halves: the *cold* body and the *hot* rejoin
/// preamble back to the main line. The driver flips this as it crosses
/// section boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OolPath {
    #[default]
    MainLine,
    HotPath,
    ColdPath,
}

/// Compile-scoped collaborator state owned by the code generator.
///
/// All arenas live for exactly one compilation; dropping `CodeGen`
/// releases everything at once.
#[derive(Clone, Debug, Default)]
pub struct CodeGen {
    pub vregs: VirtRegs,
    pub insts: InstStream,
    pub spills: SpillPool,
    options: Options,
    ool: OolPath,
    spilled_register_list: Vec<VirtReg>,
    first_time_live_ool_register_list: Vec<VirtReg>,
}

impl CodeGen {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    #[inline(always)]
    pub fn options(&self) -> Options {
        self.options
    }

    #[inline(always)]
    pub fn is_out_of_line_cold_path(&self) -> bool {
        self.ool == OolPath::ColdPath
    }

    #[inline(always)]
    pub fn is_out_of_line_hot_path(&self) -> bool {
        self.ool == OolPath::HotPath
    }

    #[inline(always)]
    pub fn ool_path(&self) -> OolPath {
        self.ool
    }

    /// Driver-facing: record which path the walk is in.
    pub fn set_ool_path(&mut self, path: OolPath) {
        self.ool = path;
    }

    #[inline(always)]
    pub fn is_free_spill_list_locked(&self) -> bool {
        self.spills.is_free_spill_list_locked()
    }

    /// Registers spilled before entering the OOL cold path; dependency
    /// post-conditions at the OOL entry label are built from this.
    #[inline(always)]
    pub fn spilled_register_list(&self) -> &[VirtReg] {
        &self.spilled_register_list
    }

    pub fn push_front_spilled_register(&mut self, virt: VirtReg) {
        self.spilled_register_list.insert(0, virt);
    }

    pub fn remove_spilled_register(&mut self, virt: VirtReg) {
        self.spilled_register_list.retain(|&v| v != virt);
    }

    /// Virtuals whose first (in backward order, last in program order)
    /// liveness was discovered inside the OOL cold path.
    #[inline(always)]
    pub fn first_time_live_ool_register_list(&self) -> &[VirtReg] {
        &self.first_time_live_ool_register_list
    }

    pub fn push_front_first_time_live_ool_register(&mut self, virt: VirtReg) {
        self.first_time_live_ool_register_list.insert(0, virt);
    }

    pub fn clear_first_time_live_ool_register_list(&mut self) {
        self.first_time_live_ool_register_list.clear();
    }
}
