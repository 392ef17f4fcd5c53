/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: validates the allocator's state invariants between
//! operations.
//!
//! The register file and the virtual-register arena carry redundant
//! (bidirectional) links, and the spill pool carries ownership state
//! that must stay in sync with both. The checker walks all three and
//! reports the first violation. Unit tests run it after every machine
//! operation; the fuzz target runs it after every step of a generated
//! scenario.

use crate::cg::CodeGen;
use crate::machine::Machine;
use crate::{RealReg, RegState, SpillSlot, VirtReg};
use fxhash::FxHashMap;

/// A violation of one of the allocator's state invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckerError {
    /// An assigned or blocked register and its virtual disagree about
    /// the binding.
    BrokenBinding { reg: RealReg },
    /// A free or unlatched register is still claimed by a virtual.
    StaleOwnership { reg: RealReg, virt: VirtReg },
    /// A locked register carries an assignment.
    LockedHoldsVirtual { reg: RealReg },
    /// A virtual points at a register that does not point back.
    DanglingVirtual { virt: VirtReg },
    /// An assigned virtual has no remaining uses.
    DeadAssignedVirtual { virt: VirtReg },
    /// A virtual's future-use count dropped below its out-of-line use
    /// count.
    UseCountOrder { virt: VirtReg },
    /// Two virtuals own the same live spill slot.
    SharedSpillSlot {
        slot: SpillSlot,
        first: VirtReg,
        second: VirtReg,
    },
    /// A virtual is both assigned and on the spilled-register list.
    SpilledListOverlap { virt: VirtReg },
}

impl std::fmt::Display for CheckerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for CheckerError {}

/// Check every state invariant of the machine and its collaborator.
pub fn check_machine(machine: &Machine, cg: &CodeGen) -> Result<(), CheckerError> {
    for data in machine.register_file() {
        let reg = data.reg();
        if reg == RealReg::SPILLED {
            continue;
        }
        match data.state() {
            RegState::Assigned | RegState::Blocked => {
                let ok = data
                    .assigned_register()
                    .map(|v| cg.vregs[v].assigned_register() == Some(reg))
                    .unwrap_or(false);
                if !ok {
                    return Err(CheckerError::BrokenBinding { reg });
                }
            }
            RegState::Free | RegState::Unlatched => {
                // A stale forward link is tolerated (snapshot restore
                // leaves them behind); a live back-link is not.
                if let Some(virt) = data.assigned_register() {
                    if cg.vregs[virt].assigned_register() == Some(reg) {
                        return Err(CheckerError::StaleOwnership { reg, virt });
                    }
                }
            }
            RegState::Locked => {
                if data.assigned_register().is_some() {
                    return Err(CheckerError::LockedHoldsVirtual { reg });
                }
            }
        }
    }

    let mut slot_owners: FxHashMap<SpillSlot, VirtReg> = FxHashMap::default();
    for (virt, data) in cg.vregs.iter() {
        if let Some(reg) = data.assigned_register() {
            if machine.real_register(reg).assigned_register() != Some(virt) {
                return Err(CheckerError::DanglingVirtual { virt });
            }
            if data.future_use_count() == 0 {
                return Err(CheckerError::DeadAssignedVirtual { virt });
            }
        }
        if data.future_use_count() < data.out_of_line_use_count() {
            return Err(CheckerError::UseCountOrder { virt });
        }
        if let Some(slot) = data.backing_storage() {
            if !cg.spills.get(slot).is_released() {
                if let Some(&first) = slot_owners.get(&slot) {
                    return Err(CheckerError::SharedSpillSlot {
                        slot,
                        first,
                        second: virt,
                    });
                }
                slot_owners.insert(slot, virt);
            }
        }
    }

    // Inside the cold path a main-line spill may legitimately be
    // reverse-spilled (assigned) while still on the list; elsewhere the
    // two sets are disjoint.
    if !cg.is_out_of_line_cold_path() {
        for &virt in cg.spilled_register_list() {
            if cg.vregs[virt].assigned_register().is_some() {
                return Err(CheckerError::SpilledListOverlap { virt });
            }
        }
    }

    Ok(())
}
