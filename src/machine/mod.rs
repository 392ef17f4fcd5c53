/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The Machine: per-compilation register file plus the engines that
//! drive local assignment.
//!
//! The code generator walks the instruction stream in reverse. For each
//! operand it either asks for *some* register of the right kind
//! ([`Machine::assign_one_register`]) or for one *specific* register
//! ([`Machine::coerce_register_assignment`]); the machine satisfies the
//! request by searching the free set, evicting a victim to a spill slot
//! ([`Machine::free_best_register`]), or reloading a previously spilled
//! virtual ([`Machine::reverse_spill_state`]). Because the walk is
//! backward, a "spill" emits the *load* half of the pair and the later
//! "reverse spill" at the prior use-site emits the matching *store*.
//!
//! Out-of-line (OOL) sections complicate slot lifetimes: a slot spilled
//! on one path must survive until control returns to a path at least as
//! dominant (cold < hot < main line). The `max_spill_depth` field on
//! each backing store tracks the most dominant path that spilled into
//! it, and all release decisions are centralized in
//! [`Machine::reverse_spill_state`].

use crate::cg::CodeGen;
use crate::inst::{
    gen_mem_src1, gen_trg1_mem, gen_trg1_src1, gen_trg1_src2, InstStream, MemRef, Op,
};
use crate::reg::{RealRegData, RegFlags};
use crate::spill::REFERENCE_ADDRESS_SIZE;
use crate::{AllocError, Inst, RealReg, RegKind, RegState, VirtReg};
use smallvec::SmallVec;


/// The machine's view of the physical register file, plus the snapshot
/// buffers used at OOL boundaries. One instance per compilation.
#[derive(Clone, Debug)]
pub struct Machine {
    reg_file: Vec<RealRegData>,
    state_snapshot: Vec<RegState>,
    assigned_snapshot: Vec<Option<VirtReg>>,
    flags_snapshot: Vec<RegFlags>,
}

impl Machine {
    pub fn new() -> Self {
        let mut reg_file = Vec::with_capacity(RealReg::NUM_REGISTERS);
        for i in 0..RealReg::NUM_REGISTERS {
            let reg = RealReg::from_index(i);
            let (kind, state) = if reg == RealReg::SPILLED {
                // The sentinel never participates in allocation.
                (RegKind::Gpr, RegState::Locked)
            } else if reg == RealReg::SP || reg == RealReg::XZR {
                (RegKind::Gpr, RegState::Locked)
            } else {
                (reg.kind(), RegState::Free)
            };
            reg_file.push(RealRegData::new(reg, kind, state));
        }
        Self {
            reg_file,
            state_snapshot: vec![RegState::Free; RealReg::NUM_REGISTERS],
            assigned_snapshot: vec![None; RealReg::NUM_REGISTERS],
            flags_snapshot: vec![RegFlags::default(); RealReg::NUM_REGISTERS],
        }
    }

    #[inline(always)]
    pub fn real_register(&self, reg: RealReg) -> &RealRegData {
        &self.reg_file[reg.index()]
    }

    #[inline(always)]
    pub fn real_register_mut(&mut self, reg: RealReg) -> &mut RealRegData {
        &mut self.reg_file[reg.index()]
    }

    #[inline(always)]
    pub fn register_file(&self) -> &[RealRegData] {
        &self.reg_file
    }

    /// Find the lowest-weight free register of the given kind.
    ///
    /// With `consider_unlatched`, a register whose virtual has no
    /// remaining non-OOL uses also qualifies; choosing one finalizes
    /// its transition to free. Ties break toward the lower register
    /// number. Never returns a locked register.
    pub fn find_best_free_register(
        &mut self,
        kind: RegKind,
        consider_unlatched: bool,
    ) -> Option<RealReg> {
        let (first, last) = match kind {
            RegKind::Gpr => (RealReg::FIRST_GPR, RealReg::LAST_ASSIGNABLE_GPR),
            RegKind::Fpr => (RealReg::FIRST_FPR, RealReg::LAST_FPR),
        };

        let mut best_weight_so_far = u32::MAX;
        let mut free_register = None;
        for i in first.index()..=last.index() {
            let r = &self.reg_file[i];
            if (r.state() == RegState::Free
                || (consider_unlatched && r.state() == RegState::Unlatched))
                && r.weight() < best_weight_so_far
            {
                free_register = Some(RealReg::from_index(i));
                best_weight_so_far = r.weight();
            }
        }
        if let Some(reg) = free_register {
            let r = &mut self.reg_file[reg.index()];
            if r.state() == RegState::Unlatched {
                r.set_assigned_register(None);
                r.set_state(RegState::Free);
            }
        }
        free_register
    }

    /// Evict a currently assigned virtual of `virtual_register`'s kind,
    /// emit the reload that reconstitutes it after `current_instruction`
    /// in code order, and hand back the freed physical register.
    ///
    /// With `forced`, the victim is whatever occupies that register.
    /// Otherwise the victim is found by scanning backward from
    /// `current_instruction` and discarding candidates the cursor
    /// instruction references, until one survives or the scan hits a
    /// label, a proc marker, or the stream head.
    pub fn free_best_register(
        &mut self,
        cg: &mut CodeGen,
        current_instruction: Inst,
        virtual_register: VirtReg,
        forced: Option<RealReg>,
    ) -> Result<RealReg, AllocError> {
        let rk = cg.vregs[virtual_register].kind();
        let mut candidates: SmallVec<[VirtReg; 32]> = SmallVec::new();
        let best;

        if let Some(forced_reg) = forced {
            best = forced_reg;
            candidates.push(
                self.reg_file[forced_reg.index()]
                    .assigned_register()
                    .ok_or(AllocError::BrokenBinding)?,
            );
        } else {
            let (first, last) = match rk {
                RegKind::Gpr => (RealReg::FIRST_GPR, RealReg::LAST_GPR),
                RegKind::Fpr => (RealReg::FIRST_FPR, RealReg::LAST_FPR),
            };
            for i in first.index()..=last.index() {
                let r = &self.reg_file[i];
                if r.state() == RegState::Assigned {
                    if let Some(v) = r.assigned_register() {
                        candidates.push(v);
                    }
                }
            }
            if candidates.is_empty() {
                return Err(AllocError::NoCandidatesToSpill);
            }

            let mut cursor = Some(current_instruction);
            while candidates.len() > 1 {
                let Some(c) = cursor else { break };
                let op = cg.insts.get(c).op();
                if op == Op::Label || op == Op::Proc {
                    break;
                }
                let mut i = 0;
                while i < candidates.len() {
                    if cg.insts.refs_register(c, candidates[i]) {
                        candidates.swap_remove(i);
                    }
                    i += 1;
                }
                cursor = cg.insts.prev(c);
            }
            best = cg.vregs[candidates[0]]
                .assigned_register()
                .ok_or(AllocError::BrokenBinding)?;
        }

        let register_to_spill = candidates[0];
        let contains_internal_pointer = cg.vregs[register_to_spill].contains_internal_pointer();
        let contains_collected_reference =
            cg.vregs[register_to_spill].contains_collected_reference();
        let disable_ool = cg.options().disable_ool;
        let in_ool = cg.is_out_of_line_cold_path() || cg.is_out_of_line_hot_path();

        let location = match cg.vregs[register_to_spill].backing_storage() {
            Some(slot) if !disable_ool && in_ool => {
                // Reuse the slot: the depth protocol keeps protecting it.
                trace!(
                    "OOL: reuse backing store {} for {} inside OOL",
                    slot,
                    register_to_spill
                );
                slot
            }
            _ => match rk {
                RegKind::Gpr if contains_internal_pointer => {
                    let array = cg.vregs[register_to_spill]
                        .pinning_array()
                        .ok_or(AllocError::BrokenBinding)?;
                    let slot = cg.spills.allocate_internal_pointer_spill(array);
                    trace!("spilling internal pointer {} to {}", register_to_spill, slot);
                    slot
                }
                RegKind::Gpr => {
                    let slot = cg
                        .spills
                        .allocate_spill(REFERENCE_ADDRESS_SIZE, contains_collected_reference);
                    trace!("spilling {} to {}", register_to_spill, slot);
                    slot
                }
                RegKind::Fpr => {
                    let slot = cg.spills.allocate_spill(8, false);
                    trace!("spilling FPR {} to {}", register_to_spill, slot);
                    slot
                }
            },
        };

        cg.vregs[register_to_spill].set_backing_storage(Some(location));
        let tmemref = MemRef::new(location);

        if !disable_ool {
            if !cg.is_out_of_line_cold_path() {
                // The spilled-register list holds everything spilled
                // before entering the OOL cold path; post-dependencies
                // at the OOL entry label are generated from it. A slot
                // written outside the cold path must stay protected if
                // the register is reverse-spilled inside it.
                cg.push_front_spilled_register(register_to_spill);
                if !cg.is_out_of_line_hot_path() {
                    cg.spills.get_mut(location).set_max_spill_depth(1);
                } else if cg.spills.get(location).max_spill_depth() != 1 {
                    // Do not overwrite a main-line spill depth.
                    cg.spills.get_mut(location).set_max_spill_depth(2);
                }
                trace!(
                    "OOL: adding {} to the spilled-register list, max spill depth = {}",
                    register_to_spill,
                    cg.spills.get(location).max_spill_depth()
                );
            } else {
                // The post-condition at OOL entry does not expect this
                // register to be spilled, so a cold-path spill needs no
                // protection. Keep any main-line or hot-path depth.
                let depth = cg.spills.get(location).max_spill_depth();
                if depth != 1 && depth != 2 {
                    cg.spills.get_mut(location).set_max_spill_depth(3);
                    trace!(
                        "OOL: in cold path, spilling {} without adding to the spilled-register list",
                        register_to_spill
                    );
                }
            }
        }

        if cg.options().trace_cg {
            trace!("spilling {} ({})", register_to_spill, best);
        }

        let load_op = match rk {
            RegKind::Gpr => Op::LdrImmX,
            RegKind::Fpr => Op::VLdrImmD,
        };
        gen_trg1_mem(&mut cg.insts, load_op, best, tmemref, current_instruction);

        trace!("freed {} from {}", best, register_to_spill);
        self.reg_file[best.index()].set_assigned_register(None);
        self.reg_file[best.index()].set_state(RegState::Free);
        cg.vregs[register_to_spill].set_assigned_register(None);
        Ok(best)
    }

    /// Reload a spilled virtual at a prior use-site.
    ///
    /// In the backward walk this emits the *store* that pairs with the
    /// load [`Machine::free_best_register`] emitted further down the
    /// stream; forward execution writes the value at the use-site and
    /// reads it back at the spill point. Slot release follows the OOL
    /// depth protocol: the slot is freed only when the reverse spill
    /// happens on a path at least as dominant as the one that spilled
    /// into it, or at the OOL entry label itself.
    pub fn reverse_spill_state(
        &mut self,
        cg: &mut CodeGen,
        current_instruction: Inst,
        spilled_register: VirtReg,
        target_register: Option<RealReg>,
    ) -> Result<RealReg, AllocError> {
        let rk = cg.vregs[spilled_register].kind();

        let target_register = match target_register {
            Some(t) => t,
            None => {
                let t = match self.find_best_free_register(rk, false) {
                    Some(t) => t,
                    None => {
                        self.free_best_register(cg, current_instruction, spilled_register, None)?
                    }
                };
                self.reg_file[t.index()].set_state(RegState::Assigned);
                t
            }
        };

        if cg.is_out_of_line_cold_path()
            && cg.vregs[spilled_register].backing_storage().is_none()
        {
            // Use counts do not always reflect spill state inside the
            // cold path: a fresh assignment in the hot path leaves
            // future != total with no backing store. Hand out the
            // register without a store.
            trace!("OOL: not generating reverse spill for {}", spilled_register);
            return Ok(target_register);
        }

        let location = cg.vregs[spilled_register]
            .backing_storage()
            .ok_or(AllocError::BrokenBinding)?;

        if cg.options().trace_cg {
            trace!(
                "re-assigning spilled {} to {}",
                spilled_register,
                target_register
            );
        }

        let tmemref = MemRef::new(location);
        let data_size = match rk {
            RegKind::Gpr => REFERENCE_ADDRESS_SIZE,
            RegKind::Fpr => 8,
        };
        let store_op = match rk {
            RegKind::Gpr => Op::StrImmX,
            RegKind::Fpr => Op::VStrImmD,
        };

        if cg.options().disable_ool {
            cg.spills.free_spill(location, data_size, 0);
            gen_mem_src1(
                &mut cg.insts,
                store_op,
                tmemref,
                target_register,
                current_instruction,
            );
        } else {
            if cg.is_out_of_line_cold_path() {
                // At the cold-stream entry label the main line expects
                // the virtual back in a register; the protected slot can
                // be released there so future OOL blocks do not pin it.
                let is_ool_entry_reverse_spill =
                    cg.insts.is_cold_stream_entry_label(current_instruction);
                let depth = cg.spills.get(location).max_spill_depth();
                if depth == 3 || depth == 0 || is_ool_entry_reverse_spill {
                    if depth != 0 {
                        cg.spills.get_mut(location).set_max_spill_depth(0);
                    } else {
                        // Depth already cleared by the hot path: the
                        // reverse spill happened on both paths and this
                        // is the last chance to release the slot.
                        trace!(
                            "OOL: reverse spill of {} on both paths, freeing {}",
                            spilled_register,
                            location
                        );
                    }
                    cg.spills.free_spill(location, data_size, 0);
                    if !cg.is_free_spill_list_locked() {
                        cg.vregs[spilled_register].set_backing_storage(None);
                    }
                } else {
                    trace!(
                        "OOL: reverse spill of {} in less dominant path ({} / 3), protecting {}",
                        spilled_register,
                        depth,
                        location
                    );
                }
            } else if cg.is_out_of_line_hot_path() {
                // Anything reverse-spilled before entering the OOL
                // section (in backward order) drops off the
                // spilled-register list.
                trace!(
                    "OOL: removing {} from the spilled-register list",
                    spilled_register
                );
                cg.remove_spilled_register(spilled_register);

                // Clear the depth so the cold path knows to release the
                // slot and GC points in the hot path stop seeing the
                // spill; release it now iff this path spilled it.
                let depth = cg.spills.get(location).max_spill_depth();
                cg.spills.get_mut(location).set_max_spill_depth(0);
                if depth == 2 {
                    cg.spills.free_spill(location, data_size, 0);
                    if !cg.is_free_spill_list_locked() {
                        cg.vregs[spilled_register].set_backing_storage(None);
                    }
                } else {
                    trace!(
                        "OOL: reverse spill of {} in less dominant path ({} / 2), protecting {}",
                        spilled_register,
                        depth,
                        location
                    );
                }
            } else {
                trace!(
                    "removing {} from the spilled-register list",
                    spilled_register
                );
                cg.remove_spilled_register(spilled_register);
                cg.spills.get_mut(location).set_max_spill_depth(0);
                cg.spills.free_spill(location, data_size, 0);
                if !cg.is_free_spill_list_locked() {
                    cg.vregs[spilled_register].set_backing_storage(None);
                }
            }
            gen_mem_src1(
                &mut cg.insts,
                store_op,
                tmemref,
                target_register,
                current_instruction,
            );
        }
        Ok(target_register)
    }

    /// Per-operand assignment: bind `virtual_register` to some physical
    /// register and do the use-count bookkeeping for this use.
    pub fn assign_one_register(
        &mut self,
        cg: &mut CodeGen,
        current_instruction: Inst,
        virtual_register: VirtReg,
    ) -> Result<RealReg, AllocError> {
        let rk = cg.vregs[virtual_register].kind();
        let assigned_register = match cg.vregs[virtual_register].assigned_register() {
            None => {
                let total = cg.vregs[virtual_register].total_use_count();
                let future = cg.vregs[virtual_register].future_use_count();
                let real = if total != future {
                    // Consumed uses without a binding: the value was
                    // spilled further down the stream.
                    self.reverse_spill_state(cg, current_instruction, virtual_register, None)?
                } else {
                    let real = match self.find_best_free_register(rk, true) {
                        Some(r) => r,
                        None => self.free_best_register(
                            cg,
                            current_instruction,
                            virtual_register,
                            None,
                        )?,
                    };
                    if !cg.options().disable_ool && cg.is_out_of_line_cold_path() {
                        cg.push_front_first_time_live_ool_register(virtual_register);
                    }
                    real
                };
                cg.vregs[virtual_register].set_assigned_register(Some(real));
                self.reg_file[real.index()].set_assigned_register(Some(virtual_register));
                self.reg_file[real.index()].set_state(RegState::Assigned);
                trace!("assigned {} to {}", virtual_register, real);
                real
            }
            Some(real) => {
                if self.reg_file[real.index()].assigned_register() != Some(virtual_register) {
                    return Err(AllocError::BrokenBinding);
                }
                real
            }
        };

        self.dec_future_use_count_and_unlatch(cg, current_instruction, virtual_register)?;
        Ok(assigned_register)
    }

    /// Ensure `virtual_register` is assigned to exactly
    /// `register_number`, moving, exchanging, or displacing whatever is
    /// in the way.
    pub fn coerce_register_assignment(
        &mut self,
        cg: &mut CodeGen,
        current_instruction: Inst,
        virtual_register: VirtReg,
        register_number: RealReg,
    ) -> Result<(), AllocError> {
        let target_register = register_number;
        let current_assigned_register = cg.vregs[virtual_register].assigned_register();
        let rk = cg.vregs[virtual_register].kind();

        if cg.options().trace_cg {
            match current_assigned_register {
                Some(cur) => trace!(
                    "coercing {} from {} to {}",
                    virtual_register,
                    cur,
                    target_register
                ),
                None => trace!("coercing {} to {}", virtual_register, target_register),
            }
        }

        if current_assigned_register == Some(target_register) {
            return Ok(());
        }

        let target_state = self.reg_file[target_register.index()].state();
        match target_state {
            RegState::Free | RegState::Unlatched => {
                if let Some(cur) = current_assigned_register {
                    // The virtual moves down into the target; its old
                    // home carries the value to later code.
                    register_copy(&mut cg.insts, rk, cur, target_register, current_instruction);
                    self.reg_file[cur.index()].set_state(RegState::Free);
                    self.reg_file[cur.index()].set_assigned_register(None);
                } else {
                    let total = cg.vregs[virtual_register].total_use_count();
                    let future = cg.vregs[virtual_register].future_use_count();
                    if total != future {
                        self.reverse_spill_state(
                            cg,
                            current_instruction,
                            virtual_register,
                            Some(target_register),
                        )?;
                    } else if !cg.options().disable_ool && cg.is_out_of_line_cold_path() {
                        cg.push_front_first_time_live_ool_register(virtual_register);
                    }
                }
            }
            RegState::Blocked | RegState::Assigned => {
                let current_target_virtual = self.reg_file[target_register.index()]
                    .assigned_register()
                    .ok_or(AllocError::BrokenBinding)?;
                // xor exchange is unavailable for FPRs; they go through
                // a temp.
                let need_temp = rk == RegKind::Fpr;

                if target_state == RegState::Blocked {
                    let mut spare_reg = None;
                    if current_assigned_register.is_none() || need_temp {
                        spare_reg = self.find_best_free_register(rk, false);
                        if spare_reg.is_none() {
                            self.block_virtual(cg, virtual_register);
                            let r = self.free_best_register(
                                cg,
                                current_instruction,
                                current_target_virtual,
                                None,
                            )?;
                            self.unblock_virtual(cg, virtual_register);
                            spare_reg = Some(r);
                        }
                    }

                    if let Some(cur) = current_assigned_register {
                        register_exchange(
                            &mut cg.insts,
                            rk,
                            target_register,
                            cur,
                            spare_reg,
                            current_instruction,
                        )?;
                        self.reg_file[cur.index()].set_state(RegState::Blocked);
                        self.reg_file[cur.index()]
                            .set_assigned_register(Some(current_target_virtual));
                        cg.vregs[current_target_virtual].set_assigned_register(Some(cur));
                        // For FPRs the spare stays free.
                    } else {
                        let spare = spare_reg.ok_or(AllocError::BrokenBinding)?;
                        register_copy(
                            &mut cg.insts,
                            rk,
                            target_register,
                            spare,
                            current_instruction,
                        );
                        self.reg_file[spare.index()].set_state(RegState::Blocked);
                        self.reg_file[spare.index()]
                            .set_assigned_register(Some(current_target_virtual));
                        cg.vregs[current_target_virtual].set_assigned_register(Some(spare));

                        let total = cg.vregs[virtual_register].total_use_count();
                        let future = cg.vregs[virtual_register].future_use_count();
                        if total != future {
                            self.reverse_spill_state(
                                cg,
                                current_instruction,
                                virtual_register,
                                Some(target_register),
                            )?;
                        } else if !cg.options().disable_ool && cg.is_out_of_line_cold_path() {
                            cg.push_front_first_time_live_ool_register(virtual_register);
                        }
                    }
                } else {
                    let mut spare_reg = None;
                    if current_assigned_register.is_none() || need_temp {
                        spare_reg = self.find_best_free_register(rk, false);
                    }

                    if let Some(cur) = current_assigned_register {
                        if !need_temp || spare_reg.is_some() {
                            register_exchange(
                                &mut cg.insts,
                                rk,
                                target_register,
                                cur,
                                spare_reg,
                                current_instruction,
                            )?;
                            self.reg_file[cur.index()].set_state(RegState::Assigned);
                            self.reg_file[cur.index()]
                                .set_assigned_register(Some(current_target_virtual));
                            cg.vregs[current_target_virtual].set_assigned_register(Some(cur));
                            // The spare, if any, is still free.
                        } else {
                            // No temp available: spill the incumbent out
                            // of the target instead of exchanging.
                            self.free_best_register(
                                cg,
                                current_instruction,
                                current_target_virtual,
                                Some(target_register),
                            )?;
                            register_copy(
                                &mut cg.insts,
                                rk,
                                cur,
                                target_register,
                                current_instruction,
                            );
                            self.reg_file[cur.index()].set_state(RegState::Free);
                            self.reg_file[cur.index()].set_assigned_register(None);
                        }
                    } else {
                        match spare_reg {
                            None => {
                                self.free_best_register(
                                    cg,
                                    current_instruction,
                                    current_target_virtual,
                                    Some(target_register),
                                )?;
                            }
                            Some(spare) => {
                                register_copy(
                                    &mut cg.insts,
                                    rk,
                                    target_register,
                                    spare,
                                    current_instruction,
                                );
                                self.reg_file[spare.index()].set_state(RegState::Assigned);
                                self.reg_file[spare.index()]
                                    .set_assigned_register(Some(current_target_virtual));
                                cg.vregs[current_target_virtual]
                                    .set_assigned_register(Some(spare));
                            }
                        }

                        let total = cg.vregs[virtual_register].total_use_count();
                        let future = cg.vregs[virtual_register].future_use_count();
                        if total != future {
                            self.reverse_spill_state(
                                cg,
                                current_instruction,
                                virtual_register,
                                Some(target_register),
                            )?;
                        } else if !cg.options().disable_ool && cg.is_out_of_line_cold_path() {
                            cg.push_front_first_time_live_ool_register(virtual_register);
                        }
                    }
                }
            }
            RegState::Locked => {
                trace!(
                    "coercing {} to {}, which is in an unexpected state",
                    virtual_register,
                    target_register
                );
            }
        }

        self.reg_file[target_register.index()].set_state(RegState::Assigned);
        self.reg_file[target_register.index()].set_assigned_register(Some(virtual_register));
        cg.vregs[virtual_register].set_assigned_register(Some(target_register));
        trace!("assigned {} to {}", virtual_register, target_register);
        Ok(())
    }

    /// Decrement the future-use count of `virtual_register` for the use
    /// just consumed and unlatch its register when no further non-OOL
    /// uses remain.
    ///
    /// Inside the cold path the out-of-line use count is decremented
    /// too. The register is unlatched when the future count hits zero,
    /// or in the hot path when every remaining use is out-of-line; in
    /// the latter case the allocator revives the register when it
    /// reaches the branch to the outlined code.
    pub fn dec_future_use_count_and_unlatch(
        &mut self,
        cg: &mut CodeGen,
        _current_instruction: Inst,
        virtual_register: VirtReg,
    ) -> Result<(), AllocError> {
        {
            let v = &mut cg.vregs[virtual_register];
            let future = v
                .future_use_count()
                .checked_sub(1)
                .ok_or(AllocError::NegativeFutureUseCount)?;
            v.set_future_use_count(future);
        }
        if cg.is_out_of_line_cold_path() {
            cg.vregs[virtual_register].dec_out_of_line_use_count();
        }

        let future = cg.vregs[virtual_register].future_use_count();
        let out_of_line = cg.vregs[virtual_register].out_of_line_use_count();
        if future < out_of_line {
            return Err(AllocError::UseCountInvariantBroken);
        }

        if future == 0 || (cg.is_out_of_line_hot_path() && future == out_of_line) {
            if future != 0 {
                trace!(
                    "OOL: {}'s remaining uses are out-of-line, unlatching",
                    virtual_register
                );
            }
            let real = cg.vregs[virtual_register]
                .assigned_register()
                .ok_or(AllocError::BrokenBinding)?;
            self.reg_file[real.index()].set_assigned_register(None);
            self.reg_file[real.index()].set_state(RegState::Unlatched);
            cg.vregs[virtual_register].set_assigned_register(None);
        }
        Ok(())
    }

    /// Capture state, assignment, and flags of every descriptor.
    /// Taken at entry to an OOL cold path.
    pub fn take_register_state_snapshot(&mut self) {
        for i in RealReg::FIRST_GPR.index()..RealReg::SPILLED.index() {
            self.state_snapshot[i] = self.reg_file[i].state();
            self.assigned_snapshot[i] = self.reg_file[i].assigned_register();
            self.flags_snapshot[i] = self.reg_file[i].flags();
        }
    }

    /// Restore the register file from the last snapshot.
    ///
    /// Restoration must not blindly sever virtual back-pointers: a
    /// descriptor earlier in this loop may already have claimed the
    /// virtual. Say `x12` held `vr3555` and `x15` held `vr3545` while
    /// the snapshot says `x12: vr3545`, `x15: vr3562`; after `x12` is
    /// restored, `vr3545` points at `x12`, and clearing it while
    /// restoring `x15` would break that fresh link. The back-pointer is
    /// only cleared when it still points at the descriptor being
    /// restored.
    pub fn restore_register_state_from_snapshot(&mut self, cg: &mut CodeGen) {
        for i in RealReg::FIRST_GPR.index()..RealReg::SPILLED.index() {
            let this_reg = RealReg::from_index(i);
            self.reg_file[i].set_flags(self.flags_snapshot[i]);
            self.reg_file[i].set_state(self.state_snapshot[i]);
            match self.reg_file[i].state() {
                RegState::Free => {
                    if let Some(v) = self.reg_file[i].assigned_register() {
                        cg.vregs[v].set_assigned_register(None);
                    }
                }
                RegState::Assigned => {
                    if let Some(v) = self.reg_file[i].assigned_register() {
                        if Some(v) != self.assigned_snapshot[i]
                            && cg.vregs[v].assigned_register() == Some(this_reg)
                        {
                            cg.vregs[v].set_assigned_register(None);
                        }
                    }
                }
                _ => {}
            }
            self.reg_file[i].set_assigned_register(self.assigned_snapshot[i]);
            if self.reg_file[i].state() == RegState::Assigned {
                if let Some(v) = self.reg_file[i].assigned_register() {
                    cg.vregs[v].set_assigned_register(Some(this_reg));
                    // A virtual that died after the snapshot was taken
                    // is guaranteed unused in the outlined path; leave
                    // its register free instead of reviving it.
                    if cg.vregs[v].future_use_count() == 0 {
                        self.reg_file[i].set_state(RegState::Free);
                        cg.vregs[v].set_assigned_register(None);
                        self.reg_file[i].set_assigned_register(None);
                    }
                }
            }
        }
    }

    /// Build the dependency condition inserted at an OOL entry label so
    /// the branch preserves the register mapping: one post-condition
    /// per live assigned register plus one `SpilledReg` post-condition
    /// per entry of `spilled_register_list`. Returns `None` when there
    /// is nothing to preserve.
    pub fn create_dep_cond_for_live_gprs(
        &self,
        cg: &mut CodeGen,
        spilled_register_list: &[VirtReg],
    ) -> Result<Option<crate::RegDeps>, AllocError> {
        // Count the conditions first; this is only space-consciousness.
        let mut count = 0;
        for i in RealReg::FIRST_GPR.index()..RealReg::SPILLED.index() {
            let r = &self.reg_file[i];
            debug_assert!(
                matches!(
                    r.state(),
                    RegState::Assigned | RegState::Free | RegState::Locked
                ),
                "cannot handle {} state {:?}",
                r.reg(),
                r.state()
            );
            if r.state() == RegState::Assigned {
                count += 1;
            }
        }
        count += spilled_register_list.len();
        if count == 0 {
            return Ok(None);
        }

        let mut deps = crate::RegDeps::with_capacity(count);
        for i in RealReg::FIRST_GPR.index()..RealReg::SPILLED.index() {
            let r = &self.reg_file[i];
            if r.state() == RegState::Assigned {
                let virt = r.assigned_register().ok_or(AllocError::BrokenBinding)?;
                if spilled_register_list.contains(&virt) {
                    return Err(AllocError::DoubleMembership);
                }
                deps.add_post_condition(virt, r.reg());
                // The caller's bookkeeping at the entry label only
                // bumps total and out-of-line use counts; future must
                // follow suit here.
                cg.vregs[virt].inc_future_use_count();
            }
        }
        for &virt in spilled_register_list {
            deps.add_post_condition(virt, RealReg::SPILLED);
            cg.vregs[virt].inc_future_use_count();
        }
        Ok(Some(deps))
    }

    fn block_virtual(&mut self, cg: &CodeGen, virt: VirtReg) {
        if let Some(real) = cg.vregs[virt].assigned_register() {
            self.reg_file[real.index()].set_state(RegState::Blocked);
        }
    }

    fn unblock_virtual(&mut self, cg: &CodeGen, virt: VirtReg) {
        if let Some(real) = cg.vregs[virt].assigned_register() {
            self.reg_file[real.index()].set_state(RegState::Assigned);
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit a register copy linked after `preceding`.
fn register_copy(
    insts: &mut InstStream,
    rk: RegKind,
    target_reg: RealReg,
    source_reg: RealReg,
    preceding: Inst,
) {
    match rk {
        RegKind::Gpr => {
            // mov (register)
            gen_trg1_src2(insts, Op::OrrX, target_reg, RealReg::XZR, source_reg, preceding);
        }
        RegKind::Fpr => {
            gen_trg1_src1(insts, Op::FMovD, target_reg, source_reg, preceding);
        }
    }
}

/// Emit a register exchange linked after `preceding`. `middle_reg` is
/// not used for GPRs.
fn register_exchange(
    insts: &mut InstStream,
    rk: RegKind,
    target_reg: RealReg,
    source_reg: RealReg,
    middle_reg: Option<RealReg>,
    preceding: Inst,
) -> Result<(), AllocError> {
    match rk {
        RegKind::Gpr => {
            gen_trg1_src2(insts, Op::EorX, target_reg, target_reg, source_reg, preceding);
            gen_trg1_src2(insts, Op::EorX, source_reg, target_reg, source_reg, preceding);
            gen_trg1_src2(insts, Op::EorX, target_reg, target_reg, source_reg, preceding);
        }
        RegKind::Fpr => {
            let middle_reg = middle_reg.ok_or(AllocError::BrokenBinding)?;
            register_copy(insts, rk, target_reg, middle_reg, preceding);
            register_copy(insts, rk, source_reg, target_reg, preceding);
            register_copy(insts, rk, middle_reg, source_reg, preceding);
        }
    }
    Ok(())
}
