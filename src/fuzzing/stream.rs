/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Arbitrary-driven scenarios: a synthetic virtual-register stream plus
//! a backward walk that exercises the machine the way a code-generator
//! driver would, checking state invariants after every operation.

use crate::cg::{CodeGen, Options};
use crate::checker::check_machine;
use crate::inst::InstData;
use crate::machine::Machine;
use crate::{AllocError, RealReg, RegKind, VirtReg};

use super::arbitrary::Result as ArbitraryResult;
use super::arbitrary::{Arbitrary, Unstructured};

/// One operand of a generated instruction: which virtual it uses and
/// whether the use demands a specific physical register.
#[derive(Clone, Copy, Debug)]
pub struct OperandSpec {
    pub vreg: usize,
    pub fixed: Option<u8>,
}

#[derive(Clone, Debug)]
pub struct InstSpec {
    pub operands: Vec<OperandSpec>,
}

#[derive(Clone, Debug)]
pub struct Scenario {
    pub vregs: Vec<RegKind>,
    pub insts: Vec<InstSpec>,
    pub disable_ool: bool,
}

impl Arbitrary<'_> for Scenario {
    fn arbitrary(u: &mut Unstructured) -> ArbitraryResult<Scenario> {
        // More virtuals than assignable GPRs, so spilling happens.
        let num_vregs = u.int_in_range(1..=40u32)? as usize;
        let mut vregs = Vec::with_capacity(num_vregs);
        for _ in 0..num_vregs {
            vregs.push(if u.ratio(1, 4)? {
                RegKind::Fpr
            } else {
                RegKind::Gpr
            });
        }

        let num_insts = u.int_in_range(1..=60u32)? as usize;
        let mut insts = Vec::with_capacity(num_insts);
        for _ in 0..num_insts {
            let num_operands = u.int_in_range(1..=3u32)? as usize;
            let mut operands: Vec<OperandSpec> = Vec::with_capacity(num_operands);
            for _ in 0..num_operands {
                let vreg = u.int_in_range(0..=(num_vregs as u32 - 1))? as usize;
                if operands.iter().any(|op| op.vreg == vreg) {
                    // The walk consumes one future use per operand;
                    // the same virtual twice in one instruction would
                    // double-count.
                    continue;
                }
                let fixed = if u.ratio(1, 4)? {
                    Some(u8::arbitrary(u)?)
                } else {
                    None
                };
                operands.push(OperandSpec { vreg, fixed });
            }
            insts.push(InstSpec { operands });
        }

        Ok(Scenario {
            vregs,
            insts,
            disable_ool: bool::arbitrary(u)?,
        })
    }
}

fn fixed_target(kind: RegKind, ordinal: u8) -> RealReg {
    match kind {
        RegKind::Gpr => {
            RealReg::from_index(ordinal as usize % (RealReg::LAST_ASSIGNABLE_GPR.index() + 1))
        }
        RegKind::Fpr => RealReg::v(ordinal % 32),
    }
}

/// Allocate the scenario's stream with a backward walk and return the
/// collaborator state for inspection.
pub fn run(scenario: &Scenario) -> Result<CodeGen, AllocError> {
    let mut machine = Machine::new();
    let mut cg = CodeGen::new(Options {
        disable_ool: scenario.disable_ool,
        trace_cg: false,
    });

    let mut counts = vec![0u32; scenario.vregs.len()];
    for inst in &scenario.insts {
        for op in &inst.operands {
            counts[op.vreg] += 1;
        }
    }
    let vregs: Vec<VirtReg> = scenario
        .vregs
        .iter()
        .zip(counts.iter())
        .map(|(&kind, &count)| cg.vregs.new_virtual(kind, count, 0))
        .collect();

    cg.insts.push(InstData::proc());
    let insts: Vec<_> = scenario
        .insts
        .iter()
        .map(|spec| {
            let refs: Vec<VirtReg> = spec.operands.iter().map(|op| vregs[op.vreg]).collect();
            cg.insts.push(InstData::opaque(refs))
        })
        .collect();

    for (spec, &inst) in scenario.insts.iter().zip(insts.iter()).rev() {
        for op in &spec.operands {
            let virt = vregs[op.vreg];
            match op.fixed {
                Some(ordinal) => {
                    let target = fixed_target(cg.vregs[virt].kind(), ordinal);
                    machine.coerce_register_assignment(&mut cg, inst, virt, target)?;
                    machine.dec_future_use_count_and_unlatch(&mut cg, inst, virt)?;
                }
                None => {
                    machine.assign_one_register(&mut cg, inst, virt)?;
                }
            }
            check_machine(&machine, &cg).expect("state invariant violated");
        }
    }

    // Every use was consumed exactly once, so nothing stays live past
    // the walk.
    for &virt in &vregs {
        assert_eq!(cg.vregs[virt].future_use_count(), 0);
        assert_eq!(cg.vregs[virt].assigned_register(), None);
    }
    Ok(cg)
}
