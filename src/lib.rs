/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Local register allocator for AArch64 instruction streams.
//!
//! The allocator maps an unbounded supply of virtual registers onto the
//! fixed AArch64 register file, inserting spill/reload memory traffic
//! and register-to-register moves where needed. It is driven by a
//! backward walk over an already-emitted instruction stream and keeps
//! program semantics intact across out-of-line (OOL) code sections:
//! cold fragments that branch off the main stream and rejoin it through
//! a post-condition at their entry label.
//!
//! The main entry points live on [`machine::Machine`]: per-operand
//! assignment (`assign_one_register`), coercion of a virtual into a
//! specific physical register (`coerce_register_assignment`), and the
//! snapshot/dependency machinery used at OOL boundaries.

// Detailed tracing is only compiled in with the `trace-log` feature;
// it is too expensive to leave on unconditionally.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

#[macro_use]
mod index;
pub use index::{Inst, SpillSlot, VirtReg};

pub mod cg;
pub mod checker;
pub mod deps;
pub mod inst;
pub mod machine;
pub mod reg;
pub mod spill;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

pub use cg::{CodeGen, OolPath, Options};
pub use deps::RegDeps;
pub use machine::Machine;
pub use reg::{RealReg, RegState};

/// Register kinds.
///
/// The allocator only distinguishes 64-bit general-purpose registers
/// from 64-bit floating-point/SIMD registers; narrower uses of either
/// file are the emitter's business.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegKind {
    Gpr = 0,
    Fpr = 1,
}

/// An error that aborts allocation.
///
/// Every variant is an internal-consistency failure: there is no
/// user-recoverable error path, and the driver is expected to abandon
/// the compilation when it sees one. An unsupported-register-kind
/// condition has no variant because [`RegKind`] makes it
/// unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// All assignable registers of the requested kind are blocked; the
    /// instruction is over-constrained and no spill victim exists.
    NoCandidatesToSpill,
    /// Use-count bookkeeping underflowed a future-use count.
    NegativeFutureUseCount,
    /// A virtual's future-use count dropped below its out-of-line use
    /// count.
    UseCountInvariantBroken,
    /// A physical register claims to be assigned but the
    /// virtual-physical links disagree.
    BrokenBinding,
    /// A virtual is simultaneously assigned and on the spilled-register
    /// list at dependency-synthesis time.
    DoubleMembership,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for AllocError {}
