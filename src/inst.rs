/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Minimal instruction-stream model the allocator works against.
//!
//! The stream is an arena of instructions threaded into a doubly-linked
//! order. Client instructions (`Op::Opaque`) carry the virtual
//! registers they reference; instructions the allocator emits carry
//! real-register operands and, for memory traffic, a spill-slot
//! reference. The single emission primitive links a new instruction
//! immediately *after* an anchor: code the backward walk emits at the
//! current instruction therefore lands between it and the
//! already-processed later stream, and a sequence generated against one
//! anchor executes in reverse generation order.

use crate::{Inst, RealReg, SpillSlot, VirtReg};
use smallvec::SmallVec;

/// Instruction opcodes.
///
/// The allocator emits exactly seven AArch64 mnemonics; `Label` and
/// `Proc` delimit the stream for the spill engine's backward scan, and
/// `Opaque` stands for any instruction produced by earlier code
/// generation whose operands are still virtual.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// `LDR Xt, [mem]` (immediate, 64-bit).
    LdrImmX,
    /// `LDR Dt, [mem]` (immediate, double).
    VLdrImmD,
    /// `STR Xt, [mem]` (immediate, 64-bit).
    StrImmX,
    /// `STR Dt, [mem]` (immediate, double).
    VStrImmD,
    /// `ORR Xd, Xn, Xm`; with `xzr` as first source this is the
    /// canonical register move.
    OrrX,
    /// `EOR Xd, Xn, Xm`.
    EorX,
    /// `FMOV Dd, Dn`.
    FMovD,
    Label,
    Proc,
    Opaque,
}

/// A reference to spill memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub slot: SpillSlot,
}

impl MemRef {
    pub fn new(slot: SpillSlot) -> Self {
        Self { slot }
    }
}

/// One instruction in the stream.
#[derive(Clone, Debug)]
pub struct InstData {
    op: Op,
    /// Virtual registers a client instruction references.
    refs: SmallVec<[VirtReg; 4]>,
    /// Real-register operands of allocator-emitted instructions:
    /// target first, then sources.
    dst: Option<RealReg>,
    src1: Option<RealReg>,
    src2: Option<RealReg>,
    mem: Option<MemRef>,
    /// For `Label`: whether this label opens an out-of-line cold
    /// instruction stream.
    cold_stream_entry: bool,
    prev: Inst,
    next: Inst,
}

impl InstData {
    fn new(op: Op) -> Self {
        Self {
            op,
            refs: SmallVec::new(),
            dst: None,
            src1: None,
            src2: None,
            mem: None,
            cold_stream_entry: false,
            prev: Inst::invalid(),
            next: Inst::invalid(),
        }
    }

    /// A client instruction referencing the given virtuals.
    pub fn opaque(refs: impl IntoIterator<Item = VirtReg>) -> Self {
        let mut data = Self::new(Op::Opaque);
        data.refs = refs.into_iter().collect();
        data
    }

    pub fn label(cold_stream_entry: bool) -> Self {
        let mut data = Self::new(Op::Label);
        data.cold_stream_entry = cold_stream_entry;
        data
    }

    pub fn proc() -> Self {
        Self::new(Op::Proc)
    }

    #[inline(always)]
    pub fn op(&self) -> Op {
        self.op
    }

    #[inline(always)]
    pub fn refs(&self) -> &[VirtReg] {
        &self.refs
    }

    #[inline(always)]
    pub fn dst(&self) -> Option<RealReg> {
        self.dst
    }

    #[inline(always)]
    pub fn src1(&self) -> Option<RealReg> {
        self.src1
    }

    #[inline(always)]
    pub fn src2(&self) -> Option<RealReg> {
        self.src2
    }

    #[inline(always)]
    pub fn mem(&self) -> Option<MemRef> {
        self.mem
    }

    #[inline(always)]
    pub fn is_label(&self) -> bool {
        self.op == Op::Label
    }
}

impl core::fmt::Display for InstData {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.op {
            Op::LdrImmX | Op::VLdrImmD => {
                let dst = self.dst.expect("load without target");
                let mem = self.mem.expect("load without memory reference");
                write!(f, "ldr {}, [{}]", dst, mem.slot)
            }
            Op::StrImmX | Op::VStrImmD => {
                let src = self.src1.expect("store without source");
                let mem = self.mem.expect("store without memory reference");
                write!(f, "str {}, [{}]", src, mem.slot)
            }
            Op::OrrX => write!(
                f,
                "orr {}, {}, {}",
                self.dst.expect("orr without target"),
                self.src1.expect("orr without source"),
                self.src2.expect("orr without source"),
            ),
            Op::EorX => write!(
                f,
                "eor {}, {}, {}",
                self.dst.expect("eor without target"),
                self.src1.expect("eor without source"),
                self.src2.expect("eor without source"),
            ),
            Op::FMovD => write!(
                f,
                "fmov {}, {}",
                self.dst.expect("fmov without target"),
                self.src1.expect("fmov without source"),
            ),
            Op::Label => {
                if self.cold_stream_entry {
                    write!(f, "label (cold entry):")
                } else {
                    write!(f, "label:")
                }
            }
            Op::Proc => write!(f, "proc:"),
            Op::Opaque => {
                write!(f, "opaque")?;
                for (i, r) in self.refs.iter().enumerate() {
                    write!(f, "{} {}", if i == 0 { "" } else { "," }, r)?;
                }
                Ok(())
            }
        }
    }
}

/// The instruction stream: an arena plus a doubly-linked order.
#[derive(Clone, Debug, Default)]
pub struct InstStream {
    insts: Vec<InstData>,
    head: Inst,
    tail: Inst,
}

impl InstStream {
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            head: Inst::invalid(),
            tail: Inst::invalid(),
        }
    }

    #[inline(always)]
    pub fn get(&self, inst: Inst) -> &InstData {
        &self.insts[inst.index()]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[inline(always)]
    pub fn head(&self) -> Option<Inst> {
        if self.head.is_valid() {
            Some(self.head)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn tail(&self) -> Option<Inst> {
        if self.tail.is_valid() {
            Some(self.tail)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn prev(&self, inst: Inst) -> Option<Inst> {
        let prev = self.get(inst).prev;
        if prev.is_valid() {
            Some(prev)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn next(&self, inst: Inst) -> Option<Inst> {
        let next = self.get(inst).next;
        if next.is_valid() {
            Some(next)
        } else {
            None
        }
    }

    /// Whether `inst` references the given virtual register.
    pub fn refs_register(&self, inst: Inst, virt: VirtReg) -> bool {
        self.get(inst).refs.contains(&virt)
    }

    /// Whether `inst` is a label opening an out-of-line cold stream.
    pub fn is_cold_stream_entry_label(&self, inst: Inst) -> bool {
        let data = self.get(inst);
        data.is_label() && data.cold_stream_entry
    }

    /// Append an instruction at the stream tail.
    pub fn push(&mut self, data: InstData) -> Inst {
        let inst = self.alloc(data);
        if let Some(tail) = self.tail() {
            self.insts[tail.index()].next = inst;
            self.insts[inst.index()].prev = tail;
        } else {
            self.head = inst;
        }
        self.tail = inst;
        inst
    }

    /// Link a new instruction immediately after `preceding`. This is
    /// the allocator's only emission primitive.
    pub fn insert_after(&mut self, preceding: Inst, data: InstData) -> Inst {
        let inst = self.alloc(data);
        let next = self.insts[preceding.index()].next;
        self.insts[inst.index()].prev = preceding;
        self.insts[inst.index()].next = next;
        self.insts[preceding.index()].next = inst;
        if next.is_valid() {
            self.insts[next.index()].prev = inst;
        } else {
            self.tail = inst;
        }
        inst
    }

    /// Forward iteration over the linked order.
    pub fn iter(&self) -> impl Iterator<Item = Inst> + '_ {
        let mut cursor = self.head();
        core::iter::from_fn(move || {
            let inst = cursor?;
            cursor = self.next(inst);
            Some(inst)
        })
    }

    fn alloc(&mut self, data: InstData) -> Inst {
        self.insts.push(data);
        Inst::new(self.insts.len() - 1)
    }
}

/// Emit a load of `mem` into `dst`, linked after `preceding`.
pub fn gen_trg1_mem(
    insts: &mut InstStream,
    op: Op,
    dst: RealReg,
    mem: MemRef,
    preceding: Inst,
) -> Inst {
    debug_assert!(matches!(op, Op::LdrImmX | Op::VLdrImmD));
    let mut data = InstData::new(op);
    data.dst = Some(dst);
    data.mem = Some(mem);
    insts.insert_after(preceding, data)
}

/// Emit a store of `src` to `mem`, linked after `preceding`.
pub fn gen_mem_src1(
    insts: &mut InstStream,
    op: Op,
    mem: MemRef,
    src: RealReg,
    preceding: Inst,
) -> Inst {
    debug_assert!(matches!(op, Op::StrImmX | Op::VStrImmD));
    let mut data = InstData::new(op);
    data.mem = Some(mem);
    data.src1 = Some(src);
    insts.insert_after(preceding, data)
}

/// Emit a two-source ALU instruction, linked after `preceding`.
pub fn gen_trg1_src2(
    insts: &mut InstStream,
    op: Op,
    dst: RealReg,
    src1: RealReg,
    src2: RealReg,
    preceding: Inst,
) -> Inst {
    debug_assert!(matches!(op, Op::OrrX | Op::EorX));
    let mut data = InstData::new(op);
    data.dst = Some(dst);
    data.src1 = Some(src1);
    data.src2 = Some(src2);
    insts.insert_after(preceding, data)
}

/// Emit a one-source move, linked after `preceding`.
pub fn gen_trg1_src1(
    insts: &mut InstStream,
    op: Op,
    dst: RealReg,
    src: RealReg,
    preceding: Inst,
) -> Inst {
    debug_assert!(matches!(op, Op::FMovD));
    let mut data = InstData::new(op);
    data.dst = Some(dst);
    data.src1 = Some(src);
    insts.insert_after(preceding, data)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::RealReg;

    #[test]
    fn test_insert_after_order() {
        let mut stream = InstStream::new();
        let a = stream.push(InstData::proc());
        let b = stream.push(InstData::opaque([]));

        // Two insertions against the same anchor: the later one lands
        // closer to the anchor, so code order is the reverse of
        // generation order.
        let c = gen_trg1_src2(&mut stream, Op::EorX, RealReg::x(0), RealReg::x(0), RealReg::x(1), a);
        let d = gen_trg1_src2(&mut stream, Op::EorX, RealReg::x(1), RealReg::x(0), RealReg::x(1), a);

        let order: Vec<Inst> = stream.iter().collect();
        assert_eq!(order, vec![a, d, c, b]);
        assert_eq!(stream.prev(b), Some(c));
        assert_eq!(stream.next(a), Some(d));
    }

    #[test]
    fn test_refs_register() {
        let mut stream = InstStream::new();
        let v0 = crate::VirtReg::new(0);
        let v1 = crate::VirtReg::new(1);
        let i = stream.push(InstData::opaque([v0]));
        assert!(stream.refs_register(i, v0));
        assert!(!stream.refs_register(i, v1));
    }
}
