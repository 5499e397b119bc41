//! Low-level IR: a three-address register machine.
//!
//! Lowering rewrites each HIR instruction into one or more LIR
//! instructions over an unbounded set of virtual registers. The register
//! allocator and resolver then annotate each instruction with the physical
//! location of every operand and with the moves that must execute before
//! it.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use quaver_runtime::Slot;

use crate::entity::{entity_impl, PackedOption};
use crate::hir::Block;

/// A virtual register holding one SSA value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "vr");

/// A physical location: a machine register or a spill slot. Spill slot 0
/// is reserved for breaking move cycles.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Loc {
    Reg(u32),
    Spill(u32),
}

impl Loc {
    pub fn is_reg(self) -> bool {
        matches!(self, Self::Reg(_))
    }

    pub fn is_spill(self) -> bool {
        matches!(self, Self::Spill(_))
    }
}

impl core::fmt::Display for Loc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Reg(r) => write!(f, "r{}", r),
            Self::Spill(s) => write!(f, "s{}", s),
        }
    }
}

/// LIR opcodes. Slot-granular frame and stack offsets have already been
/// scaled to bytes by lowering; context offsets were bytes to begin with.
#[derive(Clone, PartialEq, Debug)]
pub enum LirOp {
    /// Register copy.
    Assign { src: VReg },
    /// Load a tagged slot constant.
    LoadConstant { value: Slot },
    /// Load a raw machine word.
    LoadImmediate { value: i64 },
    /// Load the current frame pointer from the thread context.
    LoadFramePointer,
    /// Load from a frame slot through the frame pointer in `frame`.
    LoadFromFrame { byte_offset: i32, frame: VReg },
    StoreToFrame { byte_offset: i32, frame: VReg, src: VReg },
    /// Load relative to the managed stack pointer.
    LoadFromStack { byte_offset: i32 },
    StoreToStack { byte_offset: i32, src: VReg },
    /// Load through an arbitrary pointer register; a missing pointer reads
    /// relative to the reserved thread-context register.
    LoadFromPointer { pointer: PackedOption<VReg>, byte_offset: i32 },
    StoreToPointer { pointer: PackedOption<VReg>, byte_offset: i32, src: VReg },
    BranchToRegister { target: VReg },
    Branch { target: Block },
    BranchIfTrue { condition: VReg, target: Block },
    /// Start of block `block`; every block begins with exactly one label.
    Label { block: Block },
    /// SSA merge; resolved into moves before emission.
    Phi { inputs: SmallVec<[VReg; 2]> },
    /// Store `status` in the thread context and branch to the saved exit
    /// address, handing control to the host.
    Interrupt { status: i32 },
}

impl LirOp {
    /// Does this instruction define a register?
    pub fn produces_value(&self) -> bool {
        matches!(
            self,
            Self::Assign { .. }
                | Self::LoadConstant { .. }
                | Self::LoadImmediate { .. }
                | Self::LoadFramePointer
                | Self::LoadFromFrame { .. }
                | Self::LoadFromStack { .. }
                | Self::LoadFromPointer { .. }
                | Self::Phi { .. }
        )
    }

    /// The virtual registers this instruction reads.
    pub fn reads(&self) -> SmallVec<[VReg; 4]> {
        let mut reads = SmallVec::new();
        match self {
            Self::Assign { src } => reads.push(*src),
            Self::LoadFromFrame { frame, .. } => reads.push(*frame),
            Self::StoreToFrame { frame, src, .. } => {
                reads.push(*frame);
                reads.push(*src);
            }
            Self::StoreToStack { src, .. } => reads.push(*src),
            Self::LoadFromPointer { pointer, .. } => reads.extend(pointer.expand()),
            Self::StoreToPointer { pointer, src, .. } => {
                reads.extend(pointer.expand());
                reads.push(*src);
            }
            Self::BranchToRegister { target } => reads.push(*target),
            Self::BranchIfTrue { condition, .. } => reads.push(*condition),
            Self::Phi { inputs } => reads.extend(inputs.iter().copied()),
            _ => {}
        }
        reads
    }

    /// True when executing this instruction destroys every register, so
    /// the allocator must spill all live values around it. Message
    /// dispatch hands control to the host, which preserves nothing.
    pub fn preserves_no_registers(&self) -> bool {
        matches!(self, Self::Interrupt { .. })
    }
}

/// One LIR instruction plus the annotations later passes attach to it.
#[derive(Clone, Debug)]
pub struct Lir {
    pub op: LirOp,
    /// Destination virtual register; none for effect-only instructions.
    pub value: PackedOption<VReg>,
    pub reads: SmallVec<[VReg; 4]>,
    /// Physical location of each operand at this line, filled in by the
    /// register allocator.
    pub locations: FxHashMap<VReg, Loc>,
    /// Moves to execute before this instruction, keyed by origin. Each
    /// origin is copied at most once and each destination written at most
    /// once.
    pub moves: FxHashMap<Loc, Loc>,
}

impl Lir {
    pub fn new(op: LirOp, value: PackedOption<VReg>) -> Self {
        let mut reads = op.reads();
        if !matches!(op, LirOp::Phi { .. }) {
            reads.sort_unstable();
            reads.dedup();
        }
        Self { op, value, reads, locations: FxHashMap::default(), moves: FxHashMap::default() }
    }
}
