//! High-level IR.
//!
//! One HIR instruction per language-level operation, in SSA form: every
//! value-producing instruction defines exactly one `Value`, and merge
//! points carry explicit phis. Cross-references are entity indices into the
//! owning [`Frame`](crate::frame::Frame)'s tables.

use smallvec::SmallVec;

use quaver_runtime::{Slot, SlotType, Symbol};

use crate::entity::{entity_impl, PackedOption};

/// An SSA value: the id of the HIR instruction that defines it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// A basic block in the frame's control flow graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// A lexical scope in the frame.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope(u32);
entity_impl!(Scope, "scope");

/// Inferred type set of a value, a bitset over the runtime slot types.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeFlags(u16);

impl TypeFlags {
    pub const NONE: Self = Self(0);
    pub const NIL: Self = Self(1 << 0);
    pub const INTEGER: Self = Self(1 << 1);
    pub const FLOAT: Self = Self(1 << 2);
    pub const BOOLEAN: Self = Self(1 << 3);
    pub const OBJECT: Self = Self(1 << 4);
    pub const SYMBOL: Self = Self(1 << 5);
    pub const CHAR: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7f);

    pub fn of_slot(slot: Slot) -> Self {
        match slot.slot_type() {
            SlotType::Nil => Self::NIL,
            SlotType::Integer => Self::INTEGER,
            SlotType::Float => Self::FLOAT,
            SlotType::Boolean => Self::BOOLEAN,
            SlotType::Object => Self::OBJECT,
            SlotType::Symbol => Self::SYMBOL,
            SlotType::Char => Self::CHAR,
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::fmt::Debug for TypeFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "TypeFlags({:#04x})", self.0)
    }
}

/// HIR opcodes with their operands.
///
/// Frame offsets (`frame_index`) are absolute slot indices including the
/// frame header; class and instance indices count slots past the object
/// header.
#[derive(Clone, PartialEq, Debug)]
pub enum HirOp {
    /// Read argument `index` of the current invocation.
    LoadArgument { index: u32 },
    Constant { value: Slot },
    /// Read a frame slot, through `outer_frame` when the slot belongs to an
    /// enclosing frame reached by a `LoadOuterFrame` chain.
    ReadFromFrame { frame_index: i32, outer_frame: PackedOption<Value>, name: Symbol },
    WriteToFrame { frame_index: i32, outer_frame: PackedOption<Value>, name: Symbol, to_write: Value },
    /// Read class variable `index` through the context's class-variable
    /// array, previously loaded as `class_array`.
    ReadFromClass { class_array: Value, index: u32, name: Symbol },
    WriteToClass { class_array: Value, index: u32, name: Symbol, to_write: Value },
    /// Read instance variable `index` of the receiver `this`.
    ReadFromThis { this: Value, index: u32, name: Symbol },
    WriteToThis { this: Value, index: u32, name: Symbol, to_write: Value },
    /// Read a field of the thread context at byte offset `offset`.
    ReadFromContext { offset: u32, name: Symbol },
    /// Load the frame pointer of the lexically enclosing frame; chained for
    /// deeper nesting.
    LoadOuterFrame { outer: PackedOption<Value> },
    /// Retarget the receiver for superclass dispatch.
    RouteToSuperclass { this: Value },
    /// Message send. `arguments[0]` is the target; keyword arguments are
    /// key/value pairs flattened in order.
    Message {
        selector: Symbol,
        arguments: SmallVec<[Value; 4]>,
        keyword_arguments: SmallVec<[Value; 4]>,
    },
    /// Merge of one value per predecessor, in predecessor order.
    Phi { inputs: SmallVec<[Value; 2]> },
    Branch { target: Block },
    BranchIfTrue { condition: Value, target: Block },
    /// Write the method return value into the caller's return slot.
    StoreReturn { value: Value },
    MethodReturn,
    /// Create a closure over inner frame `frame_index` of the owning frame.
    BlockLiteral { frame_index: u32 },
    /// Read a name captured from an enclosing frame, through the frame
    /// pointer produced by a `LoadOuterFrame` chain.
    ImportName { name: Symbol, outer_frame: Value, frame_index: i32 },
}

impl HirOp {
    /// Does this instruction define a value?
    pub fn produces_value(&self) -> bool {
        !matches!(
            self,
            Self::WriteToFrame { .. }
                | Self::WriteToClass { .. }
                | Self::WriteToThis { .. }
                | Self::Branch { .. }
                | Self::BranchIfTrue { .. }
                | Self::StoreReturn { .. }
                | Self::MethodReturn
        )
    }

    /// Is this instruction a block terminator?
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Branch { .. } | Self::MethodReturn)
    }

    /// The values this instruction reads.
    pub fn reads(&self) -> SmallVec<[Value; 4]> {
        let mut reads = SmallVec::new();
        match self {
            Self::LoadArgument { .. }
            | Self::Constant { .. }
            | Self::ReadFromContext { .. }
            | Self::MethodReturn
            | Self::Branch { .. }
            | Self::BlockLiteral { .. } => {}
            Self::ReadFromFrame { outer_frame, .. } => reads.extend(outer_frame.expand()),
            Self::WriteToFrame { outer_frame, to_write, .. } => {
                reads.extend(outer_frame.expand());
                reads.push(*to_write);
            }
            Self::ReadFromClass { class_array, .. } => reads.push(*class_array),
            Self::WriteToClass { class_array, to_write, .. } => {
                reads.push(*class_array);
                reads.push(*to_write);
            }
            Self::ReadFromThis { this, .. } => reads.push(*this),
            Self::WriteToThis { this, to_write, .. } => {
                reads.push(*this);
                reads.push(*to_write);
            }
            Self::LoadOuterFrame { outer } => reads.extend(outer.expand()),
            Self::RouteToSuperclass { this } => reads.push(*this),
            Self::Message { arguments, keyword_arguments, .. } => {
                reads.extend(arguments.iter().copied());
                reads.extend(keyword_arguments.iter().copied());
            }
            Self::Phi { inputs } => reads.extend(inputs.iter().copied()),
            Self::BranchIfTrue { condition, .. } => reads.push(*condition),
            Self::StoreReturn { value } => reads.push(*value),
            Self::ImportName { outer_frame, .. } => reads.push(*outer_frame),
        }
        reads
    }
}

/// One HIR instruction: its opcode plus the fields every instruction
/// carries.
#[derive(Clone, Debug)]
pub struct Hir {
    pub op: HirOp,
    /// The value this instruction defines; none for effect-only
    /// instructions.
    pub id: PackedOption<Value>,
    pub type_flags: TypeFlags,
    /// The block holding this instruction.
    pub block: Block,
    pub reads: SmallVec<[Value; 4]>,
}

/// Key under which a pure instruction participates in local value
/// numbering. Instructions with the same key in the same block are
/// interchangeable, so the builder reuses the existing value instead of
/// appending a duplicate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LocalKey {
    Constant(u64),
    LoadArgument(u32),
    FrameSlot { frame_index: i32, outer_frame: PackedOption<Value> },
    ThisSlot { this: Value, index: u32 },
    ClassSlot { class_array: Value, index: u32 },
    Context(u32),
    OuterFrame(PackedOption<Value>),
}

impl LocalKey {
    /// The numbering key for a pure read, or `None` when the instruction is
    /// not eligible for reuse.
    pub fn of(op: &HirOp) -> Option<Self> {
        match op {
            HirOp::Constant { value } => Some(Self::Constant(value.bits())),
            HirOp::LoadArgument { index } => Some(Self::LoadArgument(*index)),
            HirOp::ReadFromFrame { frame_index, outer_frame, .. } => {
                Some(Self::FrameSlot { frame_index: *frame_index, outer_frame: *outer_frame })
            }
            HirOp::ImportName { outer_frame, frame_index, .. } => Some(Self::FrameSlot {
                frame_index: *frame_index,
                outer_frame: PackedOption::from(*outer_frame),
            }),
            HirOp::ReadFromThis { this, index, .. } => {
                Some(Self::ThisSlot { this: *this, index: *index })
            }
            HirOp::ReadFromClass { class_array, index, .. } => {
                Some(Self::ClassSlot { class_array: *class_array, index: *index })
            }
            HirOp::ReadFromContext { offset, .. } => Some(Self::Context(*offset)),
            HirOp::LoadOuterFrame { outer } => Some(Self::OuterFrame(*outer)),
            _ => None,
        }
    }

    /// For a write, the read key it forwards to: a later read under that
    /// key sees the written value instead of reloading the slot.
    pub fn forwarded_by(op: &HirOp) -> Option<(Self, Value)> {
        match op {
            HirOp::WriteToFrame { frame_index, outer_frame, to_write, .. } => Some((
                Self::FrameSlot { frame_index: *frame_index, outer_frame: *outer_frame },
                *to_write,
            )),
            HirOp::WriteToThis { this, index, to_write, .. } => {
                Some((Self::ThisSlot { this: *this, index: *index }, *to_write))
            }
            HirOp::WriteToClass { class_array, index, to_write, .. } => {
                Some((Self::ClassSlot { class_array: *class_array, index: *index }, *to_write))
            }
            _ => None,
        }
    }
}
