//! The frame graph: scopes, blocks, and the SSA value table.
//!
//! A `Frame` is one callable unit — a top-level expression, a method body,
//! or a block literal. It exclusively owns its scopes, its blocks, and
//! every HIR instruction in them; all cross-references are entity indices,
//! which makes the block graph's cycles trivial to represent.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use quaver_runtime::{Slot, Symbol};

use crate::entity::{EntityRef, PackedOption, PrimaryMap};
use crate::hir::{Block, Hir, HirOp, LocalKey, Scope, TypeFlags, Value};

/// A lexical scope: a region of the frame with its own name bindings.
#[derive(Debug, Default)]
pub struct ScopeData {
    pub parent: PackedOption<Scope>,
    pub sub_scopes: Vec<Scope>,
    /// Blocks owned by this scope; the first is the scope's entry.
    pub blocks: Vec<Block>,
    /// Name to absolute frame-slot index.
    pub value_indices: FxHashMap<Symbol, i32>,
}

/// A basic block of straight-line HIR.
#[derive(Debug)]
pub struct BlockData {
    pub scope: Scope,
    /// Predecessors in the order their edges were wired; phi inputs
    /// parallel this order.
    pub predecessors: Vec<Block>,
    pub successors: Vec<Block>,
    pub phis: Vec<Hir>,
    pub statements: Vec<Hir>,
    /// A sealed block admits no new predecessors.
    pub sealed: bool,
    /// Value of the last expression built in this block.
    pub final_value: PackedOption<Value>,
    /// The block ends in a method return, so nothing may follow it.
    pub has_method_return: bool,
    /// Local value numbering: pure reads already computed in this block.
    local_values: FxHashMap<LocalKey, Value>,
}

/// Where a value's defining instruction lives.
#[derive(Clone, Copy, Debug)]
pub struct ValueDef {
    pub block: Block,
    pub index: u32,
    pub is_phi: bool,
}

/// A callable unit under construction or awaiting lowering.
pub struct Frame {
    pub scopes: PrimaryMap<Scope, ScopeData>,
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Every value id maps back to the instruction that defines it.
    pub values: PrimaryMap<Value, ValueDef>,
    pub root_scope: Scope,
    /// Default values for every frame slot past the header, in slot order.
    pub prototype: Vec<Slot>,
    pub argument_names: Vec<Symbol>,
    pub argument_defaults: Vec<Slot>,
    pub variable_names: Vec<Symbol>,
    /// Frames of block literals nested inside this one, indexed by the
    /// `frame_index` of their `BlockLiteral` instruction.
    pub inner_frames: Vec<Frame>,
    /// For a nested frame, the `BlockLiteral` value in the parent frame
    /// that created it.
    pub enclosing_literal: Option<Value>,
}

impl Frame {
    /// Create a frame with its root scope and a sealed entry block.
    pub fn new() -> Self {
        let mut frame = Self {
            scopes: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            values: PrimaryMap::new(),
            root_scope: Scope::new(0),
            prototype: Vec::new(),
            argument_names: Vec::new(),
            argument_defaults: Vec::new(),
            variable_names: Vec::new(),
            inner_frames: Vec::new(),
            enclosing_literal: None,
        };
        frame.root_scope = frame.scopes.push(ScopeData::default());
        let entry = frame.make_block(frame.root_scope);
        frame.seal_block(entry);
        frame
    }

    /// The frame's entry block.
    pub fn entry_block(&self) -> Block {
        self.scopes[self.root_scope].blocks[0]
    }

    /// Create a child scope of `parent`.
    pub fn make_scope(&mut self, parent: Scope) -> Scope {
        let scope = self.scopes.push(ScopeData {
            parent: parent.into(),
            ..ScopeData::default()
        });
        self.scopes[parent].sub_scopes.push(scope);
        scope
    }

    /// Create a block owned by `scope`. Blocks start unsealed; seal them
    /// once their predecessor list is complete.
    pub fn make_block(&mut self, scope: Scope) -> Block {
        let block = self.blocks.push(BlockData {
            scope,
            predecessors: Vec::new(),
            successors: Vec::new(),
            phis: Vec::new(),
            statements: Vec::new(),
            sealed: false,
            final_value: PackedOption::none(),
            has_method_return: false,
            local_values: FxHashMap::default(),
        });
        self.scopes[scope].blocks.push(block);
        block
    }

    /// Wire a control-flow edge. The successor must not be sealed yet.
    pub fn add_edge(&mut self, predecessor: Block, successor: Block) {
        debug_assert!(!self.blocks[successor].sealed, "{} gained a predecessor after sealing", successor);
        self.blocks[predecessor].successors.push(successor);
        self.blocks[successor].predecessors.push(predecessor);
    }

    /// Seal `block`: its predecessor list is now complete.
    pub fn seal_block(&mut self, block: Block) {
        self.blocks[block].sealed = true;
    }

    /// Append an instruction to `block`, returning the value it defines.
    ///
    /// Pure reads are value-numbered against the block's local map: an
    /// equivalent instruction already present yields its existing value and
    /// appends nothing. Writes forward their stored value to later reads of
    /// the same storage.
    pub fn append(&mut self, block: Block, op: HirOp) -> PackedOption<Value> {
        if let Some(key) = LocalKey::of(&op) {
            if let Some(&existing) = self.blocks[block].local_values.get(&key) {
                return existing.into();
            }
        }

        let id = if op.produces_value() {
            PackedOption::from(self.values.next_key())
        } else {
            PackedOption::none()
        };
        let type_flags = self.infer_flags(&op);
        let reads = op.reads();

        if let Some(key) = LocalKey::of(&op) {
            let defined = id.unwrap();
            self.blocks[block].local_values.insert(key, defined);
        }
        if let Some((key, value)) = LocalKey::forwarded_by(&op) {
            self.blocks[block].local_values.insert(key, value);
        }

        let index = self.blocks[block].statements.len() as u32;
        if let Some(value) = id.expand() {
            let allocated = self.values.push(ValueDef { block, index, is_phi: false });
            debug_assert_eq!(allocated, value);
        }
        if matches!(op, HirOp::MethodReturn) {
            self.blocks[block].has_method_return = true;
        }
        // A send can write frame slots, instance variables, and class
        // variables through closures or the receiver, so cached reads of
        // mutable storage are stale past it.
        if matches!(op, HirOp::Message { .. }) {
            self.blocks[block].local_values.retain(|key, _| {
                matches!(key, LocalKey::Constant(_) | LocalKey::Context(_) | LocalKey::OuterFrame(_))
            });
        }
        self.blocks[block].statements.push(Hir { op, id, type_flags, block, reads });
        id
    }

    /// Append a phi at the head of `block`. Inputs must parallel the
    /// block's predecessor order.
    pub fn append_phi(&mut self, block: Block, inputs: SmallVec<[Value; 2]>) -> Value {
        let type_flags = inputs
            .iter()
            .fold(TypeFlags::NONE, |flags, &input| flags.union(self.value_hir(input).type_flags));
        let op = HirOp::Phi { inputs };
        let reads = op.reads();
        let index = self.blocks[block].phis.len() as u32;
        let value = self.values.push(ValueDef { block, index, is_phi: true });
        self.blocks[block].phis.push(Hir {
            op,
            id: value.into(),
            type_flags,
            block,
            reads,
        });
        value
    }

    /// The instruction defining `value`.
    pub fn value_hir(&self, value: Value) -> &Hir {
        let def = self.values[value];
        let block = &self.blocks[def.block];
        if def.is_phi {
            &block.phis[def.index as usize]
        } else {
            &block.statements[def.index as usize]
        }
    }

    fn infer_flags(&self, op: &HirOp) -> TypeFlags {
        match op {
            HirOp::Constant { value } => TypeFlags::of_slot(*value),
            HirOp::RouteToSuperclass { .. } | HirOp::BlockLiteral { .. } => TypeFlags::OBJECT,
            HirOp::LoadOuterFrame { .. } => TypeFlags::OBJECT,
            op if op.produces_value() => TypeFlags::ALL,
            _ => TypeFlags::NONE,
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
