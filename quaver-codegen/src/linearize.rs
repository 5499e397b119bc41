//! CFG flattening and HIR-to-LIR lowering.
//!
//! Blocks are ordered by reverse postorder with loop bodies kept
//! contiguous, so every non-loop-header block appears after all of its
//! predecessors. Each block becomes a `Label` followed by its phis and its
//! lowered statements, and the block's [start, end) line range is recorded
//! for the lifetime and allocation passes.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use quaver_runtime::{Slot, StatusCode, SLOT_SIZE};

use crate::abi;
use crate::entity::{EntityRef, PackedOption, SecondaryMap};
use crate::error::{internal_error, CodegenResult};
use crate::frame::Frame;
use crate::hir::{Block, Hir, HirOp, Value};
use crate::lifetime::LifetimeInterval;
use crate::lir::{Lir, LirOp, VReg};

/// The flattened frame: one linear instruction stream plus the block
/// structure the later passes need.
pub struct LinearFrame {
    pub instructions: Vec<Lir>,
    /// Blocks in emission order.
    pub block_order: Vec<Block>,
    /// Per-block [start, end) line range; contiguous and covering.
    pub block_ranges: SecondaryMap<Block, (u32, u32)>,
    /// For each loop header, the first line past the end of its loop body.
    pub loop_ends: FxHashMap<Block, u32>,
    /// HIR value to virtual register.
    pub hir_to_vreg: SecondaryMap<Value, PackedOption<VReg>>,
    pub vreg_count: u32,
    /// Lifetime intervals per virtual register, filled by the lifetime
    /// analyzer and extended by the register allocator.
    pub lifetimes: Vec<Vec<LifetimeInterval>>,
    /// Virtual registers live at each block's entry, filled by the
    /// lifetime analyzer and consumed by the resolver.
    pub block_live_in: SecondaryMap<Block, FxHashSet<VReg>>,
    /// Control-flow edges, copied out of the frame so the register passes
    /// need only the linear form.
    pub block_predecessors: SecondaryMap<Block, Vec<Block>>,
    pub block_successors: SecondaryMap<Block, Vec<Block>>,
    /// Spill slots allocated so far; slot 0 is reserved for move cycles.
    pub spill_slot_count: u32,
}

impl LinearFrame {
    fn fresh_vreg(&mut self) -> VReg {
        let vreg = VReg::new(self.vreg_count as usize);
        self.vreg_count += 1;
        vreg
    }

    /// Line of the first instruction of `block` (its label).
    pub fn block_start(&self, block: Block) -> u32 {
        self.block_ranges[block].0
    }

    /// First line past the last instruction of `block`.
    pub fn block_end(&self, block: Block) -> u32 {
        self.block_ranges[block].1
    }
}

/// Flatten `frame` into a `LinearFrame`, lowering every instruction.
pub fn linearize(frame: &Frame) -> CodegenResult<LinearFrame> {
    let order = reverse_postorder(frame);
    log::trace!("linearized {} blocks", order.len());

    let mut linear = LinearFrame {
        instructions: Vec::new(),
        block_order: order,
        block_ranges: SecondaryMap::new(),
        loop_ends: FxHashMap::default(),
        hir_to_vreg: SecondaryMap::new(),
        vreg_count: frame.values.len() as u32,
        lifetimes: Vec::new(),
        block_live_in: SecondaryMap::new(),
        block_predecessors: SecondaryMap::new(),
        block_successors: SecondaryMap::new(),
        spill_slot_count: 1,
    };

    for (block, data) in frame.blocks.iter() {
        linear.block_predecessors[block] = data.predecessors.clone();
        linear.block_successors[block] = data.successors.clone();
    }

    // Values and their registers correspond one to one; lowering
    // temporaries take numbers past the value count.
    for value in frame.values.keys() {
        linear.hir_to_vreg[value] = VReg::new(value.index()).into();
    }

    let block_order = linear.block_order.clone();
    for &block in &block_order {
        let start = linear.instructions.len() as u32;
        linear.instructions.push(Lir::new(LirOp::Label { block }, PackedOption::none()));

        let mut lowering = BlockLowering::new(&mut linear);
        for phi in &frame.blocks[block].phis {
            lowering.lower_phi(phi)?;
        }
        for hir in &frame.blocks[block].statements {
            lowering.lower(hir)?;
        }

        let end = linear.instructions.len() as u32;
        linear.block_ranges[block] = (start, end);
    }

    compute_loop_ends(frame, &mut linear);
    Ok(linear)
}

/// Reverse postorder from the entry block. Successors are visited last to
/// first so that the reversed order keeps loop bodies and the true branch
/// of a conditional immediately after their headers.
fn reverse_postorder(frame: &Frame) -> Vec<Block> {
    enum Step {
        Visit(Block),
        Emit(Block),
    }

    let mut postorder = Vec::with_capacity(frame.blocks.len());
    let mut visited = FxHashSet::default();
    let mut stack = vec![Step::Visit(frame.entry_block())];

    while let Some(step) = stack.pop() {
        match step {
            Step::Visit(block) => {
                if !visited.insert(block) {
                    continue;
                }
                stack.push(Step::Emit(block));
                for &successor in &frame.blocks[block].successors {
                    stack.push(Step::Visit(successor));
                }
            }
            Step::Emit(block) => postorder.push(block),
        }
    }

    postorder.reverse();
    postorder
}

/// A back edge is one whose target does not come after its source in the
/// linear order; its target is a loop header whose body extends to the end
/// of the source block.
fn compute_loop_ends(frame: &Frame, linear: &mut LinearFrame) {
    for &block in &linear.block_order {
        for &successor in &frame.blocks[block].successors {
            if linear.block_start(successor) <= linear.block_start(block) {
                let end = linear.block_end(block);
                let entry = linear.loop_ends.entry(successor).or_insert(end);
                *entry = (*entry).max(end);
            }
        }
    }
}

/// Lowering state for one block.
struct BlockLowering<'a> {
    linear: &'a mut LinearFrame,
    /// Register holding the current frame pointer, loaded at most once per
    /// block.
    frame_pointer: Option<VReg>,
}

impl<'a> BlockLowering<'a> {
    fn new(linear: &'a mut LinearFrame) -> Self {
        Self { linear, frame_pointer: None }
    }

    fn vreg(&self, value: Value) -> CodegenResult<VReg> {
        self.linear.hir_to_vreg[value]
            .expand()
            .ok_or_else(|| internal_error!("value {} has no virtual register", value))
    }

    fn push(&mut self, op: LirOp, value: PackedOption<VReg>) {
        self.linear.instructions.push(Lir::new(op, value));
    }

    /// Materialize the frame pointer for this block.
    fn frame_pointer(&mut self) -> VReg {
        if let Some(fp) = self.frame_pointer {
            return fp;
        }
        let fp = self.linear.fresh_vreg();
        self.push(LirOp::LoadFramePointer, fp.into());
        self.frame_pointer = Some(fp);
        fp
    }

    fn lower_phi(&mut self, phi: &Hir) -> CodegenResult<()> {
        let HirOp::Phi { inputs } = &phi.op else {
            return Err(internal_error!("non-phi instruction in phi list"));
        };
        let mut vregs: SmallVec<[VReg; 2]> = SmallVec::new();
        for &input in inputs {
            vregs.push(self.vreg(input)?);
        }
        let dest = self.vreg(phi.id.unwrap())?;
        self.push(LirOp::Phi { inputs: vregs }, dest.into());
        Ok(())
    }

    fn lower(&mut self, hir: &Hir) -> CodegenResult<()> {
        let dest: PackedOption<VReg> = match hir.id.expand() {
            Some(value) => self.vreg(value)?.into(),
            None => PackedOption::none(),
        };

        match &hir.op {
            HirOp::LoadArgument { index } => {
                let byte_offset = (abi::FRAME_HEADER_SLOTS + *index as i32) * SLOT_SIZE as i32;
                let frame = self.frame_pointer();
                self.push(LirOp::LoadFromFrame { byte_offset, frame }, dest);
            }
            HirOp::Constant { value } => {
                self.push(LirOp::LoadConstant { value: *value }, dest);
            }
            HirOp::ReadFromFrame { frame_index, outer_frame, .. } => {
                let frame = match outer_frame.expand() {
                    Some(outer) => self.vreg(outer)?,
                    None => self.frame_pointer(),
                };
                let byte_offset = frame_index * SLOT_SIZE as i32;
                self.push(LirOp::LoadFromFrame { byte_offset, frame }, dest);
            }
            HirOp::WriteToFrame { frame_index, outer_frame, to_write, .. } => {
                let frame = match outer_frame.expand() {
                    Some(outer) => self.vreg(outer)?,
                    None => self.frame_pointer(),
                };
                let byte_offset = frame_index * SLOT_SIZE as i32;
                let src = self.vreg(*to_write)?;
                self.push(LirOp::StoreToFrame { byte_offset, frame, src }, dest);
            }
            HirOp::ReadFromClass { class_array, index, .. } => {
                let pointer = self.vreg(*class_array)?;
                let byte_offset = (*index as i32) * SLOT_SIZE as i32;
                self.push(LirOp::LoadFromPointer { pointer: pointer.into(), byte_offset }, dest);
            }
            HirOp::WriteToClass { class_array, index, to_write, .. } => {
                let pointer = self.vreg(*class_array)?;
                let byte_offset = (*index as i32) * SLOT_SIZE as i32;
                let src = self.vreg(*to_write)?;
                self.push(
                    LirOp::StoreToPointer { pointer: pointer.into(), byte_offset, src },
                    dest,
                );
            }
            HirOp::ReadFromThis { this, index, .. } => {
                let pointer = self.vreg(*this)?;
                let byte_offset =
                    quaver_runtime::HEADER_SIZE as i32 + (*index as i32) * SLOT_SIZE as i32;
                self.push(LirOp::LoadFromPointer { pointer: pointer.into(), byte_offset }, dest);
            }
            HirOp::WriteToThis { this, index, to_write, .. } => {
                let pointer = self.vreg(*this)?;
                let byte_offset =
                    quaver_runtime::HEADER_SIZE as i32 + (*index as i32) * SLOT_SIZE as i32;
                let src = self.vreg(*to_write)?;
                self.push(
                    LirOp::StoreToPointer { pointer: pointer.into(), byte_offset, src },
                    dest,
                );
            }
            HirOp::ReadFromContext { offset, .. } => {
                self.push(
                    LirOp::LoadFromPointer {
                        pointer: PackedOption::none(),
                        byte_offset: *offset as i32,
                    },
                    dest,
                );
            }
            HirOp::LoadOuterFrame { outer } => {
                let frame = match outer.expand() {
                    Some(outer) => self.vreg(outer)?,
                    None => self.frame_pointer(),
                };
                let byte_offset = abi::OUTER_FRAME_SLOT * SLOT_SIZE as i32;
                self.push(LirOp::LoadFromFrame { byte_offset, frame }, dest);
            }
            HirOp::RouteToSuperclass { this } => {
                let src = self.vreg(*this)?;
                self.push(LirOp::Assign { src }, dest);
            }
            HirOp::Message { selector, arguments, keyword_arguments } => {
                self.lower_message(*selector, arguments, keyword_arguments, dest)?;
            }
            HirOp::Phi { .. } => {
                return Err(internal_error!("phi outside a block's phi list"));
            }
            HirOp::Branch { target } => {
                self.push(LirOp::Branch { target: *target }, dest);
            }
            HirOp::BranchIfTrue { condition, target } => {
                let condition = self.vreg(*condition)?;
                self.push(LirOp::BranchIfTrue { condition, target: *target }, dest);
            }
            HirOp::StoreReturn { value } => {
                let src = self.vreg(*value)?;
                let byte_offset = abi::RETURN_VALUE_STACK_SLOT * SLOT_SIZE as i32;
                self.push(LirOp::StoreToStack { byte_offset, src }, dest);
            }
            HirOp::MethodReturn => {
                self.push(LirOp::Interrupt { status: StatusCode::Return as i32 }, dest);
            }
            HirOp::BlockLiteral { frame_index } => {
                let index = self.linear.fresh_vreg();
                self.push(LirOp::LoadImmediate { value: *frame_index as i64 }, index.into());
                self.push(
                    LirOp::StoreToStack {
                        byte_offset: abi::CALL_TARGET_STACK_SLOT * SLOT_SIZE as i32,
                        src: index,
                    },
                    PackedOption::none(),
                );
                self.push(
                    LirOp::Interrupt { status: StatusCode::MakeClosure as i32 },
                    PackedOption::none(),
                );
                let byte_offset = abi::RETURN_VALUE_STACK_SLOT * SLOT_SIZE as i32;
                self.push(LirOp::LoadFromStack { byte_offset }, dest);
            }
            HirOp::ImportName { outer_frame, frame_index, .. } => {
                let frame = self.vreg(*outer_frame)?;
                let byte_offset = frame_index * SLOT_SIZE as i32;
                self.push(LirOp::LoadFromFrame { byte_offset, frame }, dest);
            }
        }
        Ok(())
    }

    /// A message send builds the outgoing call area on the managed stack,
    /// interrupts to the host dispatcher, and reads the result back from
    /// the return-value slot.
    fn lower_message(
        &mut self,
        selector: quaver_runtime::Symbol,
        arguments: &SmallVec<[Value; 4]>,
        keyword_arguments: &SmallVec<[Value; 4]>,
        dest: PackedOption<VReg>,
    ) -> CodegenResult<()> {
        if arguments.is_empty() {
            return Err(internal_error!("message send without a target"));
        }
        let slot = SLOT_SIZE as i32;

        let target = self.vreg(arguments[0])?;
        self.push(
            LirOp::StoreToStack { byte_offset: abi::CALL_TARGET_STACK_SLOT * slot, src: target },
            PackedOption::none(),
        );

        let selector_value = self.linear.fresh_vreg();
        self.push(LirOp::LoadConstant { value: selector.slot() }, selector_value.into());
        self.push(
            LirOp::StoreToStack {
                byte_offset: abi::CALL_SELECTOR_STACK_SLOT * slot,
                src: selector_value,
            },
            PackedOption::none(),
        );

        let argc = self.linear.fresh_vreg();
        let positional = (arguments.len() - 1) as i32;
        self.push(
            LirOp::LoadConstant { value: Slot::from_int32(positional) },
            argc.into(),
        );
        self.push(
            LirOp::StoreToStack { byte_offset: abi::CALL_ARG_COUNT_STACK_SLOT * slot, src: argc },
            PackedOption::none(),
        );

        let kwargc = self.linear.fresh_vreg();
        let keyword_pairs = (keyword_arguments.len() / 2) as i32;
        self.push(
            LirOp::LoadConstant { value: Slot::from_int32(keyword_pairs) },
            kwargc.into(),
        );
        self.push(
            LirOp::StoreToStack {
                byte_offset: abi::CALL_KWARG_COUNT_STACK_SLOT * slot,
                src: kwargc,
            },
            PackedOption::none(),
        );

        let mut outgoing = abi::CALL_ARGS_BASE_STACK_SLOT;
        for &argument in arguments[1..].iter().chain(keyword_arguments.iter()) {
            let src = self.vreg(argument)?;
            self.push(
                LirOp::StoreToStack { byte_offset: outgoing * slot, src },
                PackedOption::none(),
            );
            outgoing += 1;
        }

        self.push(
            LirOp::Interrupt { status: StatusCode::Dispatch as i32 },
            PackedOption::none(),
        );
        self.push(
            LirOp::LoadFromStack { byte_offset: abi::RETURN_VALUE_STACK_SLOT * slot },
            dest,
        );
        Ok(())
    }
}
