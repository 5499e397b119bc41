//! Machine-code emission through an abstract instruction sink.
//!
//! The emitter walks the resolved LIR in line order: pending moves first
//! (ordered by the move scheduler), then the instruction itself, dispatched
//! to a [`CodeSink`]. Branch targets are resolved in two passes — the walk
//! records each label's offset and every branch fixup site, then the
//! displacements are patched. The per-architecture encoder behind the sink
//! is out of scope here; the word sink below emits a portable fixed-width
//! encoding suitable for a trampoline interpreter and for tests.

use rustc_hash::FxHashMap;

use quaver_runtime::{CodePage, Heap};

use crate::error::{internal_error, CodegenError, CodegenResult};
use crate::hir::Block;
use crate::linearize::LinearFrame;
use crate::lir::{Lir, LirOp, Loc};
use crate::moves::{schedule_moves, MoveOp};
use crate::regalloc::{MachineDesc, CONTEXT_REGISTER, FIRST_ALLOCATABLE, STACK_POINTER_REGISTER};

use quaver_runtime::{ThreadContext, SLOT_SIZE};

/// Byte offset of spill slot `slot`, relative to the stack pointer. The
/// spill area sits below the return-value slot.
pub fn spill_slot_offset(slot: u32) -> i32 {
    -((slot as i32 + 2) * SLOT_SIZE as i32)
}

/// Architecture-specific instruction writer.
///
/// Register numbers follow the allocator's convention: register 0 is the
/// thread-context pointer and register 1 the managed stack pointer.
pub trait CodeSink {
    /// Current write position, used for labels and patches.
    fn offset(&self) -> usize;

    fn mov_reg(&mut self, dst: u32, src: u32);
    fn mov_imm(&mut self, dst: u32, bits: u64);
    fn xor_reg(&mut self, dst: u32, a: u32, b: u32);
    /// `dst = *(base + byte_offset)`
    fn load(&mut self, dst: u32, base: u32, byte_offset: i32);
    /// `*(base + byte_offset) = src`
    fn store(&mut self, src: u32, base: u32, byte_offset: i32);
    /// Unconditional jump with a displacement patched later; returns the
    /// fixup site.
    fn jump(&mut self) -> usize;
    /// Jump when `condition` holds the true slot; displacement patched
    /// later.
    fn jump_if_true(&mut self, condition: u32) -> usize;
    fn jump_to_register(&mut self, target: u32);
    /// Store `status` into the thread context and branch to the saved
    /// exit address.
    fn interrupt(&mut self, status: i32);
    /// Patch the displacement recorded at `fixup` to `target_offset`.
    fn patch_jump(&mut self, fixup: usize, target_offset: usize);
    /// Bytes written so far exceed the sink's capacity.
    fn overflowed(&self) -> bool {
        false
    }
}

/// Emit the whole frame into `sink`. Returns the entry offset.
pub fn emit(linear: &LinearFrame, machine: &MachineDesc, sink: &mut dyn CodeSink) -> CodegenResult<usize> {
    let entry = sink.offset();
    let mut labels: FxHashMap<Block, usize> = FxHashMap::default();
    let mut fixups: Vec<(usize, Block)> = Vec::new();

    for (line, instruction) in linear.instructions.iter().enumerate() {
        if !instruction.moves.is_empty() {
            let free = free_register(linear, line as u32, instruction, machine);
            emit_moves(instruction, free, sink)?;
        }
        emit_instruction(instruction, sink, &mut labels, &mut fixups)?;
        if sink.overflowed() {
            return Err(CodegenError::MachineCodeOverflow { capacity: sink.offset() });
        }
    }

    for (fixup, block) in fixups {
        let target = labels
            .get(&block)
            .copied()
            .ok_or_else(|| internal_error!("branch to unemitted {}", block))?;
        sink.patch_jump(fixup, target);
    }
    Ok(entry)
}

/// Execute the instruction's pending moves, scheduled against a register
/// known to be free at this line when one exists.
fn emit_moves(
    instruction: &Lir,
    free: Option<u32>,
    sink: &mut dyn CodeSink,
) -> CodegenResult<()> {
    for op in schedule_moves(&instruction.moves, free)? {
        match op {
            MoveOp::Copy { from, to } => match (from, to) {
                (Loc::Reg(src), Loc::Reg(dst)) => sink.mov_reg(dst, src),
                (Loc::Reg(src), Loc::Spill(slot)) => {
                    sink.store(src, STACK_POINTER_REGISTER, spill_slot_offset(slot));
                }
                (Loc::Spill(slot), Loc::Reg(dst)) => {
                    sink.load(dst, STACK_POINTER_REGISTER, spill_slot_offset(slot));
                }
                (Loc::Spill(_), Loc::Spill(_)) => {
                    return Err(internal_error!("unscheduled spill-to-spill move"));
                }
            },
            MoveOp::Swap { a, b } => {
                sink.xor_reg(a, a, b);
                sink.xor_reg(b, b, a);
                sink.xor_reg(a, a, b);
            }
        }
    }
    Ok(())
}

/// A register holding no value live at `line` and untouched by the
/// line's own moves.
fn free_register(
    linear: &LinearFrame,
    line: u32,
    instruction: &Lir,
    machine: &MachineDesc,
) -> Option<u32> {
    let mut used = [false; 64];
    for lifetimes in &linear.lifetimes {
        for interval in lifetimes {
            if let Some(Loc::Reg(register)) = interval.location {
                if interval.covers(line) {
                    used[register as usize] = true;
                }
            }
        }
    }
    for (&from, &to) in &instruction.moves {
        for location in [from, to] {
            if let Loc::Reg(register) = location {
                used[register as usize] = true;
            }
        }
    }
    (FIRST_ALLOCATABLE..machine.register_count).find(|&register| !used[register as usize])
}

fn emit_instruction(
    instruction: &Lir,
    sink: &mut dyn CodeSink,
    labels: &mut FxHashMap<Block, usize>,
    fixups: &mut Vec<(usize, Block)>,
) -> CodegenResult<()> {
    let reg = |vreg| -> CodegenResult<u32> {
        match instruction.locations.get(&vreg) {
            Some(Loc::Reg(register)) => Ok(*register),
            Some(Loc::Spill(slot)) => {
                Err(internal_error!("operand {} still in spill slot {}", vreg, slot))
            }
            None => Err(internal_error!("operand {} has no recorded location", vreg)),
        }
    };
    let dst = |value: crate::entity::PackedOption<crate::lir::VReg>| -> CodegenResult<u32> {
        reg(value.expand().ok_or_else(|| internal_error!("instruction missing destination"))?)
    };

    match &instruction.op {
        LirOp::Label { block } => {
            labels.insert(*block, sink.offset());
        }
        LirOp::Assign { src } => {
            let (to, from) = (dst(instruction.value)?, reg(*src)?);
            if to != from {
                sink.mov_reg(to, from);
            }
        }
        LirOp::LoadConstant { value } => sink.mov_imm(dst(instruction.value)?, value.bits()),
        LirOp::LoadImmediate { value } => sink.mov_imm(dst(instruction.value)?, *value as u64),
        LirOp::LoadFramePointer => sink.load(
            dst(instruction.value)?,
            CONTEXT_REGISTER,
            ThreadContext::offset_of_frame_pointer() as i32,
        ),
        LirOp::LoadFromFrame { byte_offset, frame } => {
            sink.load(dst(instruction.value)?, reg(*frame)?, *byte_offset);
        }
        LirOp::StoreToFrame { byte_offset, frame, src } => {
            sink.store(reg(*src)?, reg(*frame)?, *byte_offset);
        }
        LirOp::LoadFromStack { byte_offset } => {
            sink.load(dst(instruction.value)?, STACK_POINTER_REGISTER, *byte_offset);
        }
        LirOp::StoreToStack { byte_offset, src } => {
            sink.store(reg(*src)?, STACK_POINTER_REGISTER, *byte_offset);
        }
        LirOp::LoadFromPointer { pointer, byte_offset } => {
            let base = match pointer.expand() {
                Some(pointer) => reg(pointer)?,
                None => CONTEXT_REGISTER,
            };
            sink.load(dst(instruction.value)?, base, *byte_offset);
        }
        LirOp::StoreToPointer { pointer, byte_offset, src } => {
            let base = match pointer.expand() {
                Some(pointer) => reg(pointer)?,
                None => CONTEXT_REGISTER,
            };
            sink.store(reg(*src)?, base, *byte_offset);
        }
        LirOp::BranchToRegister { target } => sink.jump_to_register(reg(*target)?),
        LirOp::Branch { target } => {
            let fixup = sink.jump();
            fixups.push((fixup, *target));
        }
        LirOp::BranchIfTrue { condition, target } => {
            let fixup = sink.jump_if_true(reg(*condition)?);
            fixups.push((fixup, *target));
        }
        LirOp::Phi { .. } => {}
        LirOp::Interrupt { status } => sink.interrupt(*status),
    }
    Ok(())
}

/// One recorded sink operation, for tests and for the virtual backend.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SinkOp {
    MovReg { dst: u32, src: u32 },
    MovImm { dst: u32, bits: u64 },
    Xor { dst: u32, a: u32, b: u32 },
    Load { dst: u32, base: u32, byte_offset: i32 },
    Store { src: u32, base: u32, byte_offset: i32 },
    Jump { target: Option<usize> },
    JumpIfTrue { condition: u32, target: Option<usize> },
    JumpToRegister { target: u32 },
    Interrupt { status: i32 },
}

/// A sink that records operations instead of encoding them. Offsets are
/// operation indices.
#[derive(Default)]
pub struct RecordingSink {
    pub ops: Vec<SinkOp>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeSink for RecordingSink {
    fn offset(&self) -> usize {
        self.ops.len()
    }

    fn mov_reg(&mut self, dst: u32, src: u32) {
        self.ops.push(SinkOp::MovReg { dst, src });
    }

    fn mov_imm(&mut self, dst: u32, bits: u64) {
        self.ops.push(SinkOp::MovImm { dst, bits });
    }

    fn xor_reg(&mut self, dst: u32, a: u32, b: u32) {
        self.ops.push(SinkOp::Xor { dst, a, b });
    }

    fn load(&mut self, dst: u32, base: u32, byte_offset: i32) {
        self.ops.push(SinkOp::Load { dst, base, byte_offset });
    }

    fn store(&mut self, src: u32, base: u32, byte_offset: i32) {
        self.ops.push(SinkOp::Store { src, base, byte_offset });
    }

    fn jump(&mut self) -> usize {
        self.ops.push(SinkOp::Jump { target: None });
        self.ops.len() - 1
    }

    fn jump_if_true(&mut self, condition: u32) -> usize {
        self.ops.push(SinkOp::JumpIfTrue { condition, target: None });
        self.ops.len() - 1
    }

    fn jump_to_register(&mut self, target: u32) {
        self.ops.push(SinkOp::JumpToRegister { target });
    }

    fn interrupt(&mut self, status: i32) {
        self.ops.push(SinkOp::Interrupt { status });
    }

    fn patch_jump(&mut self, fixup: usize, target_offset: usize) {
        match &mut self.ops[fixup] {
            SinkOp::Jump { target } | SinkOp::JumpIfTrue { target, .. } => {
                *target = Some(target_offset);
            }
            op => panic!("patching a non-branch operation {:?}", op),
        }
    }
}

/// Fixed-width word encoding: every operation is 16 bytes, little endian
/// `{opcode: u32, a: u32, b: u32, c: u32}`, with immediates in a trailing
/// 8-byte extension word.
pub struct WordSink {
    bytes: Vec<u8>,
    capacity: usize,
}

const WORD: usize = 16;

mod word_op {
    pub const MOV_REG: u32 = 1;
    pub const MOV_IMM: u32 = 2;
    pub const XOR: u32 = 3;
    pub const LOAD: u32 = 4;
    pub const STORE: u32 = 5;
    pub const JUMP: u32 = 6;
    pub const JUMP_IF_TRUE: u32 = 7;
    pub const JUMP_TO_REGISTER: u32 = 8;
    pub const INTERRUPT: u32 = 9;
}

impl WordSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { bytes: Vec::new(), capacity }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn word(&mut self, opcode: u32, a: u32, b: u32, c: u32) {
        self.bytes.extend_from_slice(&opcode.to_le_bytes());
        self.bytes.extend_from_slice(&a.to_le_bytes());
        self.bytes.extend_from_slice(&b.to_le_bytes());
        self.bytes.extend_from_slice(&c.to_le_bytes());
    }

    fn extension(&mut self, bits: u64) {
        self.bytes.extend_from_slice(&bits.to_le_bytes());
        // Pad to the word size so offsets stay word-aligned.
        self.bytes.extend_from_slice(&0u64.to_le_bytes());
    }
}

impl CodeSink for WordSink {
    fn offset(&self) -> usize {
        self.bytes.len()
    }

    fn mov_reg(&mut self, dst: u32, src: u32) {
        self.word(word_op::MOV_REG, dst, src, 0);
    }

    fn mov_imm(&mut self, dst: u32, bits: u64) {
        self.word(word_op::MOV_IMM, dst, 0, 0);
        self.extension(bits);
    }

    fn xor_reg(&mut self, dst: u32, a: u32, b: u32) {
        self.word(word_op::XOR, dst, a, b);
    }

    fn load(&mut self, dst: u32, base: u32, byte_offset: i32) {
        self.word(word_op::LOAD, dst, base, byte_offset as u32);
    }

    fn store(&mut self, src: u32, base: u32, byte_offset: i32) {
        self.word(word_op::STORE, src, base, byte_offset as u32);
    }

    fn jump(&mut self) -> usize {
        let fixup = self.bytes.len();
        self.word(word_op::JUMP, 0, 0, 0);
        fixup
    }

    fn jump_if_true(&mut self, condition: u32) -> usize {
        let fixup = self.bytes.len();
        self.word(word_op::JUMP_IF_TRUE, condition, 0, 0);
        fixup
    }

    fn jump_to_register(&mut self, target: u32) {
        self.word(word_op::JUMP_TO_REGISTER, target, 0, 0);
    }

    fn interrupt(&mut self, status: i32) {
        self.word(word_op::INTERRUPT, status as u32, 0, 0);
    }

    fn patch_jump(&mut self, fixup: usize, target_offset: usize) {
        let displacement = (target_offset as i64 - fixup as i64) as i32;
        let field = fixup + 12;
        self.bytes[field..field + 4].copy_from_slice(&(displacement as u32).to_le_bytes());
    }

    fn overflowed(&self) -> bool {
        self.bytes.len() > self.capacity
    }
}

/// Emitted code ready to run: the page it lives in and its entry address.
pub struct CompiledCode {
    pub page: CodePage,
    pub entry: *const u8,
    pub size: usize,
}

/// Emit `linear` into an executable heap page, growing the page on
/// overflow. The page is write-protected and executable when this
/// returns; no instruction executes out of a writable page.
pub fn emit_function(
    linear: &LinearFrame,
    machine: &MachineDesc,
    heap: &mut Heap,
) -> CodegenResult<CompiledCode> {
    let mut capacity = linear.instructions.len().max(1) * 2 * WORD;
    loop {
        let mut sink = WordSink::with_capacity(capacity);
        match emit(linear, machine, &mut sink) {
            Ok(entry) => {
                let page = heap.allocate_code_page(sink.bytes().len())?;
                let base = heap.code_page_ptr(page);
                heap.protect_code_page(page, false)?;
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        sink.bytes().as_ptr(),
                        base,
                        sink.bytes().len(),
                    );
                }
                heap.protect_code_page(page, true)?;
                return Ok(CompiledCode {
                    page,
                    entry: unsafe { base.add(entry) },
                    size: sink.bytes().len(),
                });
            }
            Err(CodegenError::MachineCodeOverflow { .. }) => {
                log::debug!("code overflowed {} bytes, retrying larger", capacity);
                capacity *= 2;
            }
            Err(error) => return Err(error),
        }
    }
}
