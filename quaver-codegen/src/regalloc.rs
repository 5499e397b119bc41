//! Linear-scan register allocation.
//!
//! The LINEARSCAN algorithm of Wimmer and Franz, run directly on the SSA
//! lifetimes: intervals are processed in order of start position against an
//! `active`/`inactive`/`handled` partition. An interval that cannot get a
//! register is split, with the portion between the split and its next use
//! parked in a spill slot; the resolver later materializes the moves each
//! transition implies. Instructions that preserve no registers (message
//! dispatch) force every value live across them into its spill slot.

use rustc_hash::FxHashMap;

use crate::entity::EntityRef;
use crate::error::{internal_error, CodegenResult};
use crate::lifetime::LifetimeInterval;
use crate::linearize::LinearFrame;
use crate::lir::{Loc, VReg};

/// Register 0 permanently holds the thread-context pointer.
pub const CONTEXT_REGISTER: u32 = 0;
/// Register 1 permanently holds the managed stack pointer.
pub const STACK_POINTER_REGISTER: u32 = 1;
/// Registers below this are reserved and never allocated.
pub const FIRST_ALLOCATABLE: u32 = 2;

/// What the allocator needs to know about the target.
#[derive(Clone, Debug)]
pub struct MachineDesc {
    pub register_count: u32,
    /// Bitmask of caller-save registers.
    pub caller_save: u64,
}

impl MachineDesc {
    /// A 16-register machine with the lower allocatable half caller-save,
    /// matching the generic emitter targets.
    pub fn generic() -> Self {
        Self { register_count: 16, caller_save: 0x03fc }
    }

    pub fn is_caller_save(&self, register: u32) -> bool {
        (self.caller_save >> register) & 1 == 1
    }
}

/// Assign every lifetime interval a physical register or spill slot.
pub fn allocate(linear: &mut LinearFrame, machine: &MachineDesc) -> CodegenResult<()> {
    if machine.register_count <= FIRST_ALLOCATABLE {
        return Err(internal_error!("machine has no allocatable registers"));
    }

    let clobbers: Vec<u32> = linear
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, lir)| lir.op.preserves_no_registers())
        .map(|(line, _)| line as u32)
        .collect();

    let mut state = Allocator {
        machine,
        unhandled: Vec::new(),
        active: Vec::new(),
        inactive: Vec::new(),
        handled: Vec::new(),
        spill_slots: FxHashMap::default(),
        next_spill_slot: linear.spill_slot_count,
        clobbers,
    };

    for lifetimes in std::mem::take(&mut linear.lifetimes) {
        for interval in lifetimes {
            if !interval.is_empty() {
                state.push_unhandled(interval);
            }
        }
    }

    state.run()?;

    linear.spill_slot_count = state.next_spill_slot;
    let mut lifetimes: Vec<Vec<LifetimeInterval>> =
        (0..linear.vreg_count).map(|_| Vec::new()).collect();
    for interval in state.handled {
        lifetimes[interval.value.index()].push(interval);
    }
    for intervals in &mut lifetimes {
        intervals.sort_by_key(|interval| interval.start());
    }
    linear.lifetimes = lifetimes;

    record_locations(linear)?;
    log::trace!(
        "allocation finished: {} spill slots",
        linear.spill_slot_count
    );
    Ok(())
}

struct Allocator<'a> {
    machine: &'a MachineDesc,
    /// Sorted by descending start so the next interval pops off the end.
    unhandled: Vec<LifetimeInterval>,
    active: Vec<LifetimeInterval>,
    inactive: Vec<LifetimeInterval>,
    handled: Vec<LifetimeInterval>,
    spill_slots: FxHashMap<VReg, u32>,
    next_spill_slot: u32,
    /// Lines that preserve no registers, sorted.
    clobbers: Vec<u32>,
}

impl<'a> Allocator<'a> {
    fn push_unhandled(&mut self, interval: LifetimeInterval) {
        let start = interval.start();
        let index = self
            .unhandled
            .partition_point(|other| other.start() > start);
        self.unhandled.insert(index, interval);
    }

    /// Spill slots are per-value: every spilled portion of one value
    /// shares a slot. Slot 0 stays reserved for move cycles.
    fn spill_slot_for(&mut self, value: VReg) -> u32 {
        if let Some(&slot) = self.spill_slots.get(&value) {
            return slot;
        }
        let slot = self.next_spill_slot;
        self.next_spill_slot += 1;
        self.spill_slots.insert(value, slot);
        slot
    }

    fn run(&mut self) -> CodegenResult<()> {
        while let Some(mut current) = self.unhandled.pop() {
            let position = current.start();
            self.advance(position);
            self.split_for_clobbers(&mut current);

            if self.try_allocate_free_reg(&mut current) {
                self.active.push(current);
                continue;
            }
            if self.allocate_blocked_reg(&mut current, position)? {
                self.active.push(current);
            } else {
                self.handled.push(current);
            }
        }

        self.handled.append(&mut self.active);
        self.handled.append(&mut self.inactive);
        Ok(())
    }

    /// Retire and repartition intervals against the new cursor position.
    fn advance(&mut self, position: u32) {
        let mut index = 0;
        while index < self.active.len() {
            if self.active[index].end() <= position {
                self.handled.push(self.active.swap_remove(index));
            } else if !self.active[index].covers(position) {
                self.inactive.push(self.active.swap_remove(index));
            } else {
                index += 1;
            }
        }
        index = 0;
        while index < self.inactive.len() {
            if self.inactive[index].end() <= position {
                self.handled.push(self.inactive.swap_remove(index));
            } else if self.inactive[index].covers(position) {
                self.active.push(self.inactive.swap_remove(index));
            } else {
                index += 1;
            }
        }
    }

    /// Detach everything at or past the first register-clobbering line
    /// inside `current`: the head keeps its register chance, the value
    /// waits in its spill slot across the clobber, and the remainder from
    /// its next use re-enters the queue.
    fn split_for_clobbers(&mut self, current: &mut LifetimeInterval) {
        let start = current.start();
        let clobber = match self
            .clobbers
            .iter()
            .copied()
            .find(|&line| line > start && line < current.end())
        {
            Some(line) => line,
            None => return,
        };

        let tail = current.split_at(clobber);
        self.park_in_spill(tail);
    }

    /// Park `tail` in its value's spill slot until its next use, and
    /// requeue the remainder (which wants a register again) from that use.
    fn park_in_spill(&mut self, mut tail: LifetimeInterval) {
        let slot = self.spill_slot_for(tail.value);
        match tail.first_usage() {
            None => {
                tail.location = Some(Loc::Spill(slot));
                self.handled.push(tail);
            }
            Some(use_line) if use_line > tail.start() => {
                let reg_part = tail.split_at(use_line);
                tail.location = Some(Loc::Spill(slot));
                self.handled.push(tail);
                self.push_unhandled(reg_part);
            }
            Some(_) => {
                // Used immediately at its start; no spill gap to park in.
                self.push_unhandled(tail);
            }
        }
    }

    /// Try to place `current` in a register that is free for its whole
    /// extent, or at least until a split point.
    fn try_allocate_free_reg(&mut self, current: &mut LifetimeInterval) -> bool {
        let count = self.machine.register_count as usize;
        let mut free_until = vec![u32::MAX; count];
        for register in 0..FIRST_ALLOCATABLE {
            free_until[register as usize] = 0;
        }
        for interval in &self.active {
            free_until[register_of(interval)] = 0;
        }
        for interval in &self.inactive {
            if let Some(intersection) =
                interval.first_intersection_after(current, current.start())
            {
                let register = register_of(interval);
                free_until[register] = free_until[register].min(intersection);
            }
        }

        let Some(best) = self.pick_register(&free_until) else {
            return false;
        };
        if free_until[best as usize] <= current.start() {
            return false;
        }

        if current.end() > free_until[best as usize] {
            // Free only for a prefix: take it and requeue the rest.
            let tail = current.split_at(free_until[best as usize]);
            self.push_unhandled(tail);
        }
        current.location = Some(Loc::Reg(best));
        true
    }

    /// All registers are occupied at `position`. Evict the one whose next
    /// use is farthest away, or spill `current` itself if its own first
    /// use is farther still. Returns whether `current` got a register.
    fn allocate_blocked_reg(
        &mut self,
        current: &mut LifetimeInterval,
        position: u32,
    ) -> CodegenResult<bool> {
        let count = self.machine.register_count as usize;
        let mut next_use = vec![u32::MAX; count];
        for register in 0..FIRST_ALLOCATABLE {
            next_use[register as usize] = 0;
        }
        for interval in self.active.iter() {
            let register = register_of(interval);
            let use_line = interval.next_usage_after(position).unwrap_or(interval.end());
            next_use[register] = next_use[register].min(use_line);
        }
        for interval in self.inactive.iter() {
            if interval.first_intersection_after(current, position).is_some() {
                let register = register_of(interval);
                let use_line = interval.next_usage_after(position).unwrap_or(interval.end());
                next_use[register] = next_use[register].min(use_line);
            }
        }

        let best = self
            .pick_register(&next_use)
            .ok_or_else(|| internal_error!("no allocatable registers"))?;
        let current_first_use = current.first_usage().unwrap_or(position);

        if current_first_use >= next_use[best as usize] {
            // Everyone else is needed sooner: current itself waits in its
            // spill slot until it is actually used.
            if current_first_use <= position {
                return Err(internal_error!(
                    "register pressure unsatisfiable at line {}: more operands live than registers",
                    position
                ));
            }
            let slot = self.spill_slot_for(current.value);
            if current_first_use < current.end() {
                let reg_part = current.split_at(current_first_use);
                self.push_unhandled(reg_part);
            }
            current.location = Some(Loc::Spill(slot));
            return Ok(false);
        }

        // Evict every interval holding `best` from `position` on.
        let mut evicted: Vec<LifetimeInterval> = Vec::new();
        let mut index = 0;
        while index < self.active.len() {
            if register_of(&self.active[index]) == best as usize {
                evicted.push(self.active.swap_remove(index));
            } else {
                index += 1;
            }
        }
        index = 0;
        while index < self.inactive.len() {
            if register_of(&self.inactive[index]) == best as usize
                && self.inactive[index]
                    .first_intersection_after(current, position)
                    .is_some()
            {
                evicted.push(self.inactive.swap_remove(index));
            } else {
                index += 1;
            }
        }

        for mut blocker in evicted {
            if blocker.start() >= position {
                self.park_in_spill(blocker);
            } else {
                let split = blocker
                    .next_covered_after(position)
                    .filter(|&line| line > blocker.start() && line < blocker.end());
                match split {
                    Some(line) => {
                        let tail = blocker.split_at(line);
                        self.handled.push(blocker);
                        self.park_in_spill(tail);
                    }
                    None => self.handled.push(blocker),
                }
            }
        }

        current.location = Some(Loc::Reg(best));
        Ok(true)
    }

    /// Highest-scoring allocatable register; caller-save wins ties, then
    /// the lower number.
    fn pick_register(&self, scores: &[u32]) -> Option<u32> {
        let mut best: Option<u32> = None;
        for register in FIRST_ALLOCATABLE..self.machine.register_count {
            let better = match best {
                None => true,
                Some(current_best) => {
                    let (a, b) = (scores[register as usize], scores[current_best as usize]);
                    a > b
                        || (a == b
                            && self.machine.is_caller_save(register)
                            && !self.machine.is_caller_save(current_best))
                }
            };
            if better {
                best = Some(register);
            }
        }
        best
    }
}

fn register_of(interval: &LifetimeInterval) -> usize {
    match interval.location {
        Some(Loc::Reg(register)) => register as usize,
        _ => unreachable!("active or inactive interval without a register"),
    }
}

/// Record, at every line, the physical location of each operand the
/// instruction reads or writes.
fn record_locations(linear: &mut LinearFrame) -> CodegenResult<()> {
    for line in 0..linear.instructions.len() as u32 {
        let mut operands: Vec<VReg> = Vec::new();
        {
            let instruction = &linear.instructions[line as usize];
            operands.extend(instruction.value.expand());
            // Phi inputs live in the predecessors, not at the phi line; the
            // resolver gives them edge moves instead of locations here.
            if !matches!(instruction.op, crate::lir::LirOp::Phi { .. }) {
                operands.extend(instruction.reads.iter().copied());
            }
        }
        for operand in operands {
            let location = linear.lifetimes[operand.index()]
                .iter()
                .find(|interval| !interval.is_spill() && interval.covers(line))
                .and_then(|interval| interval.location)
                .ok_or_else(|| {
                    internal_error!("{} has no register at line {}", operand, line)
                })?;
            linear.instructions[line as usize].locations.insert(operand, location);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PackedOption;
    use crate::hir::Block;
    use crate::lifetime::build_lifetimes;
    use crate::lir::{Lir, LirOp};
    use quaver_runtime::Slot;

    /// A single-block linear frame from a raw instruction list.
    fn single_block(instructions: Vec<Lir>) -> LinearFrame {
        let block = Block::new(0);
        let mut linear = LinearFrame {
            instructions: vec![Lir::new(LirOp::Label { block }, PackedOption::none())],
            block_order: vec![block],
            block_ranges: crate::entity::SecondaryMap::new(),
            loop_ends: Default::default(),
            hir_to_vreg: crate::entity::SecondaryMap::new(),
            vreg_count: 0,
            lifetimes: Vec::new(),
            block_live_in: crate::entity::SecondaryMap::new(),
            block_predecessors: crate::entity::SecondaryMap::new(),
            block_successors: crate::entity::SecondaryMap::new(),
            spill_slot_count: 1,
        };
        for lir in instructions {
            if let Some(value) = lir.value.expand() {
                linear.vreg_count = linear.vreg_count.max(value.index() as u32 + 1);
            }
            for &read in &lir.reads {
                linear.vreg_count = linear.vreg_count.max(read.index() as u32 + 1);
            }
            linear.instructions.push(lir);
        }
        linear.block_ranges[block] = (0, linear.instructions.len() as u32);
        linear
    }

    fn load(dest: u32) -> Lir {
        Lir::new(
            LirOp::LoadConstant { value: Slot::from_int32(dest as i32) },
            VReg::new(dest as usize).into(),
        )
    }

    fn store(src: u32, offset: i32) -> Lir {
        Lir::new(
            LirOp::StoreToStack { byte_offset: offset, src: VReg::new(src as usize) },
            PackedOption::none(),
        )
    }

    #[test]
    fn straight_line_code_gets_registers() {
        let mut linear = single_block(vec![
            load(0),
            load(1),
            store(0, 0),
            store(1, 8),
        ]);
        build_lifetimes(&mut linear);
        allocate(&mut linear, &MachineDesc::generic()).unwrap();

        // Both values sit in allocatable registers over their whole lives.
        for lifetimes in &linear.lifetimes {
            for interval in lifetimes {
                match interval.location.unwrap() {
                    Loc::Reg(register) => assert!(register >= FIRST_ALLOCATABLE),
                    Loc::Spill(_) => panic!("no spill expected"),
                }
            }
        }
        crate::validate::validate_allocation(&linear).unwrap();
    }

    #[test]
    fn overlapping_values_get_distinct_registers() {
        let mut linear = single_block(vec![
            load(0),
            load(1),
            load(2),
            store(2, 0),
            store(1, 8),
            store(0, 16),
        ]);
        build_lifetimes(&mut linear);
        allocate(&mut linear, &MachineDesc::generic()).unwrap();
        crate::validate::validate_allocation(&linear).unwrap();

        let reg = |v: usize| linear.lifetimes[v][0].location.unwrap();
        assert_ne!(reg(0), reg(1));
        assert_ne!(reg(1), reg(2));
        assert_ne!(reg(0), reg(2));
    }

    #[test]
    fn pressure_forces_spills_but_coverage_holds() {
        // Two allocatable registers, three simultaneously-live values.
        let machine = MachineDesc { register_count: 4, caller_save: 0x0c };
        let mut linear = single_block(vec![
            load(0),
            load(1),
            load(2),
            store(0, 0),
            store(1, 8),
            store(2, 16),
            store(0, 24),
        ]);
        build_lifetimes(&mut linear);
        allocate(&mut linear, &machine).unwrap();
        crate::validate::validate_allocation(&linear).unwrap();

        assert!(linear.spill_slot_count > 1, "pressure should have spilled");
    }

    #[test]
    fn values_live_across_dispatch_are_spilled() {
        let mut linear = single_block(vec![
            load(0),
            load(1),
            store(0, 0),
            Lir::new(LirOp::Interrupt { status: 1 }, PackedOption::none()),
            store(0, 8),
            store(1, 16),
        ]);
        build_lifetimes(&mut linear);
        allocate(&mut linear, &MachineDesc::generic()).unwrap();
        crate::validate::validate_allocation(&linear).unwrap();

        // No register-resident interval may cover the dispatch line.
        let interrupt_line = 4;
        for lifetimes in &linear.lifetimes {
            for interval in lifetimes {
                if interval.covers(interrupt_line) {
                    assert!(interval.is_spill(), "{:?} in a register across dispatch", interval);
                }
            }
        }
    }

    #[test]
    fn reserved_registers_are_never_allocated() {
        let mut instructions = Vec::new();
        for value in 0..20 {
            instructions.push(load(value));
        }
        for value in 0..20 {
            instructions.push(store(value, value as i32 * 8));
        }
        let mut linear = single_block(instructions);
        build_lifetimes(&mut linear);
        allocate(&mut linear, &MachineDesc::generic()).unwrap();
        crate::validate::validate_allocation(&linear).unwrap();

        for lifetimes in &linear.lifetimes {
            for interval in lifetimes {
                if let Some(Loc::Reg(register)) = interval.location {
                    assert!(register >= FIRST_ALLOCATABLE);
                }
            }
        }
    }
}
