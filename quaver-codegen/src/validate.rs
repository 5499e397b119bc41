//! Invariant checks run between passes.
//!
//! Each predicate is pure: it inspects one pass's output and either
//! confirms the invariants the next pass relies on or reports an internal
//! error with a diagnostic. A failed check abandons the unit.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::entity::EntityRef;
use crate::error::{internal_error, CodegenResult};
use crate::frame::Frame;
use crate::hir::{Scope, Value};
use crate::linearize::LinearFrame;
use crate::lir::{LirOp, Loc, VReg};

/// Invariants of a freshly built CFG frame.
pub fn validate_frame(frame: &Frame) -> CodegenResult<()> {
    if frame.argument_names.len() != frame.argument_defaults.len() {
        return Err(internal_error!(
            "argument names and defaults disagree: {} names, {} defaults",
            frame.argument_names.len(),
            frame.argument_defaults.len()
        ));
    }
    if frame.blocks.is_empty() {
        return Err(internal_error!("frame has no blocks"));
    }

    let mut seen_values: FxHashSet<Value> = FxHashSet::default();
    let mut seen_blocks: FxHashSet<crate::hir::Block> = FxHashSet::default();
    validate_scope(frame, frame.root_scope, None, &mut seen_blocks, &mut seen_values)?;

    if seen_blocks.len() != frame.blocks.len() {
        return Err(internal_error!(
            "{} blocks reachable through scopes, {} allocated",
            seen_blocks.len(),
            frame.blocks.len()
        ));
    }

    for frame_inner in &frame.inner_frames {
        validate_frame(frame_inner)?;
    }
    Ok(())
}

fn validate_scope(
    frame: &Frame,
    scope: Scope,
    parent: Option<Scope>,
    seen_blocks: &mut FxHashSet<crate::hir::Block>,
    seen_values: &mut FxHashSet<Value>,
) -> CodegenResult<()> {
    let data = &frame.scopes[scope];
    if data.parent.expand() != parent {
        return Err(internal_error!("{} has the wrong parent scope", scope));
    }

    for &block in &data.blocks {
        let block_data = &frame.blocks[block];
        if block_data.scope != scope {
            return Err(internal_error!("{} does not point back to its owning {}", block, scope));
        }
        if !seen_blocks.insert(block) {
            return Err(internal_error!("{} owned by more than one scope", block));
        }
        if !block_data.sealed {
            return Err(internal_error!("{} is not sealed", block));
        }

        for phi in &block_data.phis {
            let crate::hir::HirOp::Phi { inputs } = &phi.op else {
                return Err(internal_error!("non-phi instruction in {}'s phi list", block));
            };
            if inputs.len() != block_data.predecessors.len() {
                return Err(internal_error!(
                    "phi arity {} does not match {} predecessors of {}",
                    inputs.len(),
                    block_data.predecessors.len(),
                    block
                ));
            }
            check_value(frame, phi, block, seen_values)?;
        }

        for (index, hir) in block_data.statements.iter().enumerate() {
            check_value(frame, hir, block, seen_values)?;
            let last = index + 1 == block_data.statements.len();
            if hir.op.is_terminator() && !last {
                return Err(internal_error!("terminator in the middle of {}", block));
            }
        }
    }

    for &sub_scope in &data.sub_scopes {
        validate_scope(frame, sub_scope, Some(scope), seen_blocks, seen_values)?;
    }
    Ok(())
}

fn check_value(
    frame: &Frame,
    hir: &crate::hir::Hir,
    block: crate::hir::Block,
    seen_values: &mut FxHashSet<Value>,
) -> CodegenResult<()> {
    if hir.block != block {
        return Err(internal_error!("instruction in {} claims another owning block", block));
    }
    let Some(value) = hir.id.expand() else {
        return Ok(());
    };
    if !seen_values.insert(value) {
        return Err(internal_error!("duplicate instruction id {}", value));
    }
    if !frame.values.is_valid(value) {
        return Err(internal_error!("{} missing from the value table", value));
    }
    let def = frame.values[value];
    if def.block != block {
        return Err(internal_error!("value table places {} in the wrong block", value));
    }
    let defining = if def.is_phi {
        frame.blocks[def.block].phis.get(def.index as usize)
    } else {
        frame.blocks[def.block].statements.get(def.index as usize)
    };
    match defining {
        Some(defining) if defining.id.expand() == Some(value) => Ok(()),
        _ => Err(internal_error!("value table entry for {} does not own it", value)),
    }
}

/// Invariants of the flattened frame: ranges partition the stream, labels
/// open every block, and the virtual registers are in SSA form.
pub fn validate_linear(frame: &Frame, linear: &LinearFrame) -> CodegenResult<()> {
    if linear.block_order.len() != frame.blocks.len() {
        return Err(internal_error!(
            "linearized {} blocks out of {}",
            linear.block_order.len(),
            frame.blocks.len()
        ));
    }

    let mut cursor = 0u32;
    for &block in &linear.block_order {
        let (start, end) = (linear.block_start(block), linear.block_end(block));
        if start != cursor {
            return Err(internal_error!(
                "{} starts at line {}, expected {}",
                block,
                start,
                cursor
            ));
        }
        if end <= start {
            return Err(internal_error!("{} has an empty range", block));
        }
        match &linear.instructions[start as usize].op {
            LirOp::Label { block: labeled } if *labeled == block => {}
            _ => return Err(internal_error!("{} does not begin with its label", block)),
        }
        cursor = end;
    }
    if cursor as usize != linear.instructions.len() {
        return Err(internal_error!(
            "block ranges cover {} lines of {}",
            cursor,
            linear.instructions.len()
        ));
    }

    // SSA over virtual registers: one definition each, and no plain read
    // before its definition. Phi inputs flow along edges, so they are only
    // required to be defined somewhere.
    let mut defined: FxHashSet<VReg> = FxHashSet::default();
    let mut phi_reads: Vec<VReg> = Vec::new();
    for instruction in &linear.instructions {
        if let LirOp::Phi { inputs } = &instruction.op {
            phi_reads.extend(inputs.iter().copied());
        } else {
            for &read in &instruction.reads {
                if !defined.contains(&read) {
                    return Err(internal_error!("{} read before definition", read));
                }
            }
        }
        if let Some(value) = instruction.value.expand() {
            if !defined.insert(value) {
                return Err(internal_error!("{} defined more than once", value));
            }
        }
    }
    for read in phi_reads {
        if !defined.contains(&read) {
            return Err(internal_error!("phi input {} never defined", read));
        }
    }
    Ok(())
}

/// Invariants of the lifetime analysis: one interval per value covering
/// all of its uses, and the spill-slot count untouched.
pub fn validate_lifetimes(linear: &LinearFrame) -> CodegenResult<()> {
    if linear.spill_slot_count != 1 {
        return Err(internal_error!(
            "{} spill slots before allocation, expected the reserved 1",
            linear.spill_slot_count
        ));
    }
    for (number, lifetimes) in linear.lifetimes.iter().enumerate() {
        if lifetimes.len() != 1 {
            return Err(internal_error!(
                "vr{} has {} intervals before allocation, expected 1",
                number,
                lifetimes.len()
            ));
        }
        if lifetimes[0].value.index() != number {
            return Err(internal_error!("interval value mismatch at vr{}", number));
        }
    }

    let mut usage_counts: Vec<usize> = vec![0; linear.lifetimes.len()];
    for (line, instruction) in linear.instructions.iter().enumerate() {
        let line = line as u32;
        let mut check = |value: VReg, what: &str| -> CodegenResult<()> {
            let interval = &linear.lifetimes[value.index()][0];
            if !interval.covers(line) {
                return Err(internal_error!("{} {} outside its lifetime at line {}", value, what, line));
            }
            if !interval.usages.contains(&line) {
                return Err(internal_error!("{} {} at line {} not marked as a usage", value, what, line));
            }
            usage_counts[value.index()] += 1;
            Ok(())
        };
        if let Some(value) = instruction.value.expand() {
            check(value, "written")?;
        }
        if !matches!(instruction.op, LirOp::Phi { .. }) {
            for &read in &instruction.reads {
                check(read, "read")?;
            }
        }
    }
    for (number, lifetimes) in linear.lifetimes.iter().enumerate() {
        if lifetimes[0].usages.len() != usage_counts[number] {
            return Err(internal_error!(
                "vr{} has {} usages recorded, {} observed",
                number,
                lifetimes[0].usages.len(),
                usage_counts[number]
            ));
        }
    }
    Ok(())
}

/// Invariants of register allocation: at every point of use the value has
/// exactly one register-resident interval, the recorded location matches,
/// and no two live values share a register.
pub fn validate_allocation(linear: &LinearFrame) -> CodegenResult<()> {
    for (number, lifetimes) in linear.lifetimes.iter().enumerate() {
        for interval in lifetimes {
            if interval.value.index() != number {
                return Err(internal_error!("interval value mismatch at vr{}", number));
            }
            if interval.location.is_none() {
                return Err(internal_error!("vr{} has an unassigned interval", number));
            }
        }
    }

    for (line, instruction) in linear.instructions.iter().enumerate() {
        let line = line as u32;
        if let Some(value) = instruction.value.expand() {
            check_register_coverage(linear, line, value)?;
        }
        if !matches!(instruction.op, LirOp::Phi { .. }) {
            for &read in &instruction.reads {
                check_register_coverage(linear, line, read)?;
            }
        }
    }

    // No two simultaneously live values may share a register.
    for line in 0..linear.instructions.len() as u32 {
        let mut holders: FxHashMap<u32, VReg> = FxHashMap::default();
        for lifetimes in &linear.lifetimes {
            for interval in lifetimes {
                let Some(Loc::Reg(register)) = interval.location else { continue };
                if !interval.covers(line) {
                    continue;
                }
                if let Some(&other) = holders.get(&register) {
                    if other != interval.value {
                        return Err(internal_error!(
                            "register r{} held by both {} and {} at line {}",
                            register,
                            other,
                            interval.value,
                            line
                        ));
                    }
                }
                holders.insert(register, interval.value);
            }
        }
    }
    Ok(())
}

fn check_register_coverage(linear: &LinearFrame, line: u32, value: VReg) -> CodegenResult<()> {
    let mut covering = 0;
    let mut register = None;
    for interval in &linear.lifetimes[value.index()] {
        if interval.is_spill() || !interval.covers(line) {
            continue;
        }
        if !interval.usages.contains(&line) {
            return Err(internal_error!("{} live but unused at its use line {}", value, line));
        }
        covering += 1;
        register = interval.location;
    }
    if covering != 1 {
        return Err(internal_error!(
            "{} covered by {} register intervals at line {}, expected 1",
            value,
            covering,
            line
        ));
    }
    match linear.instructions[line as usize].locations.get(&value) {
        Some(recorded) if Some(*recorded) == register => Ok(()),
        Some(recorded) => Err(internal_error!(
            "{} recorded at {} but allocated to {} at line {}",
            value,
            recorded,
            register.expect("covering interval has a location"),
            line
        )),
        None => Err(internal_error!("{} missing from the location map at line {}", value, line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::hir::HirOp;
    use crate::lifetime::build_lifetimes;
    use crate::linearize::linearize;
    use crate::regalloc::{allocate, MachineDesc};
    use quaver_runtime::Slot;

    fn simple_frame() -> Frame {
        let mut frame = Frame::new();
        let entry = frame.entry_block();
        let value = frame.append(entry, HirOp::Constant { value: Slot::from_int32(3) }).unwrap();
        frame.append(entry, HirOp::StoreReturn { value });
        frame.append(entry, HirOp::MethodReturn);
        frame
    }

    #[test]
    fn well_formed_frame_passes_every_stage() {
        let frame = simple_frame();
        validate_frame(&frame).unwrap();

        let mut linear = linearize(&frame).unwrap();
        validate_linear(&frame, &linear).unwrap();

        build_lifetimes(&mut linear);
        validate_lifetimes(&linear).unwrap();

        allocate(&mut linear, &MachineDesc::generic()).unwrap();
        validate_allocation(&linear).unwrap();
    }

    #[test]
    fn mismatched_argument_arrays_fail() {
        let mut frame = simple_frame();
        frame.argument_names.push(quaver_runtime::SymbolTable::new().intern("x"));
        assert!(validate_frame(&frame).is_err());
    }

    #[test]
    fn unsealed_blocks_fail() {
        let mut frame = simple_frame();
        let block = frame.make_block(frame.root_scope);
        let _ = block;
        assert!(validate_frame(&frame).is_err());
    }

    #[test]
    fn phi_arity_mismatch_fails() {
        let mut frame = simple_frame();
        let entry = frame.entry_block();
        let value = frame.blocks[entry].statements[0].id.unwrap();
        let merge = frame.make_block(frame.root_scope);
        frame.seal_block(merge);
        // One input, but no predecessors at all.
        frame.append_phi(merge, smallvec::smallvec![value]);
        assert!(validate_frame(&frame).is_err());
    }

    #[test]
    fn double_definition_fails_linear_validation() {
        let frame = simple_frame();
        let mut linear = linearize(&frame).unwrap();
        let duplicate = linear.instructions[1].clone();
        let end = linear.block_end(frame.entry_block());
        linear.instructions.insert(1, duplicate);
        linear.block_ranges[frame.entry_block()] = (0, end + 1);
        assert!(validate_linear(&frame, &linear).is_err());
    }

    #[test]
    fn spill_slot_growth_fails_lifetime_validation() {
        let frame = simple_frame();
        let mut linear = linearize(&frame).unwrap();
        build_lifetimes(&mut linear);
        linear.spill_slot_count = 2;
        assert!(validate_lifetimes(&linear).is_err());
    }
}
