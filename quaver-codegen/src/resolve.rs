//! SSA deconstruction and split-interval repair.
//!
//! The RESOLVE algorithm of Wimmer and Franz. After allocation a value may
//! live in different locations at different lines: splits inside a block
//! are reconnected with a move at the split line, and for every
//! control-flow edge the location of each live-in value (and each phi
//! input) at the end of the predecessor is reconciled with its location at
//! the start of the successor. Moves ride on an existing instruction when
//! one side of the edge is unshared, otherwise on a fresh block spliced
//! onto the edge.

use rustc_hash::FxHashSet;

use crate::entity::{EntityRef, PackedOption};
use crate::error::{internal_error, CodegenResult};
use crate::hir::Block;
use crate::lifetime::phi_lines;
use crate::linearize::LinearFrame;
use crate::lir::{Lir, LirOp, Loc, VReg};

/// Insert every move the allocation made necessary.
pub fn resolve(linear: &mut LinearFrame) -> CodegenResult<()> {
    connect_split_intervals(linear)?;
    resolve_edges(linear)?;
    Ok(())
}

/// The location of `value` at `line`. At a split line the interval
/// beginning there wins over the one ending there.
fn location_at(linear: &LinearFrame, value: VReg, line: u32) -> CodegenResult<Loc> {
    linear.lifetimes[value.index()]
        .iter()
        .find(|interval| interval.covers(line))
        .and_then(|interval| interval.location)
        .ok_or_else(|| internal_error!("{} has no location at line {}", value, line))
}

/// A value whose interval was split mid-block changes location at the
/// split line; insert the connecting move there. Transitions at block
/// boundaries belong to edge resolution.
fn connect_split_intervals(linear: &mut LinearFrame) -> CodegenResult<()> {
    let block_starts: FxHashSet<u32> =
        linear.block_order.iter().map(|&block| linear.block_start(block)).collect();

    for value in 0..linear.vreg_count as usize {
        let mut pending: Vec<(u32, Loc, Loc)> = Vec::new();
        for pair in linear.lifetimes[value].windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            if earlier.end() != later.start() || block_starts.contains(&later.start()) {
                continue;
            }
            let (from, to) = match (earlier.location, later.location) {
                (Some(from), Some(to)) if from != to => (from, to),
                _ => continue,
            };
            pending.push((later.start(), from, to));
        }
        for (line, from, to) in pending {
            insert_move(&mut linear.instructions[line as usize], from, to)?;
        }
    }
    Ok(())
}

fn insert_move(instruction: &mut Lir, from: Loc, to: Loc) -> CodegenResult<()> {
    if let Some(&existing) = instruction.moves.get(&from) {
        if existing != to {
            return Err(internal_error!(
                "conflicting moves from {}: to {} and to {}",
                from,
                existing,
                to
            ));
        }
        return Ok(());
    }
    instruction.moves.insert(from, to);
    Ok(())
}

/// Reconcile locations across every control-flow edge.
fn resolve_edges(linear: &mut LinearFrame) -> CodegenResult<()> {
    let blocks = linear.block_order.clone();
    for &block in &blocks {
        let successors = linear.block_successors[block].clone();
        for &successor in &successors {
            let transfers = edge_transfers(linear, block, successor)?;
            if transfers.is_empty() {
                continue;
            }
            place_edge_moves(linear, block, successor, transfers)?;
        }
    }
    Ok(())
}

/// The (from, to) location pairs that must transfer along one edge.
fn edge_transfers(
    linear: &LinearFrame,
    block: Block,
    successor: Block,
) -> CodegenResult<Vec<(Loc, Loc)>> {
    let exit_line = linear.block_end(block) - 1;
    let entry_line = linear.block_start(successor);
    let mut transfers = Vec::new();

    for &value in &linear.block_live_in[successor] {
        let from = location_at(linear, value, exit_line)?;
        let to = location_at(linear, value, entry_line)?;
        if from != to {
            transfers.push((from, to));
        }
    }

    let position = linear.block_predecessors[successor]
        .iter()
        .position(|&predecessor| predecessor == block)
        .ok_or_else(|| internal_error!("{} missing from {}'s predecessors", block, successor))?;
    for line in phi_lines(linear, successor) {
        let instruction = &linear.instructions[line as usize];
        let LirOp::Phi { inputs } = &instruction.op else { unreachable!() };
        let from = location_at(linear, inputs[position], exit_line)?;
        let to = location_at(linear, instruction.value.unwrap(), entry_line)?;
        if from != to {
            transfers.push((from, to));
        }
    }

    Ok(transfers)
}

/// Attach the edge's moves to the successor when it has a single
/// predecessor, to the predecessor's terminator when it has a single
/// successor, and to a block spliced onto the edge otherwise.
fn place_edge_moves(
    linear: &mut LinearFrame,
    block: Block,
    successor: Block,
    transfers: Vec<(Loc, Loc)>,
) -> CodegenResult<()> {
    let line = if linear.block_predecessors[successor].len() == 1 {
        linear.block_start(successor)
    } else if linear.block_successors[block].len() == 1 {
        linear.block_end(block) - 1
    } else {
        split_edge(linear, block, successor)?
    };
    for (from, to) in transfers {
        insert_move(&mut linear.instructions[line as usize], from, to)?;
    }
    Ok(())
}

/// Splice a new block onto a critical edge: a label and an unconditional
/// branch appended past the end of the stream, with the predecessor's
/// branch retargeted at it. Returns the line that carries the moves.
fn split_edge(linear: &mut LinearFrame, block: Block, successor: Block) -> CodegenResult<u32> {
    let highest = linear
        .block_order
        .iter()
        .map(|b| b.index())
        .max()
        .expect("linear frame has no blocks");
    let edge_block = Block::new(highest + 1);
    log::trace!("splitting critical edge {} -> {} with {}", block, successor, edge_block);

    // Retarget the predecessor's branch to the new block.
    let (start, end) = (linear.block_start(block), linear.block_end(block));
    let mut retargeted = false;
    for line in start..end {
        match &mut linear.instructions[line as usize].op {
            LirOp::Branch { target } | LirOp::BranchIfTrue { target, .. }
                if *target == successor =>
            {
                *target = edge_block;
                retargeted = true;
                break;
            }
            _ => {}
        }
    }
    if !retargeted {
        return Err(internal_error!("{} has no branch to retarget toward {}", block, successor));
    }

    let label_line = linear.instructions.len() as u32;
    linear.instructions.push(Lir::new(LirOp::Label { block: edge_block }, PackedOption::none()));
    linear
        .instructions
        .push(Lir::new(LirOp::Branch { target: successor }, PackedOption::none()));

    linear.block_order.push(edge_block);
    linear.block_ranges[edge_block] = (label_line, label_line + 2);
    linear.block_predecessors[edge_block] = vec![block];
    linear.block_successors[edge_block] = vec![successor];
    for target in linear.block_successors[block].iter_mut() {
        if *target == successor {
            *target = edge_block;
        }
    }
    for source in linear.block_predecessors[successor].iter_mut() {
        if *source == block {
            *source = edge_block;
        }
    }

    // The branch instruction carries the edge's moves.
    Ok(label_line + 1)
}
