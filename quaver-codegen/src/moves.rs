//! Scheduling of simultaneous location transfers.
//!
//! The resolver records, per instruction, a set of moves that must behave
//! as if they all happened at once. This module orders them so sequential
//! execution gives the same result: ready moves first, a three-XOR swap
//! for a two-register cycle, and spill slot 0 as the temporary that breaks
//! longer cycles. Spill-to-spill copies go through a scratch register,
//! saving one to slot 0 first when none is free.

use rustc_hash::FxHashMap;

use crate::error::{internal_error, CodegenResult};
use crate::lir::Loc;
use crate::regalloc::FIRST_ALLOCATABLE;

/// The spill slot reserved for breaking copy cycles.
pub const CYCLE_SLOT: u32 = 0;

/// A primitive operation the emitter can translate one to one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MoveOp {
    Copy { from: Loc, to: Loc },
    /// Exchange two registers with the XOR trick; no memory traffic.
    Swap { a: u32, b: u32 },
}

/// Order the move set `moves` (origin to destination, destinations
/// unique) into an executable sequence. `free_register` is a register
/// known to hold no live value at this point, if any.
pub fn schedule_moves(
    moves: &FxHashMap<Loc, Loc>,
    free_register: Option<u32>,
) -> CodegenResult<Vec<MoveOp>> {
    let mut forward: FxHashMap<Loc, Loc> = FxHashMap::default();
    let mut incoming: FxHashMap<Loc, Loc> = FxHashMap::default();
    for (&origin, &destination) in moves {
        if origin == destination {
            continue;
        }
        forward.insert(origin, destination);
        if incoming.insert(destination, origin).is_some() {
            return Err(internal_error!("two moves target {}", destination));
        }
    }

    let mut ops = Vec::new();

    // A move is ready once nothing still needs to read its destination.
    loop {
        let ready = incoming
            .keys()
            .find(|destination| !forward.contains_key(destination))
            .copied();
        let Some(destination) = ready else { break };
        let origin = incoming.remove(&destination).expect("destination was present");
        forward.remove(&origin);
        emit_copy(origin, destination, free_register, &mut ops)?;
    }

    // Everything left forms cycles.
    while let Some(&start) = incoming.keys().next() {
        let mut cycle = vec![start];
        let mut cursor = forward[&start];
        while cursor != start {
            cycle.push(cursor);
            cursor = forward[&cursor];
        }
        for location in &cycle {
            forward.remove(location);
            incoming.remove(location);
        }

        if cycle.len() == 2 {
            if let (Loc::Reg(a), Loc::Reg(b)) = (cycle[0], cycle[1]) {
                ops.push(MoveOp::Swap { a: a.min(b), b: a.max(b) });
                continue;
            }
        }

        // Longer cycles rotate through spill slot 0. Spill slots are
        // per-value, so only registers can form a cycle; anything else is
        // a resolver bug.
        if cycle.iter().any(|location| location.is_spill()) {
            return Err(internal_error!("copy cycle through a spill slot"));
        }
        // Start from the lowest register so the sequence is deterministic.
        let pivot = cycle
            .iter()
            .enumerate()
            .min_by_key(|(_, &location)| location)
            .map(|(index, _)| index)
            .expect("cycle is non-empty");
        cycle.rotate_left(pivot);
        let Loc::Reg(saved) = cycle[0] else { unreachable!() };

        ops.push(MoveOp::Copy { from: Loc::Reg(saved), to: Loc::Spill(CYCLE_SLOT) });
        for index in (1..cycle.len()).rev() {
            let to = cycle[(index + 1) % cycle.len()];
            emit_copy(cycle[index], to, free_register, &mut ops)?;
        }
        ops.push(MoveOp::Copy { from: Loc::Spill(CYCLE_SLOT), to: cycle[1] });
    }

    Ok(ops)
}

/// Emit one copy. A spill-to-spill transfer bounces through a scratch
/// register; when the caller had none free, the lowest allocatable
/// register is preserved in slot 0 around the bounce.
fn emit_copy(
    origin: Loc,
    destination: Loc,
    free_register: Option<u32>,
    ops: &mut Vec<MoveOp>,
) -> CodegenResult<()> {
    if origin == destination {
        return Ok(());
    }
    if !(origin.is_spill() && destination.is_spill()) {
        ops.push(MoveOp::Copy { from: origin, to: destination });
        return Ok(());
    }
    if destination == Loc::Spill(CYCLE_SLOT) {
        return Err(internal_error!("spill-to-spill move targets the reserved cycle slot"));
    }
    match free_register {
        Some(scratch) => {
            ops.push(MoveOp::Copy { from: origin, to: Loc::Reg(scratch) });
            ops.push(MoveOp::Copy { from: Loc::Reg(scratch), to: destination });
        }
        None => {
            let victim = FIRST_ALLOCATABLE;
            ops.push(MoveOp::Copy { from: Loc::Reg(victim), to: Loc::Spill(CYCLE_SLOT) });
            ops.push(MoveOp::Copy { from: origin, to: Loc::Reg(victim) });
            ops.push(MoveOp::Copy { from: Loc::Reg(victim), to: destination });
            ops.push(MoveOp::Copy { from: Loc::Spill(CYCLE_SLOT), to: Loc::Reg(victim) });
        }
    }
    Ok(())
}
