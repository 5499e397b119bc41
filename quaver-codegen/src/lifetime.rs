//! Value lifetimes over the linear instruction stream.
//!
//! A `LifetimeInterval` records where one (value, location) pair is live as
//! a sorted set of half-open line ranges, plus the lines where the value is
//! actually read or written. The analysis pass is the BUILDINTERVALS
//! algorithm of Wimmer and Franz, "Linear Scan Register Allocation on SSA
//! Form": one reverse walk over the blocks, seeding each block with its
//! successors' live-in sets and the phi inputs flowing to them.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use crate::entity::EntityRef;
use crate::hir::Block;
use crate::linearize::LinearFrame;
use crate::lir::{LirOp, Loc, VReg};

/// A half-open range [from, to) of linear line numbers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LiveRange {
    pub from: u32,
    pub to: u32,
}

/// Where one value lives, at one location.
///
/// The ranges are sorted, non-overlapping, and maximally merged: adjacent
/// or overlapping insertions collapse into a single range. Every usage
/// point lies inside exactly one range.
#[derive(Clone, Debug)]
pub struct LifetimeInterval {
    pub value: VReg,
    pub ranges: Vec<LiveRange>,
    pub usages: BTreeSet<u32>,
    /// Physical location, assigned during register allocation.
    pub location: Option<Loc>,
}

impl LifetimeInterval {
    pub fn new(value: VReg) -> Self {
        Self { value, ranges: Vec::new(), usages: BTreeSet::new(), location: None }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_spill(&self) -> bool {
        matches!(self.location, Some(Loc::Spill(_)))
    }

    pub fn start(&self) -> u32 {
        self.ranges.first().expect("empty interval has no start").from
    }

    pub fn end(&self) -> u32 {
        self.ranges.last().expect("empty interval has no end").to
    }

    /// Add [from, to), merging with any ranges it overlaps or abuts.
    pub fn add_range(&mut self, from: u32, to: u32) {
        debug_assert!(to >= from, "inverted range [{}, {})", from, to);
        let first = self.ranges.partition_point(|range| range.to < from);
        let last = self.ranges.partition_point(|range| range.from <= to);
        if first == last {
            self.ranges.insert(first, LiveRange { from, to });
            return;
        }
        let merged = LiveRange {
            from: from.min(self.ranges[first].from),
            to: to.max(self.ranges[last - 1].to),
        };
        self.ranges[first] = merged;
        self.ranges.drain(first + 1..last);
    }

    /// Shorten the first range to begin at `from`: the value is defined
    /// here, not at the block top. A dead definition with no recorded
    /// range becomes the minimal [from, from + 1).
    pub fn set_from(&mut self, from: u32) {
        match self.ranges.first_mut() {
            Some(range) => {
                debug_assert!(from <= range.to);
                range.from = from;
            }
            None => self.ranges.push(LiveRange { from, to: from + 1 }),
        }
    }

    pub fn add_usage(&mut self, line: u32) {
        self.usages.insert(line);
    }

    /// Is `line` inside one of the ranges?
    pub fn covers(&self, line: u32) -> bool {
        let index = self.ranges.partition_point(|range| range.to <= line);
        index < self.ranges.len() && self.ranges[index].from <= line
    }

    pub fn first_usage(&self) -> Option<u32> {
        self.usages.iter().next().copied()
    }

    pub fn next_usage_after(&self, line: u32) -> Option<u32> {
        self.usages.range(line..).next().copied()
    }

    /// First line at or after `from` covered by this interval.
    pub fn next_covered_after(&self, from: u32) -> Option<u32> {
        let index = self.ranges.partition_point(|range| range.to <= from);
        let range = self.ranges.get(index)?;
        Some(range.from.max(from))
    }

    /// First line where both intervals are live, at or after `from`.
    pub fn first_intersection_after(&self, other: &Self, from: u32) -> Option<u32> {
        let mut cursor = from;
        loop {
            let a = self.next_covered_after(cursor)?;
            let b = other.next_covered_after(cursor)?;
            if a == b {
                return Some(a);
            }
            cursor = a.max(b);
        }
    }

    /// Split at `position`, keeping [start, position) here and returning
    /// the tail. Usages move with their ranges.
    pub fn split_at(&mut self, position: u32) -> LifetimeInterval {
        debug_assert!(self.start() < position && position < self.end());
        let mut tail = LifetimeInterval::new(self.value);

        let index = self.ranges.partition_point(|range| range.to <= position);
        tail.ranges = self.ranges.split_off(index);
        if let Some(first) = tail.ranges.first_mut() {
            if first.from < position {
                self.ranges.push(LiveRange { from: first.from, to: position });
                first.from = position;
            }
        }
        tail.usages = self.usages.split_off(&position);
        tail
    }
}

/// Compute one lifetime interval per virtual register and each block's
/// live-in set.
pub fn build_lifetimes(linear: &mut LinearFrame) {
    let mut intervals: Vec<LifetimeInterval> = (0..linear.vreg_count)
        .map(|number| LifetimeInterval::new(VReg::new(number as usize)))
        .collect();

    for &block in linear.block_order.clone().iter().rev() {
        let (block_start, block_end) = (linear.block_start(block), linear.block_end(block));

        // Everything live into a successor is live out of this block, as
        // is every successor-phi input contributed by this block.
        let mut live: FxHashSet<VReg> = FxHashSet::default();
        for &successor in &linear.block_successors[block] {
            live.extend(linear.block_live_in[successor].iter().copied());
            let position = linear.block_predecessors[successor]
                .iter()
                .position(|&p| p == block)
                .expect("successor does not list this block as a predecessor");
            for line in phi_lines(linear, successor) {
                if let LirOp::Phi { inputs } = &linear.instructions[line as usize].op {
                    live.insert(inputs[position]);
                }
            }
        }

        for &value in &live {
            intervals[value.index()].add_range(block_start, block_end);
        }

        // Reverse walk: outputs shorten their interval to the definition;
        // inputs extend back to the block top. Phi operands are handled at
        // the predecessors, so phis only record their definition here.
        for line in (block_start..block_end).rev() {
            let instruction = &linear.instructions[line as usize];
            if let LirOp::Phi { .. } = instruction.op {
                let dest = instruction.value.unwrap();
                intervals[dest.index()].add_range(line, line + 1);
                intervals[dest.index()].add_usage(line);
                continue;
            }
            if let Some(dest) = instruction.value.expand() {
                intervals[dest.index()].set_from(line);
                intervals[dest.index()].add_usage(line);
                live.remove(&dest);
            }
            for &read in &instruction.reads {
                intervals[read.index()].add_range(block_start, line + 1);
                intervals[read.index()].add_usage(line);
                live.insert(read);
            }
        }

        // Phi outputs are defined at the block top, not live into it.
        for line in phi_lines(linear, block) {
            let dest = linear.instructions[line as usize].value.unwrap();
            live.remove(&dest);
        }

        // Values live into a loop header stay live across the whole loop.
        if let Some(&loop_end) = linear.loop_ends.get(&block) {
            for &value in &live {
                intervals[value.index()].add_range(block_start, loop_end);
            }
        }

        linear.block_live_in[block] = live;
    }

    linear.lifetimes = intervals.into_iter().map(|interval| vec![interval]).collect();
    log::trace!("built {} lifetimes", linear.lifetimes.len());
}

/// Lines of the phi instructions of `block`: everything between its label
/// and its first non-phi instruction.
pub fn phi_lines(linear: &LinearFrame, block: Block) -> impl Iterator<Item = u32> + '_ {
    let (start, end) = (linear.block_start(block), linear.block_end(block));
    (start + 1..end).take_while(move |&line| {
        matches!(linear.instructions[line as usize].op, LirOp::Phi { .. })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn ranges(interval: &LifetimeInterval) -> Vec<(u32, u32)> {
        interval.ranges.iter().map(|r| (r.from, r.to)).collect()
    }

    #[test]
    fn disjoint_ranges_stay_sorted() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(4, 5);
        interval.add_range(0, 1);
        interval.add_range(8, 10);
        interval.add_range(2, 3);
        interval.add_range(6, 7);
        assert_eq!(ranges(&interval), vec![(0, 1), (2, 3), (4, 5), (6, 7), (8, 10)]);
    }

    #[test]
    fn full_overlap_collapses_to_one_range() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        for (from, to) in [(4, 5), (0, 1), (8, 10), (2, 3), (6, 7)] {
            interval.add_range(from, to);
        }
        interval.add_range(1, 100);
        assert_eq!(ranges(&interval), vec![(0, 100)]);
    }

    #[test]
    fn adjacent_ranges_merge() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(0, 3);
        interval.add_range(3, 6);
        assert_eq!(ranges(&interval), vec![(0, 6)]);
        interval.add_range(10, 12);
        interval.add_range(6, 10);
        assert_eq!(ranges(&interval), vec![(0, 12)]);
    }

    #[test]
    fn contained_ranges_change_nothing() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(1, 100);
        interval.add_range(1, 2);
        interval.add_range(99, 100);
        interval.add_range(49, 51);
        assert_eq!(ranges(&interval), vec![(1, 100)]);
    }

    #[test]
    fn covers_is_half_open() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(2, 5);
        assert!(!interval.covers(1));
        assert!(interval.covers(2));
        assert!(interval.covers(4));
        assert!(!interval.covers(5));
    }

    #[test]
    fn set_from_shortens_only_the_first_range() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(0, 4);
        interval.add_range(8, 12);
        interval.set_from(2);
        assert_eq!(ranges(&interval), vec![(2, 4), (8, 12)]);
    }

    #[test]
    fn set_from_on_empty_makes_minimal_range() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.set_from(7);
        assert_eq!(ranges(&interval), vec![(7, 8)]);
    }

    #[test]
    fn split_moves_tail_ranges_and_usages() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(0, 10);
        interval.add_range(14, 20);
        interval.add_usage(1);
        interval.add_usage(6);
        interval.add_usage(15);

        let tail = interval.split_at(4);
        assert_eq!(ranges(&interval), vec![(0, 4)]);
        assert_eq!(ranges(&tail), vec![(4, 10), (14, 20)]);
        assert_eq!(interval.usages.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(tail.usages.iter().copied().collect::<Vec<_>>(), vec![6, 15]);
    }

    #[test]
    fn split_between_ranges() {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        interval.add_range(0, 4);
        interval.add_range(10, 14);
        let tail = interval.split_at(6);
        assert_eq!(ranges(&interval), vec![(0, 4)]);
        assert_eq!(ranges(&tail), vec![(10, 14)]);
    }

    #[test]
    fn intersection_finds_first_common_line() {
        let mut a = LifetimeInterval::new(VReg::new(0));
        a.add_range(0, 4);
        a.add_range(10, 20);
        let mut b = LifetimeInterval::new(VReg::new(1));
        b.add_range(4, 12);
        assert_eq!(a.first_intersection_after(&b, 0), Some(10));
        assert_eq!(a.first_intersection_after(&b, 11), Some(11));
        assert_eq!(a.first_intersection_after(&b, 12), None);
    }

    #[quickcheck]
    fn add_range_is_sorted_merged_and_covering(pairs: Vec<(u8, u8)>) -> bool {
        let mut interval = LifetimeInterval::new(VReg::new(0));
        let mut expected = std::collections::BTreeSet::new();
        for (a, b) in pairs {
            let (from, to) = (a.min(b) as u32, a.max(b) as u32);
            interval.add_range(from, to);
            expected.extend(from..to);
        }

        // Sorted, non-overlapping, maximally merged: each range strictly
        // after the previous with a gap of at least one line.
        let well_formed = interval
            .ranges
            .windows(2)
            .all(|pair| pair[0].to < pair[1].from);
        let non_empty_or_point = interval.ranges.iter().all(|range| range.from <= range.to);

        // Covered set equals the union of all inserted ranges.
        let limit = 260;
        let coverage_matches =
            (0..limit).all(|line| interval.covers(line) == expected.contains(&line));

        well_formed && non_empty_or_point && coverage_matches
    }
}
