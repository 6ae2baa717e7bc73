//! Ghost-zone dissolution: turning overlapping declared partitions into a
//! disjoint write layout.
//!
//! Conflicting pairs are resolved largest intersection first. For the
//! selected pair a boundary shift is tried independently along i, then j,
//! then k; each viable shift moves the shared boundary to the floor midpoint
//! and hands the cells above it to the other partition. Among the viable
//! shifts the one maximizing the combined span volume of the two results is
//! committed. A pair admitting no shift at all (one box contained in the
//! other on every axis) fails the whole resolution.
//!
//! Two volume formulas are in play and they intentionally disagree:
//! conflicts are ranked by the inclusive cell count of the intersection
//! ([`Partition::ghost_volume`]), while candidate shifts are scored by the
//! bare span product ([`Partition::span_volume`]). The scoring side treats a
//! box one cell thick as worthless, so a shift that leaves only flat boxes
//! scores zero and is never accepted. Both formulas are pinned by tests.

use alloc::collections::BinaryHeap;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::error::LayoutError;
use crate::partition::{Axis, Partition};

// ---------------------------------------------------------------------------
// Pending-conflict heap
// ---------------------------------------------------------------------------

/// One overlapping pair awaiting dissolution.
///
/// `stamp` snapshots the modification counters of both partitions at push
/// time; an entry whose stamp no longer matches is stale and skipped on pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Conflict {
    volume: i64,
    pair: (usize, usize),
    stamp: (u64, u64),
}

impl Ord for Conflict {
    fn cmp(&self, other: &Self) -> Ordering {
        // Largest intersection first; ties go to the lowest index pair.
        self.volume
            .cmp(&other.volume)
            .then_with(|| other.pair.cmp(&self.pair))
            .then_with(|| other.stamp.cmp(&self.stamp))
    }
}

impl PartialOrd for Conflict {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Per-axis shift trials
// ---------------------------------------------------------------------------

/// Try to separate `p` and `q` along one axis.
///
/// The partition starting lower keeps the cells up to the floor midpoint of
/// `(low.end, high.start)`; the other starts one past it. Returns `None`
/// when neither box extends past the other on this axis, in which case the
/// axis offers no move. Inputs are not mutated.
fn split_along(p: &Partition, q: &Partition, axis: Axis) -> Option<(Partition, Partition)> {
    let (ps, pe) = (p.start(axis), p.end(axis));
    let (qs, qe) = (q.start(axis), q.end(axis));
    let mut p2 = *p;
    let mut q2 = *q;
    if ps <= qs && qe > pe {
        let cut = (pe + qs).div_euclid(2);
        p2.set_end(axis, cut);
        q2.set_start(axis, cut + 1);
    } else if qs <= ps && pe > qe {
        let cut = (qe + ps).div_euclid(2);
        q2.set_end(axis, cut);
        p2.set_start(axis, cut + 1);
    } else {
        return None;
    }
    Some((p2, q2))
}

/// Try all three axes in order and keep the candidate with the largest
/// combined span volume. The comparison is strict against an initial best
/// of zero, so the i axis wins exact ties and a candidate scoring zero is
/// treated as no candidate at all.
fn best_split(p: &Partition, q: &Partition) -> Option<(Partition, Partition)> {
    let mut best = None;
    let mut best_score = 0i64;
    for axis in Axis::ALL {
        if let Some((cp, cq)) = split_along(p, q, axis) {
            let score = cp.span_volume() + cq.span_volume();
            if score > best_score {
                best_score = score;
                best = Some((cp, cq));
            }
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Resolve a declared layout into a disjoint write layout.
///
/// Input partitions are normalized first. On success no two entries of the
/// result overlap (the predicate of [`Partition::overlaps`], under which
/// exact boundary contact still counts). Partitions only ever shrink, so a
/// layout that is already disjoint comes back unchanged.
///
/// Fails with [`LayoutError::UnresolvableOverlap`] when some conflicting
/// pair admits no boundary shift, which happens when one partition is
/// contained in the other on every axis or when every viable shift would
/// leave only flat boxes.
pub fn dissolve_ghost_zones(declared: &[Partition]) -> Result<Vec<Partition>, LayoutError> {
    let mut write: Vec<Partition> = declared.iter().map(Partition::normalized).collect();
    let mut stamps = vec![0u64; write.len()];
    let mut pending = BinaryHeap::new();

    for p in 0..write.len() {
        for q in p + 1..write.len() {
            if write[p].overlaps(&write[q]) {
                pending.push(Conflict {
                    volume: write[p].ghost_volume(&write[q]),
                    pair: (p, q),
                    stamp: (0, 0),
                });
            }
        }
    }

    while let Some(conflict) = pending.pop() {
        let (p, q) = conflict.pair;
        if conflict.stamp != (stamps[p], stamps[q]) {
            // One of the two moved since this entry was pushed; a fresh
            // entry for the pair was queued then if it still overlaps.
            continue;
        }

        let (new_p, new_q) =
            best_split(&write[p], &write[q]).ok_or(LayoutError::UnresolvableOverlap { p, q })?;
        write[p] = new_p;
        write[q] = new_q;
        stamps[p] += 1;
        stamps[q] += 1;

        // Re-test the two moved partitions against everyone else. The pair
        // itself is now separated, and shrinking cannot create an overlap
        // where none existed.
        for moved in [p, q] {
            for other in 0..write.len() {
                if other == p || other == q {
                    continue;
                }
                let pair = (moved.min(other), moved.max(other));
                if write[pair.0].overlaps(&write[pair.1]) {
                    pending.push(Conflict {
                        volume: write[pair.0].ghost_volume(&write[pair.1]),
                        pair,
                        stamp: (stamps[pair.0], stamps[pair.1]),
                    });
                }
            }
        }
    }

    Ok(write)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab(i0: i64, i1: i64) -> Partition {
        Partition::new(i0, i1, 0, 63, 0, 63)
    }

    #[test]
    fn conflict_heap_pops_largest_volume_then_lowest_pair() {
        let mut heap = BinaryHeap::new();
        heap.push(Conflict { volume: 10, pair: (1, 3), stamp: (0, 0) });
        heap.push(Conflict { volume: 40, pair: (2, 4), stamp: (0, 0) });
        heap.push(Conflict { volume: 40, pair: (0, 2), stamp: (0, 0) });
        heap.push(Conflict { volume: 40, pair: (0, 1), stamp: (0, 0) });

        let order: Vec<(usize, usize)> = core::iter::from_fn(|| heap.pop().map(|c| c.pair)).collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (2, 4), (1, 3)]);
    }

    #[test]
    fn adjacent_slabs_split_at_floor_midpoint() {
        let parts = [slab(0, 10), slab(8, 20)];
        let write = dissolve_ghost_zones(&parts).unwrap();
        assert_eq!(write[0], slab(0, 9));
        assert_eq!(write[1], slab(10, 20));
    }

    #[test]
    fn split_prefers_roles_by_lower_start() {
        // Reversed declaration order takes the symmetric branch.
        let parts = [slab(8, 20), slab(0, 10)];
        let write = dissolve_ghost_zones(&parts).unwrap();
        assert_eq!(write[0], slab(10, 20));
        assert_eq!(write[1], slab(0, 9));
    }

    #[test]
    fn equal_starts_shift_the_shorter_box() {
        // Both start at 0; only the longer box extends past the other, so
        // the shorter keeps the low half.
        let p = Partition::new(0, 9, 0, 9, 0, 9);
        let q = Partition::new(0, 19, 0, 9, 0, 9);
        let (p2, q2) = split_along(&p, &q, Axis::I).unwrap();
        assert_eq!(p2.i_end, 4); // floor((9 + 0) / 2)
        assert_eq!(q2.i_start, 5);
        assert_eq!((p2.j_start, p2.j_end), (0, 9));
    }

    #[test]
    fn boundary_contact_is_a_conflict_and_dissolves() {
        let parts = [slab(0, 5), slab(5, 9)];
        assert!(parts[0].overlaps(&parts[1]));
        let write = dissolve_ghost_zones(&parts).unwrap();
        // cut = floor((5 + 5) / 2) = 5: the lower slab keeps the shared plane.
        assert_eq!(write[0], slab(0, 5));
        assert_eq!(write[1], slab(6, 9));
    }

    #[test]
    fn negative_bounds_use_floor_division() {
        let parts = [
            Partition::new(-10, -5, 0, 9, 0, 9),
            Partition::new(-8, -1, 0, 9, 0, 9),
        ];
        let write = dissolve_ghost_zones(&parts).unwrap();
        // cut = floor((-5 + -8) / 2) = floor(-6.5) = -7, not -6.
        assert_eq!(write[0], Partition::new(-10, -7, 0, 9, 0, 9));
        assert_eq!(write[1], Partition::new(-6, -1, 0, 9, 0, 9));
    }

    #[test]
    fn containment_cannot_be_dissolved() {
        let parts = [
            Partition::new(0, 9, 0, 9, 0, 9),
            Partition::new(2, 7, 2, 7, 2, 7),
        ];
        let err = dissolve_ghost_zones(&parts).unwrap_err();
        assert_eq!(err, LayoutError::UnresolvableOverlap { p: 0, q: 1 });
    }

    #[test]
    fn identical_boxes_cannot_be_dissolved() {
        let p = Partition::new(0, 9, 0, 9, 0, 9);
        let err = dissolve_ghost_zones(&[p, p]).unwrap_err();
        assert_eq!(err, LayoutError::UnresolvableOverlap { p: 0, q: 1 });
    }

    #[test]
    fn flat_overlap_scores_zero_and_fails() {
        // The only viable shift is along j, but both results are one cell
        // thick on i, so the span-volume score is zero and the shift is
        // never accepted.
        let parts = [
            Partition::new(0, 0, 0, 9, 0, 9),
            Partition::new(0, 0, 5, 14, 0, 9),
        ];
        let err = dissolve_ghost_zones(&parts).unwrap_err();
        assert_eq!(err, LayoutError::UnresolvableOverlap { p: 0, q: 1 });
    }

    #[test]
    fn disjoint_layout_is_untouched() {
        let parts = [slab(0, 9), slab(11, 20), slab(22, 30)];
        let write = dissolve_ghost_zones(&parts).unwrap();
        assert_eq!(write, parts);
    }

    #[test]
    fn resolution_is_idempotent() {
        let parts = [slab(0, 10), slab(8, 20), slab(18, 30)];
        let once = dissolve_ghost_zones(&parts).unwrap();
        let twice = dissolve_ghost_zones(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn chain_of_three_resolves_left_to_right() {
        let parts = [slab(0, 10), slab(8, 20), slab(18, 30)];
        let write = dissolve_ghost_zones(&parts).unwrap();
        assert_eq!(write[0], slab(0, 9));
        assert_eq!(write[1], slab(10, 19));
        assert_eq!(write[2], slab(20, 30));
        for p in 0..write.len() {
            for q in p + 1..write.len() {
                assert!(!write[p].overlaps(&write[q]));
            }
        }
    }

    #[test]
    fn reversed_declarations_are_normalized_first() {
        let parts = [
            Partition::new(10, 0, 63, 0, 63, 0),
            Partition::new(20, 8, 0, 63, 0, 63),
        ];
        let write = dissolve_ghost_zones(&parts).unwrap();
        assert_eq!(write[0], slab(0, 9));
        assert_eq!(write[1], slab(10, 20));
    }

    #[test]
    fn axis_choice_maximizes_combined_span_volume() {
        // Overlap can be split on i or on j; the j split keeps far more
        // combined span volume and must win even though i is tried first.
        let p = Partition::new(0, 16, 0, 9, 0, 9);
        let q = Partition::new(0, 19, 6, 19, 0, 9);
        let write = dissolve_ghost_zones(&[p, q]).unwrap();
        assert_eq!(write[0], Partition::new(0, 16, 0, 7, 0, 9));
        assert_eq!(write[1], Partition::new(0, 19, 8, 19, 0, 9));
    }

    #[test]
    fn ghost_grid_resolves_disjoint_and_conserves_volume() {
        // 3x3x3 process grid of 10-cell boxes, each padded by two ghost
        // cells on every face (clamped to the grid).
        let mut declared = Vec::new();
        for pk in 0..3_i64 {
            for pj in 0..3_i64 {
                for pi in 0..3_i64 {
                    declared.push(Partition::new(
                        (pi * 10 - 2).max(0),
                        ((pi + 1) * 10 - 1 + 2).min(29),
                        (pj * 10 - 2).max(0),
                        ((pj + 1) * 10 - 1 + 2).min(29),
                        (pk * 10 - 2).max(0),
                        ((pk + 1) * 10 - 1 + 2).min(29),
                    ));
                }
            }
        }

        let write = dissolve_ghost_zones(&declared).unwrap();
        assert_eq!(write.len(), declared.len());

        let user_cells: i64 = declared.iter().map(Partition::cells).sum();
        let write_cells: i64 = write.iter().map(Partition::cells).sum();
        assert!(write_cells <= user_cells);

        // A cell declared by exactly one rank always stays with that rank;
        // only multiply-declared cells can change hands or fall into a gap.
        for k in 0..30 {
            for j in 0..30 {
                for i in 0..30 {
                    let declarers: Vec<usize> = (0..declared.len())
                        .filter(|&r| declared[r].contains(i, j, k))
                        .collect();
                    if let [only] = declarers[..] {
                        assert!(
                            write[only].contains(i, j, k),
                            "cell ({i},{j},{k}) left its sole declarer {only}"
                        );
                    }
                }
            }
        }

        for (w, u) in write.iter().zip(&declared) {
            assert!(w.is_normalized());
            assert!(w.i_start >= u.i_start && w.i_end <= u.i_end);
            assert!(w.j_start >= u.j_start && w.j_end <= u.j_end);
            assert!(w.k_start >= u.k_start && w.k_end <= u.k_end);
        }
        for p in 0..write.len() {
            for q in p + 1..write.len() {
                assert!(!write[p].overlaps(&write[q]), "{} overlaps {}", write[p], write[q]);
            }
        }
    }
}
