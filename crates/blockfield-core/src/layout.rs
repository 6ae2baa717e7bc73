//! The per-rank partition table: declared layout, write layout, grid bounds.

use alloc::vec::Vec;

use crate::dissolve::dissolve_ghost_zones;
use crate::error::LayoutError;
use crate::partition::{GridBounds, Partition};

/// A fully resolved layout: what each rank declared, what each rank may
/// write, and the grid bounds derived from the declarations.
///
/// A table is built wholesale by [`PartitionTable::resolve`] and never
/// patched; redefining a layout means resolving a new table. Index order is
/// process rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    user: Vec<Partition>,
    write: Vec<Partition>,
    bounds: GridBounds,
}

impl PartitionTable {
    /// Resolve a declared layout, one entry per rank.
    ///
    /// Entries are normalized, the ghost zones between them are dissolved
    /// into the disjoint write layout, and the grid bounds are taken over
    /// the normalized declarations.
    pub fn resolve(declared: Vec<Partition>) -> Result<Self, LayoutError> {
        let user: Vec<Partition> = declared.iter().map(Partition::normalized).collect();
        let write = dissolve_ghost_zones(&user)?;
        let bounds = GridBounds::from_partitions(&user);
        Ok(PartitionTable { user, write, bounds })
    }

    /// Number of ranks in the table.
    pub fn nprocs(&self) -> usize {
        self.user.len()
    }

    /// The partition rank `rank` declared, normalized. This is the box the
    /// rank's in-memory field buffers are sized to, ghost cells included.
    pub fn user_partition(&self, rank: usize) -> Option<&Partition> {
        self.user.get(rank)
    }

    /// The ghost-free partition rank `rank` actually writes.
    pub fn write_partition(&self, rank: usize) -> Option<&Partition> {
        self.write.get(rank)
    }

    /// All declared partitions in rank order.
    pub fn user_layout(&self) -> &[Partition] {
        &self.user
    }

    /// All write partitions in rank order.
    pub fn write_layout(&self) -> &[Partition] {
        &self.write
    }

    /// Grid bounds over the declared layout.
    pub fn bounds(&self) -> GridBounds {
        self.bounds
    }

    /// The rank whose write partition owns cell `(i, j, k)`, or `None` when
    /// the cell fell into a gap opened by dissolution (or was never
    /// declared). Write partitions are disjoint, so at most one rank
    /// matches.
    pub fn owner_of(&self, i: i64, j: i64, k: i64) -> Option<usize> {
        self.write.iter().position(|p| p.contains(i, j, k))
    }
}
