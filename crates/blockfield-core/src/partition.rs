//! Inclusive 3-D integer boxes assigned to process ranks.
//!
//! A [`Partition`] is the box one process declares over the dense logical
//! grid. Bounds are signed and inclusive on every axis; `(0, 9)` spans ten
//! cells. Two volume measures exist side by side and are both load-bearing:
//! [`Partition::ghost_volume`] counts cells inclusively (`end - start + 1`
//! per axis) and ranks which conflict to dissolve first, while
//! [`Partition::span_volume`] multiplies bare spans (`end - start`) and
//! scores dissolve candidates. They disagree by design; see
//! [`crate::dissolve`].

use core::fmt;

use crate::error::LayoutError;

/// One axis of the logical grid.
///
/// Disk datasets store `k` slowest-varying, `i` fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Fastest-varying axis.
    I,
    /// Middle axis.
    J,
    /// Slowest-varying axis.
    K,
}

impl Axis {
    /// All axes in dissolve trial order.
    pub const ALL: [Axis; 3] = [Axis::I, Axis::J, Axis::K];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::I => write!(f, "i"),
            Axis::J => write!(f, "j"),
            Axis::K => write!(f, "k"),
        }
    }
}

/// An axis-aligned box of grid cells with inclusive signed bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// First cell on the i axis.
    pub i_start: i64,
    /// Last cell on the i axis (inclusive).
    pub i_end: i64,
    /// First cell on the j axis.
    pub j_start: i64,
    /// Last cell on the j axis (inclusive).
    pub j_end: i64,
    /// First cell on the k axis.
    pub k_start: i64,
    /// Last cell on the k axis (inclusive).
    pub k_end: i64,
}

impl Partition {
    /// Build a partition from six bounds in `(i0, i1, j0, j1, k0, k1)` order.
    ///
    /// Bounds are stored as given; call [`Partition::normalized`] to swap
    /// reversed axes.
    pub fn new(i0: i64, i1: i64, j0: i64, j1: i64, k0: i64, k1: i64) -> Self {
        Partition {
            i_start: i0,
            i_end: i1,
            j_start: j0,
            j_end: j1,
            k_start: k0,
            k_end: k1,
        }
    }

    /// Return a copy with `start <= end` on every axis, swapping any axis
    /// declared in reverse.
    pub fn normalized(&self) -> Self {
        let mut p = *self;
        for axis in Axis::ALL {
            if p.start(axis) > p.end(axis) {
                let s = p.start(axis);
                p.set_start(axis, p.end(axis));
                p.set_end(axis, s);
            }
        }
        p
    }

    /// True if `start <= end` holds on every axis.
    pub fn is_normalized(&self) -> bool {
        self.i_start <= self.i_end && self.j_start <= self.j_end && self.k_start <= self.k_end
    }

    /// Start bound on the given axis.
    pub fn start(&self, axis: Axis) -> i64 {
        match axis {
            Axis::I => self.i_start,
            Axis::J => self.j_start,
            Axis::K => self.k_start,
        }
    }

    /// End bound (inclusive) on the given axis.
    pub fn end(&self, axis: Axis) -> i64 {
        match axis {
            Axis::I => self.i_end,
            Axis::J => self.j_end,
            Axis::K => self.k_end,
        }
    }

    /// Set the start bound on the given axis.
    pub fn set_start(&mut self, axis: Axis, value: i64) {
        match axis {
            Axis::I => self.i_start = value,
            Axis::J => self.j_start = value,
            Axis::K => self.k_start = value,
        }
    }

    /// Set the end bound on the given axis.
    pub fn set_end(&mut self, axis: Axis, value: i64) {
        match axis {
            Axis::I => self.i_end = value,
            Axis::J => self.j_end = value,
            Axis::K => self.k_end = value,
        }
    }

    /// Number of cells in the box. Bounds are inclusive, so a partition
    /// with `start == end` on every axis holds one cell.
    pub fn cells(&self) -> i64 {
        (self.i_end - self.i_start + 1)
            * (self.j_end - self.j_start + 1)
            * (self.k_end - self.k_start + 1)
    }

    /// Product of the bare spans `end - start` over the three axes.
    ///
    /// This measures spans, not cells; a box one cell thick on any axis
    /// scores zero. Used to score dissolve candidates.
    pub fn span_volume(&self) -> i64 {
        (self.i_end - self.i_start) * (self.j_end - self.j_start) * (self.k_end - self.k_start)
    }

    /// Extent of the box on one axis, in cells.
    pub fn extent(&self, axis: Axis) -> u64 {
        (self.end(axis) - self.start(axis) + 1) as u64
    }

    /// Extents of the box in disk axis order `[k, j, i]`, k slowest.
    pub fn extents(&self) -> [u64; 3] {
        [self.extent(Axis::K), self.extent(Axis::J), self.extent(Axis::I)]
    }

    /// Ghost-zone predicate: true unless on some axis one box ends strictly
    /// before the other starts. Exact boundary contact (`p.end == q.start`)
    /// still overlaps.
    pub fn overlaps(&self, other: &Partition) -> bool {
        for axis in Axis::ALL {
            if self.end(axis) < other.start(axis) || other.end(axis) < self.start(axis) {
                return false;
            }
        }
        true
    }

    /// Inclusive cell count of the intersection of two overlapping boxes.
    ///
    /// Defined only when [`Partition::overlaps`] holds; each per-axis factor
    /// `min(end) - max(start) + 1` is then at least 1.
    pub fn ghost_volume(&self, other: &Partition) -> i64 {
        let mut vol = 1;
        for axis in Axis::ALL {
            let lo = self.start(axis).max(other.start(axis));
            let hi = self.end(axis).min(other.end(axis));
            vol *= hi - lo + 1;
        }
        vol
    }

    /// True if the cell `(i, j, k)` lies inside the box.
    pub fn contains(&self, i: i64, j: i64, k: i64) -> bool {
        self.i_start <= i
            && i <= self.i_end
            && self.j_start <= j
            && j <= self.j_end
            && self.k_start <= k
            && k <= self.k_end
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}:{}, {}:{}, {}:{})",
            self.i_start, self.i_end, self.j_start, self.j_end, self.k_start, self.k_end
        )
    }
}

/// Global grid extent derived from a declared layout: the component-wise
/// maximum of the `end` bounds across all partitions. The grid origin is
/// fixed at zero; only the maxima are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridBounds {
    /// Largest `i_end` seen across the layout.
    pub i_max: i64,
    /// Largest `j_end` seen across the layout.
    pub j_max: i64,
    /// Largest `k_end` seen across the layout.
    pub k_max: i64,
}

impl GridBounds {
    /// Scan a layout for the per-axis maximum end bound.
    ///
    /// An empty layout yields `-1` on every axis, which no dataset can be
    /// sized for.
    pub fn from_partitions(parts: &[Partition]) -> Self {
        let mut b = GridBounds {
            i_max: -1,
            j_max: -1,
            k_max: -1,
        };
        for p in parts {
            b.i_max = b.i_max.max(p.i_end);
            b.j_max = b.j_max.max(p.j_end);
            b.k_max = b.k_max.max(p.k_end);
        }
        b
    }

    /// Dataset dimensions `[k_max + 1, j_max + 1, i_max + 1]`, k slowest.
    ///
    /// Fails with [`LayoutError::BelowOrigin`] if any maximum is negative,
    /// since the disk grid starts at zero.
    pub fn dataset_dims(&self) -> Result<[u64; 3], LayoutError> {
        for (axis, max) in [(Axis::I, self.i_max), (Axis::J, self.j_max), (Axis::K, self.k_max)] {
            if max < 0 {
                return Err(LayoutError::BelowOrigin { axis, value: max });
            }
        }
        Ok([self.k_max as u64 + 1, self.j_max as u64 + 1, self.i_max as u64 + 1])
    }
}

impl fmt::Display for GridBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(0:{}, 0:{}, 0:{})", self.i_max, self.j_max, self.k_max)
    }
}
