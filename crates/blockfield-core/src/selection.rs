//! Hyperslab selection mapping for field I/O.
//!
//! Datasets are dense row-major 3-D arrays in disk axis order `[k, j, i]`,
//! k slowest-varying. A [`Hyperslab`] selects an axis-aligned sub-box by
//! start and count per axis (stride is always 1). A [`FieldSelection`]
//! pairs the disk-side and memory-side selections for one rank and one
//! direction of transfer and is cached for the lifetime of an open field
//! group.

use crate::error::LayoutError;
use crate::partition::{Axis, GridBounds, Partition};

/// A contiguous-stride rectangular selection within a 3-D array.
///
/// `start` and `count` are in disk axis order `[k, j, i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hyperslab {
    /// First selected index per axis.
    pub start: [u64; 3],
    /// Number of selected indices per axis.
    pub count: [u64; 3],
}

impl Hyperslab {
    /// Number of elements the selection covers.
    pub fn num_elements(&self) -> u64 {
        self.count[0] * self.count[1] * self.count[2]
    }

    /// True if the selection lies entirely within an array of dims `dims`.
    pub fn fits_within(&self, dims: [u64; 3]) -> bool {
        (0..3).all(|a| self.start[a] + self.count[a] <= dims[a])
    }
}

/// Map a partition onto a disk selection, checking the grid origin.
///
/// The disk grid starts at zero on every axis, so a box reaching below
/// zero cannot be selected.
fn slab_of(part: &Partition) -> Result<Hyperslab, LayoutError> {
    for axis in Axis::ALL {
        if part.start(axis) < 0 {
            return Err(LayoutError::BelowOrigin {
                axis,
                value: part.start(axis),
            });
        }
    }
    Ok(Hyperslab {
        start: [
            part.k_start as u64,
            part.j_start as u64,
            part.i_start as u64,
        ],
        count: part.extents(),
    })
}

/// The cached disk/memory selection pair for one rank's field I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSelection {
    /// Dimensions of the on-disk dataset, `[k, j, i]`.
    pub disk_dims: [u64; 3],
    /// Selected sub-box of the dataset.
    pub disk: Hyperslab,
    /// Dimensions of the rank's in-memory buffer (its declared box).
    pub mem_dims: [u64; 3],
    /// Selected sub-box of the in-memory buffer.
    pub mem: Hyperslab,
}

impl FieldSelection {
    /// Build the write-side mapping for one rank.
    ///
    /// The dataset is sized to the grid bounds and the rank writes exactly
    /// its ghost-free write box. Its in-memory buffer is sized to the full
    /// declared box, so the memory selection is the write box offset by
    /// `write.start - user.start` per axis: ghost cells stay in memory and
    /// never reach the disk.
    ///
    /// `write` must be the dissolved counterpart of `user` from the same
    /// resolved table.
    pub fn for_writing(
        user: &Partition,
        write: &Partition,
        bounds: GridBounds,
    ) -> Result<FieldSelection, LayoutError> {
        let disk_dims = bounds.dataset_dims()?;
        let disk = slab_of(write)?;
        debug_assert!(disk.fits_within(disk_dims));
        debug_assert!(
            write.i_start >= user.i_start
                && write.j_start >= user.j_start
                && write.k_start >= user.k_start
        );
        let mem = Hyperslab {
            start: [
                (write.k_start - user.k_start) as u64,
                (write.j_start - user.j_start) as u64,
                (write.i_start - user.i_start) as u64,
            ],
            count: write.extents(),
        };
        Ok(FieldSelection {
            disk_dims,
            disk,
            mem_dims: user.extents(),
            mem,
        })
    }

    /// Build the read-side mapping for one rank.
    ///
    /// The stored dataset must be at least as large as the tracked bounds
    /// on every axis; anything smaller cannot hold the declared layout.
    /// The rank reads its full declared box, ghost cells included, into a
    /// contiguous buffer starting at offset zero.
    pub fn for_reading(
        user: &Partition,
        bounds: GridBounds,
        stored_dims: [u64; 3],
    ) -> Result<FieldSelection, LayoutError> {
        let required = bounds.dataset_dims()?;
        if (0..3).any(|a| stored_dims[a] < required[a]) {
            return Err(LayoutError::DiskExtentTooSmall {
                stored: stored_dims,
                required,
            });
        }
        let disk = slab_of(user)?;
        let mem_dims = user.extents();
        Ok(FieldSelection {
            disk_dims: stored_dims,
            disk,
            mem_dims,
            mem: Hyperslab {
                start: [0; 3],
                count: mem_dims,
            },
        })
    }

    /// Length of the rank's in-memory field buffer, in elements.
    pub fn buffer_len(&self) -> usize {
        (self.mem_dims[0] * self.mem_dims[1] * self.mem_dims[2]) as usize
    }
}

// ---------------------------------------------------------------------------
// Dense box copy
// ---------------------------------------------------------------------------

/// Copy a `count`-sized box between two row-major 3-D arrays.
///
/// Rows along the fastest axis are copied as contiguous slices. Both
/// selections must lie within their arrays and the arrays must match their
/// dims; see [`Hyperslab::fits_within`].
///
/// # Panics
///
/// Panics if either selection reaches outside its array.
#[allow(clippy::too_many_arguments)]
pub fn copy_box(
    src: &[f64],
    src_dims: [u64; 3],
    src_start: [u64; 3],
    dst: &mut [f64],
    dst_dims: [u64; 3],
    dst_start: [u64; 3],
    count: [u64; 3],
) {
    debug_assert!(Hyperslab { start: src_start, count }.fits_within(src_dims));
    debug_assert!(Hyperslab { start: dst_start, count }.fits_within(dst_dims));
    debug_assert_eq!(src.len() as u64, src_dims[0] * src_dims[1] * src_dims[2]);
    debug_assert_eq!(dst.len() as u64, dst_dims[0] * dst_dims[1] * dst_dims[2]);

    let row = count[2] as usize;
    for k in 0..count[0] {
        for j in 0..count[1] {
            let s = (((src_start[0] + k) * src_dims[1] + src_start[1] + j) * src_dims[2]
                + src_start[2]) as usize;
            let d = (((dst_start[0] + k) * dst_dims[1] + dst_start[1] + j) * dst_dims[2]
                + dst_start[2]) as usize;
            dst[d..d + row].copy_from_slice(&src[s..s + row]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    #[test]
    fn hyperslab_counts_and_bounds() {
        let slab = Hyperslab { start: [1, 2, 3], count: [2, 3, 4] };
        assert_eq!(slab.num_elements(), 24);
        assert!(slab.fits_within([3, 5, 7]));
        assert!(!slab.fits_within([3, 5, 6]));
        assert!(!slab.fits_within([2, 5, 7]));
    }

    #[test]
    fn write_mapping_offsets_ghost_cells_in_memory() {
        // Two ranks split at i = 9/10; rank 1 declared i from 8 and keeps
        // two ghost planes in memory that the disk selection skips.
        let user = Partition::new(8, 20, 0, 63, 0, 63);
        let write = Partition::new(10, 20, 0, 63, 0, 63);
        let bounds = GridBounds { i_max: 20, j_max: 63, k_max: 63 };
        let sel = FieldSelection::for_writing(&user, &write, bounds).unwrap();

        assert_eq!(sel.disk_dims, [64, 64, 21]);
        assert_eq!(sel.disk, Hyperslab { start: [0, 0, 10], count: [64, 64, 11] });
        assert_eq!(sel.mem_dims, [64, 64, 13]);
        assert_eq!(sel.mem, Hyperslab { start: [0, 0, 2], count: [64, 64, 11] });
        assert_eq!(sel.buffer_len(), 64 * 64 * 13);
    }

    #[test]
    fn write_mapping_of_unshrunk_rank_is_dense() {
        let user = Partition::new(0, 10, 0, 63, 0, 63);
        let write = Partition::new(0, 9, 0, 63, 0, 63);
        let bounds = GridBounds { i_max: 20, j_max: 63, k_max: 63 };
        let sel = FieldSelection::for_writing(&user, &write, bounds).unwrap();

        assert_eq!(sel.disk, Hyperslab { start: [0, 0, 0], count: [64, 64, 10] });
        assert_eq!(sel.mem, Hyperslab { start: [0, 0, 0], count: [64, 64, 10] });
        assert_eq!(sel.mem_dims, [64, 64, 11]);
    }

    #[test]
    fn read_mapping_selects_full_declared_box() {
        let user = Partition::new(8, 20, 0, 63, 0, 63);
        let bounds = GridBounds { i_max: 20, j_max: 63, k_max: 63 };
        let sel = FieldSelection::for_reading(&user, bounds, [64, 64, 21]).unwrap();

        assert_eq!(sel.disk_dims, [64, 64, 21]);
        assert_eq!(sel.disk, Hyperslab { start: [0, 0, 8], count: [64, 64, 13] });
        assert_eq!(sel.mem, Hyperslab { start: [0, 0, 0], count: [64, 64, 13] });
        assert_eq!(sel.mem_dims, [64, 64, 13]);
    }

    #[test]
    fn read_mapping_accepts_larger_stored_dims() {
        let user = Partition::new(0, 9, 0, 9, 0, 9);
        let bounds = GridBounds { i_max: 9, j_max: 9, k_max: 9 };
        let sel = FieldSelection::for_reading(&user, bounds, [16, 12, 10]).unwrap();
        assert_eq!(sel.disk_dims, [16, 12, 10]);
    }

    #[test]
    fn read_mapping_rejects_smaller_stored_dims() {
        let user = Partition::new(0, 9, 0, 9, 0, 9);
        let bounds = GridBounds { i_max: 9, j_max: 9, k_max: 9 };
        let err = FieldSelection::for_reading(&user, bounds, [10, 10, 9]).unwrap_err();
        assert_eq!(
            err,
            LayoutError::DiskExtentTooSmall { stored: [10, 10, 9], required: [10, 10, 10] }
        );
    }

    #[test]
    fn boxes_below_the_origin_cannot_be_selected() {
        let user = Partition::new(-2, 9, 0, 9, 0, 9);
        let bounds = GridBounds { i_max: 9, j_max: 9, k_max: 9 };
        let err = FieldSelection::for_reading(&user, bounds, [10, 10, 10]).unwrap_err();
        assert_eq!(err, LayoutError::BelowOrigin { axis: Axis::I, value: -2 });

        // A declaration dipping below zero is fine for writing as long as
        // dissolution pulled the write box up into range.
        let write = Partition::new(0, 9, 0, 9, 0, 9);
        let sel = FieldSelection::for_writing(&user, &write, bounds).unwrap();
        assert_eq!(sel.mem, Hyperslab { start: [0, 0, 2], count: [10, 10, 10] });
        assert_eq!(sel.mem_dims, [10, 10, 12]);
    }

    fn grid(dims: [u64; 3]) -> Vec<f64> {
        (0..dims[0] * dims[1] * dims[2]).map(|v| v as f64).collect()
    }

    #[test]
    fn copy_box_gathers_a_sub_box() {
        // 2x3x4 source, gather the [1..2, 1..3, 1..3) box.
        let src = grid([2, 3, 4]);
        let mut dst = vec![0.0; 4];
        copy_box(&src, [2, 3, 4], [1, 1, 1], &mut dst, [1, 2, 2], [0, 0, 0], [1, 2, 2]);
        // Source index (k,j,i) = (1,1,1) -> 17, (1,1,2) -> 18, (1,2,1) -> 21, ...
        assert_eq!(dst, vec![17.0, 18.0, 21.0, 22.0]);
    }

    #[test]
    fn copy_box_scatters_into_an_offset_box() {
        let src = vec![1.0, 2.0, 3.0, 4.0];
        let mut dst = vec![0.0; 27];
        copy_box(&src, [1, 2, 2], [0, 0, 0], &mut dst, [3, 3, 3], [1, 1, 1], [1, 2, 2]);
        let mut expected = vec![0.0; 27];
        expected[(1 * 3 + 1) * 3 + 1] = 1.0;
        expected[(1 * 3 + 1) * 3 + 2] = 2.0;
        expected[(1 * 3 + 2) * 3 + 1] = 3.0;
        expected[(1 * 3 + 2) * 3 + 2] = 4.0;
        assert_eq!(dst, expected);
    }

    #[test]
    fn copy_box_roundtrips_through_a_dataset() {
        let dataset_dims = [6, 5, 7];
        let slab = Hyperslab { start: [2, 1, 3], count: [3, 4, 4] };
        let payload = grid(slab.count);
        let mut dataset = vec![0.0; 6 * 5 * 7];
        copy_box(
            &payload, slab.count, [0, 0, 0],
            &mut dataset, dataset_dims, slab.start,
            slab.count,
        );
        let mut back = vec![0.0; payload.len()];
        copy_box(
            &dataset, dataset_dims, slab.start,
            &mut back, slab.count, [0, 0, 0],
            slab.count,
        );
        assert_eq!(back, payload);
        // Untouched cells stay zero.
        assert_eq!(dataset[0], 0.0);
        assert_eq!(dataset.iter().filter(|&&v| v != 0.0).count(), payload.len() - 1);
    }
}
