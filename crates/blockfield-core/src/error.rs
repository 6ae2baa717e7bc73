//! Error types for partition layout and selection mapping.

use core::fmt;

use crate::partition::Axis;

/// Errors that can occur while resolving a partition layout or mapping it
/// onto disk/memory selections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Two declared partitions overlap in a way no boundary shift can
    /// dissolve (one is contained in the other on every axis, or the only
    /// viable shift would leave a degenerate box).
    UnresolvableOverlap {
        /// Rank of the first partition of the conflicting pair.
        p: usize,
        /// Rank of the second partition of the conflicting pair.
        q: usize,
    },
    /// A stored dataset is smaller than the currently tracked grid bounds.
    DiskExtentTooSmall {
        /// Dimensions of the stored dataset, slowest axis first.
        stored: [u64; 3],
        /// Dimensions required by the tracked bounds, slowest axis first.
        required: [u64; 3],
    },
    /// A coordinate to be selected on disk lies below the grid origin.
    /// The disk grid spans `[0, max]` on every axis.
    BelowOrigin {
        /// Axis on which the coordinate is negative.
        axis: Axis,
        /// The offending coordinate value.
        value: i64,
    },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::UnresolvableOverlap { p, q } => {
                write!(
                    f,
                    "cannot dissolve ghost zone between partitions {p} and {q}"
                )
            }
            LayoutError::DiskExtentTooSmall { stored, required } => {
                write!(
                    f,
                    "stored field dims {stored:?} are smaller than the layout requires {required:?}"
                )
            }
            LayoutError::BelowOrigin { axis, value } => {
                write!(
                    f,
                    "coordinate {value} on axis {axis} lies below the grid origin"
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LayoutError {}
