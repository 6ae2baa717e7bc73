//! Partition geometry for block-structured grids.
//!
//! This crate provides the layout engine used by `blockfield`: inclusive
//! 3-D integer partitions declared per process rank, dissolution of
//! overlapping declarations ("ghost zones") into a disjoint write layout,
//! and the hyperslab selection mapping that turns partitions into disk and
//! memory sub-box descriptors for field I/O.
//! It supports `no_std` environments with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod dissolve;
pub mod error;
pub mod layout;
pub mod partition;
pub mod selection;

pub use error::LayoutError;
pub use layout::PartitionTable;
pub use partition::{Axis, GridBounds, Partition};
pub use selection::{FieldSelection, Hyperslab};
