//! Parallel block-structured field I/O.
//!
//! Each rank of a cooperating group declares a 3-D box ("partition") of a
//! dense logical grid. Overlapping declarations are dissolved into a
//! disjoint write layout, and named scalar or vector fields move between
//! each rank's buffer and per-step datasets through hyperslab selections.
//! The layout engine lives in `blockfield-core`; this crate adds the file
//! container, the collective plumbing and the field API.
//!
//! # Writing
//!
//! ```no_run
//! use blockfield::{BlockFile, Partition};
//!
//! let mut file = BlockFile::create("fields.bfd").unwrap();
//! file.set_step(0).unwrap();
//! file.define_layout(Partition::new(0, 63, 0, 63, 0, 63)).unwrap();
//! let density = vec![0.0; 64 * 64 * 64];
//! file.write_scalar_field("density", &density).unwrap();
//! file.set_field_spacing("density", [0.5, 0.5, 0.5]).unwrap();
//! file.close().unwrap();
//! ```
//!
//! # Reading
//!
//! ```no_run
//! use blockfield::{BlockFile, Partition};
//!
//! let mut file = BlockFile::open("fields.bfd").unwrap();
//! file.set_step(0).unwrap();
//! file.define_layout(Partition::new(0, 63, 0, 63, 0, 63)).unwrap();
//! let mut density = vec![0.0; 64 * 64 * 64];
//! file.read_scalar_field("density", &mut density).unwrap();
//! ```

pub mod block;
mod codec;
pub mod comm;
pub mod error;
pub mod file;
pub mod store;

pub use block::{AttrInfo, FieldInfo};
pub use comm::{Communicator, SoloComm, ThreadComm};
pub use error::{CodecError, CommError, Error, StoreError};
pub use file::{BlockFile, FileMode, OpenOptions};
pub use store::{AttrKind, AttrValue, Store};

// Re-export the layout engine for callers that work with partitions
// directly.
pub use blockfield_core::{
    Axis, FieldSelection, GridBounds, Hyperslab, LayoutError, Partition, PartitionTable,
};
