//! Error types for the container and the block-field API.

use std::fmt;

use blockfield_core::error::LayoutError;

/// Errors from the container's group/dataset/attribute primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No node exists at the given path.
    NotFound(String),
    /// A node already exists at the given path.
    AlreadyExists(String),
    /// The node at the given path is not a group.
    NotAGroup(String),
    /// The node at the given path is not a dataset.
    NotADataset(String),
    /// A node name is empty or contains a path separator.
    InvalidName(String),
    /// A dataset exists with different dimensions than requested.
    DimsMismatch {
        /// Path of the dataset.
        path: String,
        /// Dimensions the caller asked for.
        requested: Vec<u64>,
        /// Dimensions of the stored dataset.
        stored: Vec<u64>,
    },
    /// Selection I/O needs a rank-3 dataset.
    DatasetRank {
        /// Path of the dataset.
        path: String,
        /// Rank of the stored dataset.
        rank: usize,
    },
    /// A selection reaches outside the dataset.
    SelectionOutOfBounds {
        /// Path of the dataset.
        path: String,
        /// First selected index per axis.
        start: [u64; 3],
        /// Selection extent per axis.
        count: [u64; 3],
        /// Dimensions of the dataset.
        dims: [u64; 3],
    },
    /// The data buffer does not match the selection size.
    DataSizeMismatch {
        /// Elements the selection covers.
        expected: usize,
        /// Elements the caller provided.
        actual: usize,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(path) => write!(f, "no such node: {path}"),
            StoreError::AlreadyExists(path) => write!(f, "node already exists: {path}"),
            StoreError::NotAGroup(path) => write!(f, "not a group: {path}"),
            StoreError::NotADataset(path) => write!(f, "not a dataset: {path}"),
            StoreError::InvalidName(name) => {
                write!(f, "invalid node name: {name:?} (must be non-empty, no '/')")
            }
            StoreError::DimsMismatch { path, requested, stored } => {
                write!(
                    f,
                    "dataset {path} has dims {stored:?}, requested {requested:?}"
                )
            }
            StoreError::DatasetRank { path, rank } => {
                write!(f, "dataset {path} has rank {rank}, selection I/O needs rank 3")
            }
            StoreError::SelectionOutOfBounds { path, start, count, dims } => {
                write!(
                    f,
                    "selection start {start:?} count {count:?} reaches outside dataset {path} of dims {dims:?}"
                )
            }
            StoreError::DataSizeMismatch { expected, actual } => {
                write!(
                    f,
                    "selection covers {expected} elements, buffer holds {actual}"
                )
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from serializing or parsing a container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The file does not start with the container signature.
    BadSignature,
    /// The format version byte is not supported.
    UnsupportedVersion(u8),
    /// Unexpected end of data.
    UnexpectedEof {
        /// Number of bytes expected.
        expected: usize,
        /// Number of bytes actually available.
        available: usize,
    },
    /// Trailing checksum does not match the file contents.
    ChecksumMismatch {
        /// The checksum stored in the file.
        expected: u32,
        /// The checksum we computed.
        computed: u32,
    },
    /// Unknown node record tag.
    BadNodeTag(u8),
    /// Unknown attribute value tag.
    BadAttrTag(u8),
    /// Unknown dataset filter tag.
    BadFilterTag(u8),
    /// The file uses a filter this build does not carry.
    FilterUnavailable(&'static str),
    /// A dataset payload failed to decompress.
    Decompress(String),
    /// A dataset payload does not match its dimensions.
    PayloadSize {
        /// Bytes the dimensions call for.
        expected: usize,
        /// Bytes the payload holds.
        actual: usize,
    },
    /// Group nesting exceeds the parser's depth cap.
    NestingTooDeep(usize),
    /// A stored name is not valid UTF-8 or not a valid node name.
    BadName,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BadSignature => write!(f, "container signature not found"),
            CodecError::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            CodecError::UnexpectedEof { expected, available } => {
                write!(f, "unexpected EOF: need {expected} bytes, have {available}")
            }
            CodecError::ChecksumMismatch { expected, computed } => {
                write!(
                    f,
                    "checksum mismatch: expected {expected:#010x}, computed {computed:#010x}"
                )
            }
            CodecError::BadNodeTag(t) => write!(f, "unknown node tag: {t:#04x}"),
            CodecError::BadAttrTag(t) => write!(f, "unknown attribute tag: {t:#04x}"),
            CodecError::BadFilterTag(t) => write!(f, "unknown filter tag: {t:#04x}"),
            CodecError::FilterUnavailable(name) => {
                write!(f, "file uses the {name} filter, not enabled in this build")
            }
            CodecError::Decompress(msg) => write!(f, "payload decompression failed: {msg}"),
            CodecError::PayloadSize { expected, actual } => {
                write!(f, "dataset payload holds {actual} bytes, dims call for {expected}")
            }
            CodecError::NestingTooDeep(depth) => {
                write!(f, "group nesting deeper than {depth} levels")
            }
            CodecError::BadName => write!(f, "stored node name is invalid"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors from the collective exchange between ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// A collective returned a different number of entries than ranks.
    SizeMismatch {
        /// Communicator size.
        expected: usize,
        /// Entries actually gathered.
        actual: usize,
    },
    /// A peer rank panicked while holding the rendezvous.
    Poisoned,
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::SizeMismatch { expected, actual } => {
                write!(f, "collective gathered {actual} entries for {expected} ranks")
            }
            CommError::Poisoned => write!(f, "collective rendezvous poisoned by a peer panic"),
        }
    }
}

impl std::error::Error for CommError {}

/// Errors that can occur when using the block-field API.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the filesystem.
    Io(std::io::Error),
    /// Container file serialization or parsing error.
    Codec(CodecError),
    /// Container primitive failure.
    Store(StoreError),
    /// Partition layout or selection mapping failure.
    Layout(LayoutError),
    /// Collective exchange failure.
    Comm(CommError),
    /// A field operation was called before any layout was defined.
    NoLayout,
    /// A field operation was called with no current time step.
    NoStep,
    /// A mutating operation was called on a read-only file.
    ReadOnly,
    /// A multi-rank group was opened without a shared store.
    SharedStoreRequired,
    /// The requested time step does not exist in the file.
    StepNotFound(u64),
    /// A rank index is outside the resolved table.
    InvalidRank {
        /// The rank asked for.
        rank: usize,
        /// Ranks in the table.
        nprocs: usize,
    },
    /// A field buffer does not match the declared partition size.
    BufferSize {
        /// Elements the declared partition holds.
        expected: usize,
        /// Elements the caller provided.
        actual: usize,
    },
    /// No field with the given name exists in the current step.
    FieldNotFound(String),
    /// A field with the given name already exists in the current step.
    FieldExists(String),
    /// No attribute with the given name exists on the field.
    AttributeNotFound {
        /// Field name.
        field: String,
        /// Attribute name.
        name: String,
    },
    /// An attribute exists but holds a different value type or length.
    AttributeType {
        /// Attribute name.
        name: String,
        /// What the caller expected, e.g. "3-element f64 array".
        expected: &'static str,
    },
    /// An enumeration index is out of range.
    IndexOutOfRange {
        /// The index asked for.
        index: usize,
        /// Number of entries.
        count: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Codec(e) => write!(f, "container format error: {e}"),
            Error::Store(e) => write!(f, "container error: {e}"),
            Error::Layout(e) => write!(f, "layout error: {e}"),
            Error::Comm(e) => write!(f, "collective error: {e}"),
            Error::NoLayout => write!(f, "no field layout defined"),
            Error::NoStep => write!(f, "no current time step"),
            Error::ReadOnly => write!(f, "file is open read-only"),
            Error::SharedStoreRequired => {
                write!(f, "a rank group must share a store, see OpenOptions::store")
            }
            Error::StepNotFound(step) => write!(f, "no such time step: {step}"),
            Error::InvalidRank { rank, nprocs } => {
                write!(f, "rank {rank} out of range for {nprocs} ranks")
            }
            Error::BufferSize { expected, actual } => {
                write!(
                    f,
                    "field buffer holds {actual} elements, declared partition needs {expected}"
                )
            }
            Error::FieldNotFound(name) => write!(f, "no such field: {name}"),
            Error::FieldExists(name) => write!(f, "field already exists: {name}"),
            Error::AttributeNotFound { field, name } => {
                write!(f, "field {field} has no attribute {name}")
            }
            Error::AttributeType { name, expected } => {
                write!(f, "attribute {name} is not a {expected}")
            }
            Error::IndexOutOfRange { index, count } => {
                write!(f, "index {index} out of range for {count} entries")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Store(e) => Some(e),
            Error::Layout(e) => Some(e),
            Error::Comm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<LayoutError> for Error {
    fn from(e: LayoutError) -> Self {
        Error::Layout(e)
    }
}

impl From<CommError> for Error {
    fn from(e: CommError) -> Self {
        Error::Comm(e)
    }
}
