//! File lifecycle: opening, time steps, flushing, closing.
//!
//! A [`BlockFile`] is an in-memory tree of groups and datasets, loaded
//! from and saved to the container format in one piece. Ranks of a group
//! share one [`Store`]; open, flush and close are collective, and rank 0
//! performs the actual disk I/O.
//!
//! With the `mmap` feature (default) the container is parsed straight out
//! of a memory-mapped region instead of an intermediate read buffer.

use std::path::{Path, PathBuf};

use crate::block::BlockState;
use crate::codec;
use crate::comm::{Communicator, SoloComm};
use crate::error::Error;
use crate::store::{GroupNode, Store};

// ---------------------------------------------------------------------------
// FileMode
// ---------------------------------------------------------------------------

/// What a file may be used for once open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Existing file, queries only.
    Read,
    /// Fresh file; existing content at the path is discarded.
    Write,
    /// Existing or fresh file, extended in place.
    Append,
}

impl FileMode {
    /// True for modes that allow mutation.
    pub fn is_writable(self) -> bool {
        !matches!(self, FileMode::Read)
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileMode::Read => write!(f, "read"),
            FileMode::Write => write!(f, "write"),
            FileMode::Append => write!(f, "append"),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenOptions
// ---------------------------------------------------------------------------

/// Builder for opening a [`BlockFile`].
///
/// # Example
///
/// ```no_run
/// use blockfield::{FileMode, OpenOptions};
///
/// let mut file = OpenOptions::new()
///     .mode(FileMode::Append)
///     .open("fields.bfd")
///     .unwrap();
/// file.set_step(0).unwrap();
/// ```
pub struct OpenOptions {
    mode: FileMode,
    comm: Box<dyn Communicator>,
    store: Option<Store>,
}

impl OpenOptions {
    /// Read mode, a group of one, a private store.
    pub fn new() -> Self {
        Self {
            mode: FileMode::Read,
            comm: Box::new(SoloComm),
            store: None,
        }
    }

    /// Select the file mode.
    pub fn mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Join a rank group. Every member must open the file with the same
    /// mode and a shared store.
    pub fn communicator(mut self, comm: impl Communicator + 'static) -> Self {
        self.comm = Box::new(comm);
        self
    }

    /// Use a shared tree instead of a private one. Required whenever the
    /// communicator has more than one rank, so all ranks mutate the same
    /// file image.
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Open the file at `path`. Collective; every rank initializes the
    /// shared tree identically, so failures surface on all ranks alike.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<BlockFile, Error> {
        let path = path.as_ref().to_path_buf();
        let store = self.checked_store()?;

        match self.mode {
            FileMode::Read => store.set_root(load_tree(&path)?),
            FileMode::Write => {
                // Claim the path now so a bad one fails at open, not at
                // close. The bytes land on flush.
                std::fs::File::create(&path)?;
                store.set_root(GroupNode::default());
            }
            FileMode::Append => match load_tree(&path) {
                Ok(root) => store.set_root(root),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    store.set_root(GroupNode::default());
                }
                Err(e) => return Err(e),
            },
        }

        // No rank proceeds until every rank has settled the tree.
        self.comm.barrier();
        log::debug!(
            "opened {} mode={} ranks={}",
            path.display(),
            self.mode,
            self.comm.size()
        );
        Ok(BlockFile {
            store,
            path: Some(path),
            mode: self.mode,
            comm: self.comm,
            step: None,
            block: BlockState::default(),
            closed: false,
        })
    }

    /// Open over the store alone, with no backing path. [`BlockFile::flush`]
    /// is then a no-op; use [`BlockFile::to_bytes`] to serialize.
    pub fn in_memory(self) -> Result<BlockFile, Error> {
        let store = self.checked_store()?;
        if self.mode == FileMode::Write {
            store.set_root(GroupNode::default());
        }
        self.comm.barrier();
        Ok(BlockFile {
            store,
            path: None,
            mode: self.mode,
            comm: self.comm,
            step: None,
            block: BlockState::default(),
            closed: false,
        })
    }

    fn checked_store(&self) -> Result<Store, Error> {
        match &self.store {
            Some(store) => Ok(store.clone()),
            None if self.comm.size() > 1 => Err(Error::SharedStoreRequired),
            None => Ok(Store::default()),
        }
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "mmap")]
fn load_tree(path: &Path) -> Result<GroupNode, Error> {
    let file = std::fs::File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before this function
    // returns. As with any mapped read, truncating the file concurrently
    // is undefined behaviour.
    let map = unsafe { memmap2::Mmap::map(&file)? };
    Ok(codec::parse(&map)?)
}

#[cfg(not(feature = "mmap"))]
fn load_tree(path: &Path) -> Result<GroupNode, Error> {
    let bytes = std::fs::read(path)?;
    Ok(codec::parse(&bytes)?)
}

// ---------------------------------------------------------------------------
// BlockFile
// ---------------------------------------------------------------------------

/// An open block-structured field file.
///
/// Field data lives under per-step groups named `Step#<n>`; a current
/// step must be selected with [`BlockFile::set_step`] before any field
/// operation. Layout definition and field I/O live in the block methods
/// of this type.
pub struct BlockFile {
    pub(crate) store: Store,
    path: Option<PathBuf>,
    mode: FileMode,
    pub(crate) comm: Box<dyn Communicator>,
    step: Option<u64>,
    pub(crate) block: BlockState,
    closed: bool,
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("step", &self.step)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn step_group_name(step: u64) -> String {
    format!("Step#{step}")
}

fn step_number(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("Step#")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl BlockFile {
    /// Create a fresh file at `path`, single rank.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        OpenOptions::new().mode(FileMode::Write).open(path)
    }

    /// Open an existing file at `path` for reading, single rank.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        OpenOptions::new().mode(FileMode::Read).open(path)
    }

    /// Open or create the file at `path` for extension, single rank.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        OpenOptions::new().mode(FileMode::Append).open(path)
    }

    /// Read a file image from container bytes, single rank.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let store = Store::default();
        store.set_root(codec::parse(bytes)?);
        OpenOptions::new().store(store).in_memory()
    }

    /// The mode the file was opened with.
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// The backing path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// This member's rank within the file's group.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Number of ranks sharing the file.
    pub fn nprocs(&self) -> usize {
        self.comm.size()
    }

    // -- time steps ---------------------------------------------------------

    /// Make `step` the current time step.
    ///
    /// In writable modes the step group is created if missing; collective.
    /// In read mode the step must already exist. Changing the step drops
    /// the cached field context, the layout stays.
    pub fn set_step(&mut self, step: u64) -> Result<(), Error> {
        let name = step_group_name(step);
        if self.mode.is_writable() {
            // Rank 0 creates, the barrier publishes. Every rank then
            // verifies, so a failure on rank 0 surfaces everywhere.
            let create_result = if self.comm.rank() == 0 {
                self.store.ensure_group(&name)
            } else {
                Ok(())
            };
            self.comm.barrier();
            create_result?;
            if !self.store.has_group(&name) {
                return Err(Error::StepNotFound(step));
            }
        } else if !self.store.has_group(&name) {
            return Err(Error::StepNotFound(step));
        }
        self.step = Some(step);
        self.block.field = None;
        Ok(())
    }

    /// The current time step, if one was selected.
    pub fn current_step(&self) -> Option<u64> {
        self.step
    }

    /// True if the file holds a group for `step`.
    pub fn has_step(&self, step: u64) -> bool {
        self.store.has_group(&step_group_name(step))
    }

    /// All step numbers present in the file, ascending.
    pub fn steps(&self) -> Vec<u64> {
        let names = self.store.group_names("/").unwrap_or_default();
        let mut steps: Vec<u64> = names.iter().filter_map(|n| step_number(n)).collect();
        steps.sort_unstable();
        steps
    }

    /// Number of time steps in the file.
    pub fn num_steps(&self) -> usize {
        self.steps().len()
    }

    /// The current step's group name, or [`Error::NoStep`].
    pub(crate) fn step_group(&self) -> Result<String, Error> {
        self.step.map(step_group_name).ok_or(Error::NoStep)
    }

    pub(crate) fn require_writable(&self) -> Result<(), Error> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    // -- persistence --------------------------------------------------------

    /// Serialize the current file image to container bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.store.with_root(codec::serialize)
    }

    /// Write the file image to its backing path if it changed. Collective;
    /// rank 0 performs the write after all ranks arrive, so every write
    /// issued before the call is part of the image.
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        self.comm.barrier();
        let result = self.flush_local();
        self.comm.barrier();
        result
    }

    /// Rank 0's half of [`BlockFile::flush`]: serialize and write, without
    /// the barriers. Also the drop path, where blocking on peers that may
    /// be gone is not an option.
    fn flush_local(&mut self) -> Result<(), Error> {
        if self.comm.rank() != 0 || !self.mode.is_writable() {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.store.is_dirty() {
            return Ok(());
        }
        let bytes = self.store.with_root(codec::serialize);
        std::fs::write(path, &bytes)?;
        self.store.clear_dirty();
        log::debug!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Flush and invalidate the handle. Collective in writable modes.
    pub fn close(mut self) -> Result<(), Error> {
        let result = self.flush();
        self.closed = true;
        result
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush_local() {
            log::warn!("flush on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("blockfield_file_{}_{name}", std::process::id()))
    }

    #[test]
    fn create_close_open_roundtrip() {
        let path = temp_path("roundtrip.bfd");
        let mut file = BlockFile::create(&path).unwrap();
        assert_eq!(file.mode(), FileMode::Write);
        file.set_step(0).unwrap();
        file.set_step(3).unwrap();
        file.close().unwrap();

        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.mode(), FileMode::Read);
        assert!(file.has_step(0));
        assert!(!file.has_step(1));
        assert_eq!(file.steps(), vec![0, 3]);
        assert_eq!(file.num_steps(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn open_missing_file_fails() {
        let err = BlockFile::open(temp_path("missing.bfd")).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected io error, got {other}"),
        }
    }

    #[test]
    fn set_step_in_read_mode_requires_presence() {
        let path = temp_path("read_steps.bfd");
        let mut file = BlockFile::create(&path).unwrap();
        file.set_step(2).unwrap();
        file.close().unwrap();

        let mut file = BlockFile::open(&path).unwrap();
        file.set_step(2).unwrap();
        assert_eq!(file.current_step(), Some(2));
        assert!(matches!(file.set_step(5), Err(Error::StepNotFound(5))));
        // The failed call leaves the current step alone.
        assert_eq!(file.current_step(), Some(2));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn append_extends_and_creates() {
        let path = temp_path("append.bfd");
        std::fs::remove_file(&path).ok();

        // Append on a missing path starts a fresh file.
        let mut file = BlockFile::append(&path).unwrap();
        file.set_step(0).unwrap();
        file.close().unwrap();

        let mut file = BlockFile::append(&path).unwrap();
        assert!(file.has_step(0));
        file.set_step(1).unwrap();
        file.close().unwrap();

        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.steps(), vec![0, 1]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_mode_discards_existing_content() {
        let path = temp_path("truncate.bfd");
        let mut file = BlockFile::create(&path).unwrap();
        file.set_step(7).unwrap();
        file.close().unwrap();

        let file = BlockFile::create(&path).unwrap();
        assert!(!file.has_step(7));
        file.close().unwrap();

        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.num_steps(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn steps_sort_numerically_not_lexically() {
        let mut file = OpenOptions::new().mode(FileMode::Write).in_memory().unwrap();
        for step in [10, 2, 1] {
            file.set_step(step).unwrap();
        }
        assert_eq!(file.steps(), vec![1, 2, 10]);
    }

    #[test]
    fn bytes_roundtrip_in_memory() {
        let mut file = OpenOptions::new().mode(FileMode::Write).in_memory().unwrap();
        file.set_step(4).unwrap();
        let bytes = file.to_bytes();

        let file = BlockFile::from_bytes(&bytes).unwrap();
        assert_eq!(file.steps(), vec![4]);
        assert!(file.path().is_none());
    }

    #[test]
    fn drop_without_close_still_persists() {
        let path = temp_path("dropped.bfd");
        {
            let mut file = BlockFile::create(&path).unwrap();
            file.set_step(0).unwrap();
        }
        let file = BlockFile::open(&path).unwrap();
        assert!(file.has_step(0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unchanged_file_is_not_rewritten() {
        let path = temp_path("clean.bfd");
        let mut file = BlockFile::create(&path).unwrap();
        file.set_step(0).unwrap();
        file.close().unwrap();

        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        let mut file = BlockFile::append(&path).unwrap();
        file.flush().unwrap();
        file.close().unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn multi_rank_group_requires_a_shared_store() {
        let mut comms = ThreadComm::split(2);
        let err = OpenOptions::new()
            .mode(FileMode::Write)
            .communicator(comms.pop().unwrap())
            .in_memory()
            .unwrap_err();
        assert!(matches!(err, Error::SharedStoreRequired));
    }

    #[test]
    fn step_names_parse_strictly() {
        assert_eq!(step_number("Step#0"), Some(0));
        assert_eq!(step_number("Step#42"), Some(42));
        assert_eq!(step_number("Step#"), None);
        assert_eq!(step_number("Step#+3"), None);
        assert_eq!(step_number("Step#3x"), None);
        assert_eq!(step_number("Block"), None);
    }
}
