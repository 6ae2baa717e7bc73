//! The container collaborator: a shared tree of named groups, typed
//! attributes and dense f64 datasets with hyperslab I/O.
//!
//! A [`Store`] is cheaply cloneable and internally synchronized; every rank
//! of an emulated multi-process deployment holds a clone of the same store,
//! the way every process of a real deployment holds the same file. Paths
//! are `/`-separated, the empty path is the root group.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use blockfield_core::selection::{copy_box, Hyperslab};

use crate::error::StoreError;

#[cfg(feature = "parallel")]
const PARALLEL_MIN_ELEMENTS: usize = 1 << 16;

/// A typed attribute value on a group.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Scalar 64-bit float.
    F64(f64),
    /// Scalar 64-bit signed integer.
    I64(i64),
    /// UTF-8 string.
    String(String),
    /// Array of 64-bit floats.
    F64Array(Vec<f64>),
    /// Array of 64-bit signed integers.
    I64Array(Vec<i64>),
}

/// The element type of an attribute, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    /// 64-bit float elements.
    F64,
    /// 64-bit signed integer elements.
    I64,
    /// A string.
    String,
}

impl std::fmt::Display for AttrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrKind::F64 => write!(f, "f64"),
            AttrKind::I64 => write!(f, "i64"),
            AttrKind::String => write!(f, "string"),
        }
    }
}

impl AttrValue {
    /// Element type of the value.
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::F64(_) | AttrValue::F64Array(_) => AttrKind::F64,
            AttrValue::I64(_) | AttrValue::I64Array(_) => AttrKind::I64,
            AttrValue::String(_) => AttrKind::String,
        }
    }

    /// Number of elements: 1 for scalars, the array length for arrays, the
    /// byte length for strings.
    pub fn num_elements(&self) -> usize {
        match self {
            AttrValue::F64(_) | AttrValue::I64(_) => 1,
            AttrValue::String(s) => s.len(),
            AttrValue::F64Array(v) => v.len(),
            AttrValue::I64Array(v) => v.len(),
        }
    }
}

/// True for names the tree accepts: non-empty, no path separator.
pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

// ---------------------------------------------------------------------------
// Tree nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Group(GroupNode),
    Dataset(DatasetNode),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct GroupNode {
    pub(crate) children: BTreeMap<String, Node>,
    pub(crate) attrs: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DatasetNode {
    pub(crate) dims: Vec<u64>,
    pub(crate) data: Vec<f64>,
}

impl GroupNode {
    fn resolve(&self, path: &str) -> Option<&Node> {
        let mut segments = segments(path);
        let first = segments.next()?;
        let mut node = self.children.get(first)?;
        for seg in segments {
            match node {
                Node::Group(g) => node = g.children.get(seg)?,
                Node::Dataset(_) => return None,
            }
        }
        Some(node)
    }

    fn resolve_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut segments = segments(path);
        let first = segments.next()?;
        let mut node = self.children.get_mut(first)?;
        for seg in segments {
            match node {
                Node::Group(g) => node = g.children.get_mut(seg)?,
                Node::Dataset(_) => return None,
            }
        }
        Some(node)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn is_root(path: &str) -> bool {
    segments(path).next().is_none()
}

/// Split a path into its parent and final segment.
fn split_parent(path: &str) -> Result<(&str, &str), StoreError> {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if valid_name(name) => Ok((parent, name)),
        None if valid_name(trimmed) => Ok(("", trimmed)),
        _ => Err(StoreError::InvalidName(path.to_string())),
    }
}

struct Inner {
    root: GroupNode,
    dirty: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Shared handle to one container tree.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    /// Create an empty container.
    pub fn new() -> Store {
        Store::from_root(GroupNode::default())
    }

    pub(crate) fn from_root(root: GroupNode) -> Store {
        Store {
            inner: Arc::new(RwLock::new(Inner { root, dirty: false })),
        }
    }

    // A poisoned lock still holds a structurally valid tree; recover the
    // data rather than propagating the panic.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// True if the tree changed since the last [`Store::clear_dirty`].
    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub(crate) fn clear_dirty(&self) {
        self.write().dirty = false;
    }

    pub(crate) fn with_root<R>(&self, f: impl FnOnce(&GroupNode) -> R) -> R {
        f(&self.read().root)
    }

    /// Replace the whole tree, e.g. with one parsed from disk. The store
    /// starts out clean afterwards.
    pub(crate) fn set_root(&self, root: GroupNode) {
        let mut inner = self.write();
        inner.root = root;
        inner.dirty = false;
    }

    // -- groups -------------------------------------------------------------

    /// Create a group under an existing parent group.
    pub fn create_group(&self, path: &str) -> Result<(), StoreError> {
        let (parent, name) = split_parent(path)?;
        let mut inner = self.write();
        let group = group_mut(&mut inner.root, parent, path)?;
        if group.children.contains_key(name) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        group
            .children
            .insert(name.to_string(), Node::Group(GroupNode::default()));
        inner.dirty = true;
        Ok(())
    }

    /// Create a group unless a group already exists at the path.
    pub fn ensure_group(&self, path: &str) -> Result<(), StoreError> {
        match self.create_group(path) {
            Err(StoreError::AlreadyExists(_)) if self.has_group(path) => Ok(()),
            other => other,
        }
    }

    /// True if a group exists at the path.
    pub fn has_group(&self, path: &str) -> bool {
        if is_root(path) {
            return true;
        }
        matches!(self.read().root.resolve(path), Some(Node::Group(_)))
    }

    /// True if a dataset exists at the path.
    pub fn has_dataset(&self, path: &str) -> bool {
        matches!(self.read().root.resolve(path), Some(Node::Dataset(_)))
    }

    /// True if any node exists at the path.
    pub fn has_node(&self, path: &str) -> bool {
        is_root(path) || self.read().root.resolve(path).is_some()
    }

    /// Names of the group children of a group, in name order.
    pub fn group_names(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        let group = group_ref(&inner.root, path)?;
        Ok(group
            .children
            .iter()
            .filter(|(_, node)| matches!(node, Node::Group(_)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Names of the dataset children of a group, in name order.
    pub fn dataset_names(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        let group = group_ref(&inner.root, path)?;
        Ok(group
            .children
            .iter()
            .filter(|(_, node)| matches!(node, Node::Dataset(_)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Remove a node (and, for a group, everything under it).
    pub fn remove(&self, path: &str) -> Result<(), StoreError> {
        let (parent, name) = split_parent(path)?;
        let mut inner = self.write();
        let group = group_mut(&mut inner.root, parent, path)?;
        if group.children.remove(name).is_none() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        inner.dirty = true;
        Ok(())
    }

    // -- datasets -----------------------------------------------------------

    /// Create a zero-filled dataset under an existing parent group.
    pub fn create_dataset(&self, path: &str, dims: &[u64]) -> Result<(), StoreError> {
        let (parent, name) = split_parent(path)?;
        let mut inner = self.write();
        let group = group_mut(&mut inner.root, parent, path)?;
        if group.children.contains_key(name) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        let len = dims.iter().product::<u64>() as usize;
        group.children.insert(
            name.to_string(),
            Node::Dataset(DatasetNode {
                dims: dims.to_vec(),
                data: vec![0.0; len],
            }),
        );
        inner.dirty = true;
        Ok(())
    }

    /// Create a dataset, or verify that the existing one has the same dims.
    pub fn ensure_dataset(&self, path: &str, dims: &[u64]) -> Result<(), StoreError> {
        match self.create_dataset(path, dims) {
            Err(StoreError::AlreadyExists(_)) => {
                let stored = self.dataset_dims(path)?;
                if stored != dims {
                    return Err(StoreError::DimsMismatch {
                        path: path.to_string(),
                        requested: dims.to_vec(),
                        stored,
                    });
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Dimensions of a dataset, slowest axis first.
    pub fn dataset_dims(&self, path: &str) -> Result<Vec<u64>, StoreError> {
        let inner = self.read();
        match inner.root.resolve(path) {
            Some(Node::Dataset(ds)) => Ok(ds.dims.clone()),
            Some(Node::Group(_)) => Err(StoreError::NotADataset(path.to_string())),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    /// Scatter `data` into the sub-box of a rank-3 dataset.
    pub fn write_selection(
        &self,
        path: &str,
        start: [u64; 3],
        count: [u64; 3],
        data: &[f64],
    ) -> Result<(), StoreError> {
        let slab = Hyperslab { start, count };
        let expected = slab.num_elements() as usize;
        if data.len() != expected {
            return Err(StoreError::DataSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let mut inner = self.write();
        let ds = dataset_mut(&mut inner.root, path)?;
        let dims = checked_rank3(path, &ds.dims)?;
        if !slab.fits_within(dims) {
            return Err(StoreError::SelectionOutOfBounds {
                path: path.to_string(),
                start,
                count,
                dims,
            });
        }
        copy_box(data, count, [0; 3], &mut ds.data, dims, start, count);
        inner.dirty = true;
        Ok(())
    }

    /// Gather the sub-box of a rank-3 dataset into a contiguous buffer.
    pub fn read_selection(
        &self,
        path: &str,
        start: [u64; 3],
        count: [u64; 3],
    ) -> Result<Vec<f64>, StoreError> {
        let inner = self.read();
        let ds = match inner.root.resolve(path) {
            Some(Node::Dataset(ds)) => ds,
            Some(Node::Group(_)) => return Err(StoreError::NotADataset(path.to_string())),
            None => return Err(StoreError::NotFound(path.to_string())),
        };
        let dims = checked_rank3(path, &ds.dims)?;
        let slab = Hyperslab { start, count };
        if !slab.fits_within(dims) {
            return Err(StoreError::SelectionOutOfBounds {
                path: path.to_string(),
                start,
                count,
                dims,
            });
        }
        let total = slab.num_elements() as usize;
        let mut out = vec![0.0; total];

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            let plane = (count[1] * count[2]) as usize;
            if total >= PARALLEL_MIN_ELEMENTS && plane > 0 {
                out.par_chunks_mut(plane).enumerate().for_each(|(k, chunk)| {
                    copy_box(
                        &ds.data,
                        dims,
                        [start[0] + k as u64, start[1], start[2]],
                        chunk,
                        [1, count[1], count[2]],
                        [0; 3],
                        [1, count[1], count[2]],
                    );
                });
                return Ok(out);
            }
        }

        copy_box(&ds.data, dims, start, &mut out, count, [0; 3], count);
        Ok(out)
    }

    // -- attributes ---------------------------------------------------------

    /// Set an attribute on a group, replacing any previous value.
    pub fn set_attr(&self, path: &str, name: &str, value: AttrValue) -> Result<(), StoreError> {
        if !valid_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let mut inner = self.write();
        let group = group_mut(&mut inner.root, path, path)?;
        group.attrs.insert(name.to_string(), value);
        inner.dirty = true;
        Ok(())
    }

    /// Read an attribute of a group; `None` when the group has no attribute
    /// of that name.
    pub fn attr(&self, path: &str, name: &str) -> Result<Option<AttrValue>, StoreError> {
        let inner = self.read();
        let group = group_ref(&inner.root, path)?;
        Ok(group.attrs.get(name).cloned())
    }

    /// Attribute names of a group, in name order.
    pub fn attr_names(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        let group = group_ref(&inner.root, path)?;
        Ok(group.attrs.keys().cloned().collect())
    }
}

pub(crate) fn checked_rank3(path: &str, dims: &[u64]) -> Result<[u64; 3], StoreError> {
    match dims {
        [a, b, c] => Ok([*a, *b, *c]),
        _ => Err(StoreError::DatasetRank {
            path: path.to_string(),
            rank: dims.len(),
        }),
    }
}

fn group_ref<'a>(root: &'a GroupNode, path: &str) -> Result<&'a GroupNode, StoreError> {
    if is_root(path) {
        return Ok(root);
    }
    match root.resolve(path) {
        Some(Node::Group(g)) => Ok(g),
        Some(Node::Dataset(_)) => Err(StoreError::NotAGroup(path.to_string())),
        None => Err(StoreError::NotFound(path.to_string())),
    }
}

/// Resolve a parent group for mutation. `full` is the path reported in
/// errors, which may name a child of `path`.
fn group_mut<'a>(
    root: &'a mut GroupNode,
    path: &str,
    full: &str,
) -> Result<&'a mut GroupNode, StoreError> {
    if is_root(path) {
        return Ok(root);
    }
    // Probe immutably first so error cases do not fight the borrow.
    match root.resolve(path) {
        Some(Node::Group(_)) => {}
        Some(Node::Dataset(_)) => return Err(StoreError::NotAGroup(path.to_string())),
        None => return Err(StoreError::NotFound(full.to_string())),
    }
    match root.resolve_mut(path) {
        Some(Node::Group(g)) => Ok(g),
        _ => unreachable!("probed as group above"),
    }
}

fn dataset_mut<'a>(root: &'a mut GroupNode, path: &str) -> Result<&'a mut DatasetNode, StoreError> {
    match root.resolve(path) {
        Some(Node::Dataset(_)) => {}
        Some(Node::Group(_)) => return Err(StoreError::NotAGroup(path.to_string())),
        None => return Err(StoreError::NotFound(path.to_string())),
    }
    match root.resolve_mut(path) {
        Some(Node::Dataset(ds)) => Ok(ds),
        _ => unreachable!("probed as dataset above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_enumerate_groups() {
        let store = Store::new();
        store.create_group("Step#0").unwrap();
        store.create_group("Step#0/Block").unwrap();
        store.create_group("Step#0/Block/density").unwrap();
        store.create_group("Step#1").unwrap();

        assert!(store.has_group("Step#0/Block"));
        assert!(!store.has_group("Step#0/Particles"));
        assert_eq!(store.group_names("").unwrap(), vec!["Step#0", "Step#1"]);
        assert_eq!(store.group_names("Step#0/Block").unwrap(), vec!["density"]);
    }

    #[test]
    fn create_group_requires_parent() {
        let store = Store::new();
        let err = store.create_group("missing/child").unwrap_err();
        assert_eq!(err, StoreError::NotFound("missing/child".to_string()));
    }

    #[test]
    fn create_group_rejects_duplicates_but_ensure_accepts_them() {
        let store = Store::new();
        store.create_group("Block").unwrap();
        assert_eq!(
            store.create_group("Block").unwrap_err(),
            StoreError::AlreadyExists("Block".to_string())
        );
        store.ensure_group("Block").unwrap();
    }

    #[test]
    fn ensure_group_refuses_a_dataset_in_the_way() {
        let store = Store::new();
        store.create_dataset("d", &[2, 2, 2]).unwrap();
        assert_eq!(
            store.ensure_group("d").unwrap_err(),
            StoreError::AlreadyExists("d".to_string())
        );
    }

    #[test]
    fn invalid_names_are_rejected() {
        let store = Store::new();
        assert!(matches!(store.create_group(""), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.create_group("//"), Err(StoreError::InvalidName(_))));
        assert!(matches!(
            store.set_attr("", "a/b", AttrValue::I64(1)),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn dataset_roundtrip_through_selections() {
        let store = Store::new();
        store.create_dataset("field", &[4, 4, 4]).unwrap();

        let payload: Vec<f64> = (0..8).map(|v| v as f64 + 0.5).collect();
        store.write_selection("field", [1, 1, 1], [2, 2, 2], &payload).unwrap();

        let back = store.read_selection("field", [1, 1, 1], [2, 2, 2]).unwrap();
        assert_eq!(back, payload);

        // Cells outside the selection stay zero.
        let corner = store.read_selection("field", [0, 0, 0], [1, 1, 1]).unwrap();
        assert_eq!(corner, vec![0.0]);
    }

    #[test]
    fn ensure_dataset_checks_dims() {
        let store = Store::new();
        store.ensure_dataset("d", &[2, 3, 4]).unwrap();
        store.ensure_dataset("d", &[2, 3, 4]).unwrap();
        assert_eq!(
            store.ensure_dataset("d", &[2, 3, 5]).unwrap_err(),
            StoreError::DimsMismatch {
                path: "d".to_string(),
                requested: vec![2, 3, 5],
                stored: vec![2, 3, 4],
            }
        );
    }

    #[test]
    fn selection_errors_are_reported() {
        let store = Store::new();
        store.create_dataset("d", &[2, 2, 2]).unwrap();

        assert!(matches!(
            store.write_selection("d", [0, 0, 0], [2, 2, 2], &[0.0; 7]),
            Err(StoreError::DataSizeMismatch { expected: 8, actual: 7 })
        ));
        assert!(matches!(
            store.write_selection("d", [1, 0, 0], [2, 2, 2], &[0.0; 8]),
            Err(StoreError::SelectionOutOfBounds { .. })
        ));
        assert!(matches!(
            store.read_selection("missing", [0, 0, 0], [1, 1, 1]),
            Err(StoreError::NotFound(_))
        ));

        store.create_dataset("flat", &[4]).unwrap();
        assert!(matches!(
            store.read_selection("flat", [0, 0, 0], [1, 1, 1]),
            Err(StoreError::DatasetRank { rank: 1, .. })
        ));
    }

    #[test]
    fn attributes_are_typed_and_name_ordered() {
        let store = Store::new();
        store.create_group("g").unwrap();
        store.set_attr("g", "b_units", AttrValue::String("T".to_string())).unwrap();
        store
            .set_attr("g", "a_origin", AttrValue::F64Array(vec![0.0, 1.0, 2.0]))
            .unwrap();

        assert_eq!(store.attr_names("g").unwrap(), vec!["a_origin", "b_units"]);
        assert_eq!(
            store.attr("g", "a_origin").unwrap(),
            Some(AttrValue::F64Array(vec![0.0, 1.0, 2.0]))
        );
        assert_eq!(store.attr("g", "nope").unwrap(), None);

        let v = store.attr("g", "a_origin").unwrap().unwrap();
        assert_eq!(v.kind(), AttrKind::F64);
        assert_eq!(v.num_elements(), 3);
    }

    #[test]
    fn remove_deletes_subtrees() {
        let store = Store::new();
        store.create_group("g").unwrap();
        store.create_dataset("g/d", &[1, 1, 1]).unwrap();
        store.remove("g").unwrap();
        assert!(!store.has_node("g"));
        assert_eq!(store.remove("g").unwrap_err(), StoreError::NotFound("g".to_string()));
    }

    #[test]
    fn clones_share_the_tree() {
        let a = Store::new();
        let b = a.clone();
        a.create_group("shared").unwrap();
        assert!(b.has_group("shared"));
    }

    #[test]
    fn dirty_tracks_mutations() {
        let store = Store::new();
        assert!(!store.is_dirty());
        store.create_group("g").unwrap();
        assert!(store.is_dirty());
        store.clear_dirty();
        assert!(!store.is_dirty());
        let _ = store.group_names("");
        assert!(!store.is_dirty());
    }
}
