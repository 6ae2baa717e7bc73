//! Layout definition and field I/O on an open [`BlockFile`].
//!
//! Every rank declares its own sub-box of the grid with
//! [`BlockFile::define_layout`]; the declarations are exchanged, overlaps
//! are dissolved and the resulting table drives all field I/O. A write
//! stores only the rank's ghost-free box, gathered out of its full
//! declared buffer; a read refills the full declared box, ghost regions
//! included.
//!
//! Field writes are collective: rank 0 creates the groups and datasets,
//! then every rank writes its own selection. As with MPI collectives, a
//! rank that fails a local precondition leaves the call early and its
//! peers block at the next exchange; keep arguments consistent across
//! ranks.

use blockfield_core::selection::copy_box;
use blockfield_core::{FieldSelection, GridBounds, Partition, PartitionTable};

use crate::error::{Error, StoreError};
use crate::file::BlockFile;
use crate::store::{checked_rank3, valid_name, AttrKind, AttrValue};

/// Name of the per-step group holding all block fields.
const BLOCK_GROUP: &str = "Block";
/// Conventional field attribute: grid coordinates of cell (0,0,0).
const ORIGIN_ATTR: &str = "__Origin__";
/// Conventional field attribute: grid cell width per axis.
const SPACING_ATTR: &str = "__Spacing__";

// ---------------------------------------------------------------------------
// Per-file block state
// ---------------------------------------------------------------------------

/// Layout table and cached selections of one open file.
///
/// The write selection depends only on the layout and is shared by all
/// fields; the read selection also depends on the stored extent of the
/// field being read, so it is cached per field name. A new layout drops
/// both, a step change drops the field context.
#[derive(Default)]
pub(crate) struct BlockState {
    pub(crate) table: Option<PartitionTable>,
    pub(crate) write_sel: Option<FieldSelection>,
    pub(crate) field: Option<FieldContext>,
}

pub(crate) struct FieldContext {
    name: String,
    sel: FieldSelection,
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// Shape summary of one stored field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Dimensions of the component datasets in storage order, k slowest.
    pub grid_dims: Vec<u64>,
    /// Number of numbered component datasets.
    pub components: usize,
}

impl FieldInfo {
    /// Rank of the component datasets, 3 for block fields.
    pub fn grid_rank(&self) -> usize {
        self.grid_dims.len()
    }
}

/// Type summary of one field attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrInfo {
    /// Attribute name.
    pub name: String,
    /// Element type.
    pub kind: AttrKind,
    /// Element count, 1 for scalars.
    pub elements: usize,
}

fn is_component_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn check_buffer(expected: usize, actual: usize) -> Result<(), Error> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::BufferSize { expected, actual })
    }
}

impl BlockFile {
    // -- layout -------------------------------------------------------------

    /// Declare this rank's partition of the grid and resolve the shared
    /// layout. Collective; every rank must call with its own box.
    ///
    /// Bounds may be declared in reverse order per axis and are swapped.
    /// The call replaces any previous layout wholesale and drops every
    /// cached selection, even when resolution then fails. Resolution fails
    /// when a declared box contains another on all three axes.
    pub fn define_layout(&mut self, declared: Partition) -> Result<(), Error> {
        self.block.table = None;
        self.block.write_sel = None;
        self.block.field = None;
        let gathered = self.comm.gather_partitions(declared.normalized())?;
        log::debug!(
            "rank {}/{} declared {}, resolving {} partitions",
            self.comm.rank(),
            self.comm.size(),
            declared,
            gathered.len()
        );
        self.block.table = Some(PartitionTable::resolve(gathered)?);
        Ok(())
    }

    /// The box `rank` declared, as normalized.
    pub fn partition_of_rank(&self, rank: usize) -> Result<Partition, Error> {
        let table = self.table()?;
        table
            .user_partition(rank)
            .copied()
            .ok_or(Error::InvalidRank {
                rank,
                nprocs: table.nprocs(),
            })
    }

    /// The ghost-free box `rank` writes, after dissolution.
    pub fn reduced_partition_of_rank(&self, rank: usize) -> Result<Partition, Error> {
        let table = self.table()?;
        table
            .write_partition(rank)
            .copied()
            .ok_or(Error::InvalidRank {
                rank,
                nprocs: table.nprocs(),
            })
    }

    /// The rank whose write box contains the cell, or `None` when the cell
    /// fell into a gap opened by dissolution.
    pub fn rank_owning(&self, i: i64, j: i64, k: i64) -> Result<Option<usize>, Error> {
        Ok(self.table()?.owner_of(i, j, k))
    }

    /// Global grid extent, the per-axis maximum over all declared boxes.
    pub fn bounds(&self) -> Result<GridBounds, Error> {
        Ok(self.table()?.bounds())
    }

    fn table(&self) -> Result<&PartitionTable, Error> {
        self.block.table.as_ref().ok_or(Error::NoLayout)
    }

    // -- field I/O ----------------------------------------------------------

    /// Write a scalar field under the current step. Collective; creates
    /// the field, so the name must not exist at this step yet.
    ///
    /// `data` holds the rank's full declared box in row-major `(k,j,i)`
    /// order, i fastest. Only the ghost-free sub-box is stored.
    pub fn write_scalar_field(&mut self, name: &str, data: &[f64]) -> Result<(), Error> {
        self.require_writable()?;
        self.step_group()?;
        let sel = self.selection_for_writing()?;
        check_buffer(sel.buffer_len(), data.len())?;
        let path = self.create_field_entry(name, 1, sel.disk_dims)?;
        self.write_component(&format!("{path}/0"), &sel, data)?;
        self.comm.barrier();
        Ok(())
    }

    /// Read a scalar field into the rank's full declared box, ghost
    /// regions included.
    pub fn read_scalar_field(&mut self, name: &str, data: &mut [f64]) -> Result<(), Error> {
        self.step_group()?;
        self.table()?;
        let path = self.open_field_group(name)?;
        let dset = format!("{path}/0");
        let sel = self.selection_for_reading(name, &dset)?;
        check_buffer(sel.buffer_len(), data.len())?;
        self.read_component(&dset, &sel, data)
    }

    /// Write a three-component vector field, components stored as the
    /// datasets "0", "1" and "2". Collective, like the scalar write.
    pub fn write_vector3d_field(
        &mut self,
        name: &str,
        x: &[f64],
        y: &[f64],
        z: &[f64],
    ) -> Result<(), Error> {
        self.require_writable()?;
        self.step_group()?;
        let sel = self.selection_for_writing()?;
        for buf in [x, y, z] {
            check_buffer(sel.buffer_len(), buf.len())?;
        }
        let path = self.create_field_entry(name, 3, sel.disk_dims)?;
        for (c, buf) in [x, y, z].into_iter().enumerate() {
            self.write_component(&format!("{path}/{c}"), &sel, buf)?;
        }
        self.comm.barrier();
        Ok(())
    }

    /// Read a three-component vector field into the rank's declared box.
    pub fn read_vector3d_field(
        &mut self,
        name: &str,
        x: &mut [f64],
        y: &mut [f64],
        z: &mut [f64],
    ) -> Result<(), Error> {
        self.step_group()?;
        self.table()?;
        let path = self.open_field_group(name)?;
        for (c, buf) in [x, y, z].into_iter().enumerate() {
            let dset = format!("{path}/{c}");
            let sel = self.selection_for_reading(name, &dset)?;
            check_buffer(sel.buffer_len(), buf.len())?;
            self.read_component(&dset, &sel, buf)?;
        }
        Ok(())
    }

    // -- field enumeration --------------------------------------------------

    /// Names of the fields stored under the current step, in name order.
    /// Empty when the step has no fields yet.
    pub fn field_names(&self) -> Result<Vec<String>, Error> {
        let block = format!("{}/{BLOCK_GROUP}", self.step_group()?);
        if !self.store.has_group(&block) {
            return Ok(Vec::new());
        }
        Ok(self.store.group_names(&block)?)
    }

    /// Number of fields stored under the current step.
    pub fn num_fields(&self) -> Result<usize, Error> {
        Ok(self.field_names()?.len())
    }

    /// Name, stored dimensions and component count of the `index`-th field
    /// in name order.
    pub fn field_info(&self, index: usize) -> Result<FieldInfo, Error> {
        let names = self.field_names()?;
        let name = names.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: names.len(),
        })?;
        let path = self.field_path(name)?;
        let numbered: Vec<String> = self
            .store
            .dataset_names(&path)?
            .into_iter()
            .filter(|n| is_component_name(n))
            .collect();
        let grid_dims = match numbered.first() {
            Some(first) => self.store.dataset_dims(&format!("{path}/{first}"))?,
            None => Vec::new(),
        };
        Ok(FieldInfo {
            name: name.clone(),
            grid_dims,
            components: numbered.len(),
        })
    }

    // -- field attributes ---------------------------------------------------

    /// Set a named attribute on an existing field. Collective; every rank
    /// must pass the same value.
    pub fn write_field_attr(
        &mut self,
        field: &str,
        name: &str,
        value: AttrValue,
    ) -> Result<(), Error> {
        self.require_writable()?;
        let path = self.open_field_group(field)?;
        self.store.set_attr(&path, name, value)?;
        self.comm.barrier();
        Ok(())
    }

    /// Read a named attribute of a field.
    pub fn read_field_attr(&self, field: &str, name: &str) -> Result<AttrValue, Error> {
        let path = self.open_field_group(field)?;
        self.store
            .attr(&path, name)?
            .ok_or_else(|| Error::AttributeNotFound {
                field: field.to_string(),
                name: name.to_string(),
            })
    }

    /// Attribute names of a field, in name order.
    pub fn field_attr_names(&self, field: &str) -> Result<Vec<String>, Error> {
        let path = self.open_field_group(field)?;
        Ok(self.store.attr_names(&path)?)
    }

    /// Number of attributes on a field.
    pub fn num_field_attrs(&self, field: &str) -> Result<usize, Error> {
        Ok(self.field_attr_names(field)?.len())
    }

    /// Name, element type and element count of the `index`-th attribute of
    /// a field, in name order.
    pub fn field_attr_info(&self, field: &str, index: usize) -> Result<AttrInfo, Error> {
        let names = self.field_attr_names(field)?;
        let name = names.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: names.len(),
        })?;
        let value = self.read_field_attr(field, name)?;
        Ok(AttrInfo {
            name: name.clone(),
            kind: value.kind(),
            elements: value.num_elements(),
        })
    }

    /// Set the conventional `__Origin__` triplet of a field.
    pub fn set_field_origin(&mut self, field: &str, origin: [f64; 3]) -> Result<(), Error> {
        self.write_field_attr(field, ORIGIN_ATTR, AttrValue::F64Array(origin.to_vec()))
    }

    /// The `__Origin__` triplet of a field.
    pub fn field_origin(&self, field: &str) -> Result<[f64; 3], Error> {
        self.triplet_attr(field, ORIGIN_ATTR)
    }

    /// Set the conventional `__Spacing__` triplet of a field.
    pub fn set_field_spacing(&mut self, field: &str, spacing: [f64; 3]) -> Result<(), Error> {
        self.write_field_attr(field, SPACING_ATTR, AttrValue::F64Array(spacing.to_vec()))
    }

    /// The `__Spacing__` triplet of a field.
    pub fn field_spacing(&self, field: &str) -> Result<[f64; 3], Error> {
        self.triplet_attr(field, SPACING_ATTR)
    }

    fn triplet_attr(&self, field: &str, name: &'static str) -> Result<[f64; 3], Error> {
        match self.read_field_attr(field, name)? {
            AttrValue::F64Array(v) if v.len() == 3 => Ok([v[0], v[1], v[2]]),
            _ => Err(Error::AttributeType {
                name: name.to_string(),
                expected: "3-element f64 array",
            }),
        }
    }

    // -- selections ---------------------------------------------------------

    fn selection_for_writing(&mut self) -> Result<FieldSelection, Error> {
        if let Some(sel) = self.block.write_sel {
            return Ok(sel);
        }
        let rank = self.comm.rank();
        let sel = {
            let table = self.block.table.as_ref().ok_or(Error::NoLayout)?;
            let user = table
                .user_partition(rank)
                .ok_or(Error::InvalidRank {
                    rank,
                    nprocs: table.nprocs(),
                })?;
            let write = table
                .write_partition(rank)
                .ok_or(Error::InvalidRank {
                    rank,
                    nprocs: table.nprocs(),
                })?;
            FieldSelection::for_writing(user, write, table.bounds())?
        };
        self.block.write_sel = Some(sel);
        Ok(sel)
    }

    fn selection_for_reading(&mut self, name: &str, dset: &str) -> Result<FieldSelection, Error> {
        if let Some(ctx) = &self.block.field {
            if ctx.name == name {
                return Ok(ctx.sel);
            }
        }
        let rank = self.comm.rank();
        let (user, bounds) = {
            let table = self.block.table.as_ref().ok_or(Error::NoLayout)?;
            let user = table
                .user_partition(rank)
                .copied()
                .ok_or(Error::InvalidRank {
                    rank,
                    nprocs: table.nprocs(),
                })?;
            (user, table.bounds())
        };
        let stored = checked_rank3(dset, &self.store.dataset_dims(dset)?)?;
        let sel = FieldSelection::for_reading(&user, bounds, stored)?;
        self.block.field = Some(FieldContext {
            name: name.to_string(),
            sel,
        });
        Ok(sel)
    }

    // -- group plumbing -----------------------------------------------------

    fn field_path(&self, name: &str) -> Result<String, Error> {
        Ok(format!("{}/{BLOCK_GROUP}/{name}", self.step_group()?))
    }

    /// Path of an existing field group at the current step.
    fn open_field_group(&self, name: &str) -> Result<String, Error> {
        let path = self.field_path(name)?;
        if !self.store.has_group(&path) {
            return Err(Error::FieldNotFound(name.to_string()));
        }
        Ok(path)
    }

    /// Collective creation of a field group and its component datasets.
    /// Rank 0 mutates the tree between the barriers; every rank checks
    /// before and verifies after, so outcomes agree everywhere.
    fn create_field_entry(
        &mut self,
        name: &str,
        components: usize,
        disk_dims: [u64; 3],
    ) -> Result<String, Error> {
        if !valid_name(name) {
            return Err(StoreError::InvalidName(name.to_string()).into());
        }
        let block = format!("{}/{BLOCK_GROUP}", self.step_group()?);
        let path = format!("{block}/{name}");
        if self.store.has_group(&path) {
            return Err(Error::FieldExists(name.to_string()));
        }
        self.comm.barrier();
        let created = if self.comm.rank() == 0 {
            self.create_field_nodes(&block, &path, components, disk_dims)
        } else {
            Ok(())
        };
        self.comm.barrier();
        created?;
        if !self.store.has_dataset(&format!("{path}/{}", components - 1)) {
            return Err(StoreError::NotFound(path).into());
        }
        log::debug!(
            "created field {path} with {components} component(s), dims {disk_dims:?}"
        );
        Ok(path)
    }

    fn create_field_nodes(
        &self,
        block: &str,
        path: &str,
        components: usize,
        disk_dims: [u64; 3],
    ) -> Result<(), StoreError> {
        self.store.ensure_group(block)?;
        self.store.create_group(path)?;
        for c in 0..components {
            self.store
                .create_dataset(&format!("{path}/{c}"), &disk_dims)?;
        }
        Ok(())
    }

    /// Gather the memory selection out of the rank's declared buffer and
    /// scatter it into the dataset's disk selection.
    fn write_component(&self, dset: &str, sel: &FieldSelection, data: &[f64]) -> Result<(), Error> {
        let mut staged = vec![0.0; sel.disk.num_elements() as usize];
        copy_box(
            data,
            sel.mem_dims,
            sel.mem.start,
            &mut staged,
            sel.mem.count,
            [0; 3],
            sel.mem.count,
        );
        self.store
            .write_selection(dset, sel.disk.start, sel.disk.count, &staged)?;
        Ok(())
    }

    /// Fill the rank's declared buffer from the dataset's disk selection.
    /// The read memory selection is the whole buffer.
    fn read_component(&self, dset: &str, sel: &FieldSelection, out: &mut [f64]) -> Result<(), Error> {
        let data = self
            .store
            .read_selection(dset, sel.disk.start, sel.disk.count)?;
        out.copy_from_slice(&data);
        Ok(())
    }
}
