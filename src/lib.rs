//! Reader/writer for Jet-format single-file relational database containers.
//!
//! A container is a paged binary file: page 0 is the header, every other
//! page carries a one-byte type tag. The catalog bootstraps from a system
//! object table at a well-known page, table rows live on DATA pages behind
//! a row-offset table, and indexes are persistent B-trees of
//! order-preserving key bytes. There is no SQL runtime: callers open a
//! file, enumerate tables and mutate rows directly through cursors, and
//! the library preserves the on-disk format so the file remains usable by
//! the originating application.
//!
//! Example:
//! ```
//! use jetbase::{ColumnSpec, Database, DataType, IndexSpec, MemFile, TableSpec, Value, Version};
//!
//! let db = Database::create(MemFile::new(), Version::V2010).unwrap();
//! let mut spec = TableSpec::new("People");
//! let mut id = ColumnSpec::new("Id", DataType::Long);
//! id.auto_number = true;
//! spec.columns.push(id);
//! spec.columns.push(ColumnSpec::new("Name", DataType::Text));
//! spec.indexes.push(IndexSpec::primary("PrimaryKey", &["Id"]));
//! let people = db.create_table(&spec).unwrap();
//! let mut row = people.row();
//! row[1] = Value::text("ada");
//! people.insert_row(&mut row).unwrap();
//! assert_eq!(people.row_count(), 1);
//! ```
//!
//! General design:
//!
//! PageChannel buffers page writes inside a write barrier and makes them
//! visible atomically. UsageMap tracks allocated page sets in an inline or
//! reference encoding. Table assembles rows ( fixed region, variable
//! region, offset table, null bitmap ) and keeps its indexes in step.
//! IndexData holds the B-tree; cursors re-validate their position against
//! the live pages on every step. The catalog, relationships and
//! complex-value groups are ordinary rows in system tables.

pub(crate) use rustc_hash::FxHashMap;
pub(crate) use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
    sync::Arc,
};

/// Utility functions.
pub mod util;

/// Error kinds and the crate Result.
pub mod error;

/// Backing storage for the container file.
pub mod stg;

/// Version descriptor and file header.
pub mod format;

/// Typed page access with a write barrier.
pub mod channel;

/// Allocated-page sets.
pub mod usage;

/// Data types and host values.
pub mod value;

/// Column-value and index-key codec.
pub mod codec;

/// Persistent B-tree indexes.
pub mod index;

/// Tables: row layout, insert / update / delete.
pub mod table;

/// Cursors over tables.
pub mod cursor;

/// Property maps.
pub mod props;

/// System catalog.
pub mod sys;

/// Relationships and cascades.
pub mod relation;

/// Complex-value columns ( attachments, multi-values, version history ).
pub mod complex;

/// Evaluator hook interfaces.
pub mod eval;

#[cfg(test)]
mod test;

pub use crate::{
    channel::{PageChannel, PageCodec, PlainCodec},
    complex::{Attachment, ComplexColumnInfo, ComplexKind, ValueVersion},
    cursor::{CaseInsensitiveColumnMatcher, ColumnMatcher, Cursor, CursorState, Savepoint, SimpleColumnMatcher},
    error::{Error, Result},
    eval::{EvalConfig, EvalFunction, ExprEvaluator, NumericConfig, TemporalConfig},
    format::{expect_page, FileFormat, Header, PageType, Version, DATA_HDR},
    index::{
        ForeignKeyRef, IndexColumn, IndexCursor, IndexData, IndexDataPtr, IndexPos,
        IndexSavepoint, LogicalIndex,
    },
    props::{PropertyMap, PropertySet, PropertyValue},
    relation::{
        Relationship, RelationshipSpec, REL_CASCADE_DELETES, REL_CASCADE_NULL,
        REL_CASCADE_UPDATES, REL_LEFT_OUTER, REL_NO_INTEGRITY, REL_ONE_TO_ONE, REL_RIGHT_OUTER,
    },
    stg::{MemFile, SimpleFileStorage, Storage},
    sys::{FileLinkResolver, LinkResolver},
    table::{ColInfo, Column, ColumnSpec, IndexSpec, Table, TablePtr, TableSpec},
    usage::{AllocMode, MapOwner, UsageMap},
    value::{DataType, Decimal, Value},
};

/// `Arc<Vec<u8>>`
pub type Data = Arc<Vec<u8>>;

/// `Rc<Database>`
pub type DB = Rc<Database>;

/// Identity of a live or tombstoned row: page number and slot index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RowId {
    ///
    pub page: u32,
    ///
    pub slot: u16,
}

impl RowId {
    /// The all-zero row id, used as a chain terminator and seek floor.
    pub const ZERO: RowId = RowId { page: 0, slot: 0 };

    ///
    pub fn new(page: u32, slot: u16) -> RowId {
        RowId { page, slot }
    }

    /// Big-endian 6-byte form, ordered like ( page, slot ).
    pub fn to_be6(self) -> [u8; 6] {
        let mut b = [0u8; 6];
        b[0..4].copy_from_slice(&self.page.to_be_bytes());
        b[4..6].copy_from_slice(&self.slot.to_be_bytes());
        b
    }

    /// Little-endian 6-byte form for page payloads.
    pub fn to_le6(self) -> [u8; 6] {
        let mut b = [0u8; 6];
        b[0..4].copy_from_slice(&self.page.to_le_bytes());
        b[4..6].copy_from_slice(&self.slot.to_le_bytes());
        b
    }

    ///
    pub fn from_le6(b: &[u8]) -> RowId {
        RowId {
            page: util::getu32(b, 0),
            slot: util::getu16(b, 4),
        }
    }

    /// The next row id in ( page, slot ) order.
    pub fn next(self) -> RowId {
        if self.slot == u16::MAX {
            RowId::new(self.page + 1, 0)
        } else {
            RowId::new(self.page, self.slot + 1)
        }
    }
}

/// An open database container.
pub struct Database {
    /// Page storage.
    pub file: PageChannel,
    // System tables.
    sys_objects: RefCell<TablePtr>,
    sys_relations: RefCell<TablePtr>,
    sys_complex: RefCell<TablePtr>,
    /// Open tables by definition page.
    pub tables: RefCell<FxHashMap<u32, TablePtr>>,
    /// All relationships.
    pub relations: RefCell<Vec<Rc<Relationship>>>,
    /// All complex-column records.
    pub complex_cols: RefCell<Vec<Rc<ComplexColumnInfo>>>,
    /// Resolver for linked-table paths.
    pub link_resolver: RefCell<Option<Box<dyn LinkResolver>>>,
    /// Cache of opened linked databases by path.
    pub linked_dbs: RefCell<FxHashMap<String, DB>>,
    /// Pluggable expression evaluator.
    pub evaluator: RefCell<Option<Rc<dyn ExprEvaluator>>>,
    /// Held and forwarded to the evaluator; not interpreted by the core.
    pub eval_config: RefCell<EvalConfig>,
}

impl Database {
    fn assemble(file: PageChannel, sys_objects: Table) -> DB {
        let t = Rc::new(sys_objects);
        Rc::new(Database {
            file,
            sys_objects: RefCell::new(t.clone()),
            sys_relations: RefCell::new(t.clone()),
            sys_complex: RefCell::new(t),
            tables: util::newmap(),
            relations: RefCell::new(Vec::new()),
            complex_cols: RefCell::new(Vec::new()),
            link_resolver: RefCell::new(None),
            linked_dbs: util::newmap(),
            evaluator: RefCell::new(None),
            eval_config: RefCell::new(EvalConfig::default()),
        })
    }

    /// Create a fresh container of the given version.
    pub fn create(stg: Box<dyn Storage>, version: Version) -> Result<DB> {
        Self::create_with(stg, Box::new(PlainCodec), version)
    }

    /// Create with a custom page transform.
    pub fn create_with(
        stg: Box<dyn Storage>,
        codec: Box<dyn PageCodec>,
        version: Version,
    ) -> Result<DB> {
        let file = PageChannel::create(stg, codec, version)?;
        file.start_write()?;
        let t_obj = Table::create(&file, 1, &sys::objects_spec(), true)?;
        file.set_sys_root(t_obj.def_page);
        let t_rel = Table::create(&file, 2, &sys::relationships_spec(), true)?;
        let t_cpx = Table::create(&file, 3, &sys::complex_spec(), true)?;
        let rel_def = t_rel.def_page;
        let cpx_def = t_cpx.def_page;
        let obj_def = t_obj.def_page;
        let db = Self::assemble(file, t_obj);
        *db.sys_relations.borrow_mut() = Rc::new(t_rel);
        *db.sys_complex.borrow_mut() = Rc::new(t_cpx);
        sys::add_object(&db, Some(1), "MSysObjects", sys::OBJ_SYSTEM, obj_def, None, None)?;
        sys::add_object(
            &db,
            Some(2),
            "MSysRelationships",
            sys::OBJ_SYSTEM,
            rel_def,
            None,
            None,
        )?;
        sys::add_object(
            &db,
            Some(3),
            "MSysComplexColumns",
            sys::OBJ_SYSTEM,
            cpx_def,
            None,
            None,
        )?;
        sys::add_object(&db, None, sys::DB_OBJECT_NAME, sys::OBJ_DATABASE, 0, None, None)?;
        db.file.finish_write()?;
        Ok(db)
    }

    /// Open an existing container.
    pub fn open(stg: Box<dyn Storage>) -> Result<DB> {
        Self::open_with(stg, Box::new(PlainCodec))
    }

    /// Open with a custom page transform.
    pub fn open_with(stg: Box<dyn Storage>, codec: Box<dyn PageCodec>) -> Result<DB> {
        let file = PageChannel::open(stg, codec)?;
        let sys_root = file.sys_root();
        let t_obj = Table::load(&file, sys_root)?;
        let db = Self::assemble(file, t_obj);
        db.bootstrap()?;
        Ok(db)
    }

    /// Open an existing container, or create one when the store is empty.
    pub fn open_or_create(stg: Box<dyn Storage>, version: Version) -> Result<DB> {
        if stg.size() == 0 {
            Self::create(stg, version)
        } else {
            Self::open(stg)
        }
    }

    /// Locate the remaining system tables and warm the relationship and
    /// complex-column caches.
    fn bootstrap(self: &DB) -> Result<()> {
        let rel = sys::find_object(self, "MSysRelationships")?
            .ok_or_else(|| Error::corrupt("system relationship table missing"))?;
        let cpx = sys::find_object(self, "MSysComplexColumns")?
            .ok_or_else(|| Error::corrupt("system complex-column table missing"))?;
        let rel_def = rel.1[sys::OBJ_DEF_PAGE].as_int().unwrap_or(0) as u32;
        let cpx_def = cpx.1[sys::OBJ_DEF_PAGE].as_int().unwrap_or(0) as u32;
        *self.sys_relations.borrow_mut() = Rc::new(Table::load(&self.file, rel_def)?);
        *self.sys_complex.borrow_mut() = Rc::new(Table::load(&self.file, cpx_def)?);
        *self.relations.borrow_mut() = sys::load_relationships(self)?;
        *self.complex_cols.borrow_mut() = sys::load_complex_columns(self)?;
        Ok(())
    }

    /// The system object table.
    pub fn sys_objects(&self) -> TablePtr {
        self.sys_objects.borrow().clone()
    }

    /// The system relationship table.
    pub fn sys_relations(&self) -> TablePtr {
        self.sys_relations.borrow().clone()
    }

    /// The system complex-column table.
    pub fn sys_complex(&self) -> TablePtr {
        self.sys_complex.borrow().clone()
    }

    // -----------------------------------------------------------------
    // Write barrier

    /// Open an explicit write barrier spanning several operations.
    pub fn start_write(&self) -> Result<()> {
        self.file.start_write()
    }

    /// Close the barrier; all writes inside it become visible atomically.
    pub fn finish_write(&self) -> Result<()> {
        self.file.finish_write()
    }

    /// Run an operation inside a ( possibly nested ) write barrier.
    pub(crate) fn with_write<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.file.start_write()?;
        match f() {
            Ok(x) => {
                self.file.finish_write()?;
                Ok(x)
            }
            Err(e) => {
                // Caller-caused failures have already undone their writes;
                // fatal failures poisoned the channel; cascade failures
                // aborted the barrier outright.
                if self.file.in_barrier() {
                    let _ = self.file.finish_write();
                }
                Err(e)
            }
        }
    }

    /// Abort the current barrier and rebuild in-memory state from the last
    /// committed pages.
    pub(crate) fn rollback(self: &DB) -> Result<()> {
        self.file.abort_write()?;
        self.reload()
    }

    fn reload(self: &DB) -> Result<()> {
        self.tables.borrow_mut().clear();
        *self.sys_objects.borrow_mut() =
            Rc::new(Table::load(&self.file, self.file.sys_root())?);
        self.bootstrap()
    }

    // -----------------------------------------------------------------
    // Tables

    /// Load ( or fetch from cache ) the table defined at a page.
    pub fn cached_table(self: &DB, def_page: u32) -> Result<TablePtr> {
        for t in [&self.sys_objects, &self.sys_relations, &self.sys_complex] {
            let t = t.borrow();
            if t.def_page == def_page {
                return Ok(t.clone());
            }
        }
        if let Some(t) = self.tables.borrow().get(&def_page) {
            return Ok(t.clone());
        }
        let t = Rc::new(Table::load(&self.file, def_page)?);
        self.tables.borrow_mut().insert(def_page, t.clone());
        Ok(t)
    }

    /// Names of the user tables ( linked tables included ).
    pub fn table_names(self: &DB) -> Result<Vec<String>> {
        sys::user_table_names(self)
    }

    /// Open a table by name, case-insensitively. Linked tables resolve
    /// through the registered link resolver.
    pub fn open_table(self: &DB, name: &str) -> Result<TableHandle> {
        let (_, row) = sys::find_object(self, name)?
            .ok_or_else(|| Error::InvalidArgument(format!("no such table '{}'", name)))?;
        sys::open_object(self, &row)
    }

    /// A table by object id.
    pub fn table_by_id(self: &DB, id: i32) -> Result<TablePtr> {
        for t in [&self.sys_objects, &self.sys_relations, &self.sys_complex] {
            let t = t.borrow();
            if t.id == id {
                return Ok(t.clone());
            }
        }
        let (_, row) = sys::find_object_by_id(self, id)?
            .ok_or_else(|| Error::InvalidArgument(format!("no table with id {}", id)))?;
        let def_page = row[sys::OBJ_DEF_PAGE].as_int().unwrap_or(0) as u32;
        self.cached_table(def_page)
    }

    fn next_object_id(self: &DB) -> i32 {
        self.sys_objects().next_auto.get()
    }

    /// Create a user table.
    pub fn create_table(self: &DB, spec: &TableSpec) -> Result<TableHandle> {
        if sys::find_object(self, &spec.name)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "object '{}' already exists",
                spec.name
            )));
        }
        self.with_write(|| {
            let id = self.next_object_id();
            let t = Table::create(&self.file, id, spec, false)?;
            let def_page = t.def_page;
            sys::add_object(self, Some(id), &spec.name, sys::OBJ_TABLE, def_page, None, None)?;
            let t = Rc::new(t);
            self.tables.borrow_mut().insert(def_page, t.clone());
            Ok(TableHandle {
                db: self.clone(),
                table: t,
            })
        })
    }

    fn create_hidden_table(self: &DB, spec: &TableSpec, typ: u8) -> Result<TablePtr> {
        self.with_write(|| {
            let id = self.next_object_id();
            let t = Table::create(&self.file, id, spec, false)?;
            let def_page = t.def_page;
            sys::add_object(self, Some(id), &spec.name, typ, def_page, None, None)?;
            let t = Rc::new(t);
            self.tables.borrow_mut().insert(def_page, t.clone());
            Ok(t)
        })
    }

    /// Register a linked table living in a foreign database file.
    pub fn create_linked_table(self: &DB, name: &str, path: &str, foreign: &str) -> Result<()> {
        if sys::find_object(self, name)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "object '{}' already exists",
                name
            )));
        }
        self.with_write(|| {
            sys::add_object(
                self,
                None,
                name,
                sys::OBJ_LINKED,
                0,
                Some(path),
                Some(foreign),
            )?;
            Ok(())
        })
    }

    /// Register an ODBC-linked table: schema visible, data read-only.
    pub fn create_odbc_table(
        self: &DB,
        name: &str,
        connect: &str,
        foreign: &str,
        spec: &TableSpec,
    ) -> Result<()> {
        if sys::find_object(self, name)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "object '{}' already exists",
                name
            )));
        }
        self.with_write(|| {
            let id = self.next_object_id();
            let t = Table::create(&self.file, id, spec, false)?;
            sys::add_object(
                self,
                Some(id),
                name,
                sys::OBJ_LINKED_ODBC,
                t.def_page,
                Some(connect),
                Some(foreign),
            )?;
            Ok(())
        })
    }

    /// Drop a table: free its pages, remove its catalog row and any
    /// relationships and complex columns that touch it.
    pub fn drop_table(self: &DB, name: &str) -> Result<()> {
        let (rowid, row) = sys::find_object(self, name)?
            .ok_or_else(|| Error::InvalidArgument(format!("no such table '{}'", name)))?;
        let id = row[sys::OBJ_ID].as_int().unwrap_or(0) as i32;
        let typ = match row[sys::OBJ_TYPE] {
            Value::Byte(b) => b,
            _ => sys::OBJ_TABLE,
        };
        if matches!(typ, sys::OBJ_SYSTEM | sys::OBJ_DATABASE) {
            return Err(Error::InvalidArgument(format!(
                "'{}' is a system object",
                name
            )));
        }
        self.with_write(|| {
            if matches!(typ, sys::OBJ_TABLE | sys::OBJ_FLAT | sys::OBJ_LINKED_ODBC) {
                let def_page = row[sys::OBJ_DEF_PAGE].as_int().unwrap_or(0) as u32;
                let t = self.cached_table(def_page)?;
                t.free_all_pages(self)?;
                self.tables.borrow_mut().remove(&def_page);
            }
            // Relationships touching the table go away with it.
            let rel_rows: Vec<(RowId, i32)> = {
                let mut out = Vec::new();
                let mut c = Cursor::scan(self.sys_relations());
                while c.move_next(self)? {
                    let r = c.current_row().unwrap_or(&[]);
                    let child = r[2].as_int().unwrap_or(0) as i32;
                    let parent = r[4].as_int().unwrap_or(0) as i32;
                    if child == id || parent == id {
                        out.push((c.current_rowid().unwrap(), r[0].as_int().unwrap_or(0) as i32));
                    }
                }
                out
            };
            let trel = self.sys_relations();
            for (rid, _) in &rel_rows {
                trel.delete_row(self, *rid)?;
            }
            // Complex columns owned by the table drop their flat tables.
            let cpx: Vec<Rc<ComplexColumnInfo>> = self
                .complex_cols
                .borrow()
                .iter()
                .filter(|c| c.table_id == id)
                .cloned()
                .collect();
            for info in cpx {
                if let Some((_, frow)) = sys::find_object_by_id(self, info.flat_table)? {
                    if let Some(fname) = frow[sys::OBJ_NAME].as_str() {
                        let fname = fname.to_string();
                        self.drop_table(&fname)?;
                    }
                }
            }
            let tobj = self.sys_objects();
            tobj.delete_row(self, rowid)?;
            *self.relations.borrow_mut() = sys::load_relationships(self)?;
            *self.complex_cols.borrow_mut() = sys::load_complex_columns(self)?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // Indexes and relationships

    /// Create an index on an existing table, backfilling entries for its
    /// current rows.
    pub fn create_index(self: &DB, table_name: &str, spec: &IndexSpec) -> Result<()> {
        let h = self.open_table(table_name)?;
        let table = h.table;
        self.with_write(|| {
            let r = self.create_index_inner(&table, spec, None);
            if r.is_err() {
                self.rollback()?;
            }
            r.map(|_| ())
        })
    }

    /// Shared by create_index and create_relationship: find or build the
    /// IndexData for a column list and register a logical index over it.
    fn create_index_inner(
        self: &DB,
        table: &TablePtr,
        spec: &IndexSpec,
        foreign_key: Option<ForeignKeyRef>,
    ) -> Result<usize> {
        if table.find_index(&spec.name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "index '{}' already exists on '{}'",
                spec.name, table.name
            )));
        }
        let mut cols = Vec::with_capacity(spec.cols.len());
        for (cname, desc) in &spec.cols {
            let ord = table.info.get(cname).ok_or_else(|| {
                Error::InvalidArgument(format!("no column '{}' for index '{}'", cname, spec.name))
            })?;
            cols.push(IndexColumn {
                col: ord,
                typ: table.info.cols[ord].typ,
                descending: *desc,
            });
        }
        let same = |d: &IndexDataPtr| {
            d.cols.len() == cols.len()
                && d.cols
                    .iter()
                    .zip(cols.iter())
                    .all(|(a, b)| a.col == b.col && a.descending == b.descending)
        };
        // The table struct is shared; mutate through a rebuilt copy of the
        // index lists.
        let mut index_data = table.index_data.clone();
        let mut logical = table.logical.clone();
        let data_ord = match index_data.iter().position(same) {
            Some(i) => i,
            None => {
                let root = IndexData::create_root(&self.file)?;
                let d = Rc::new(IndexData::new(
                    ((table.id as u64) << 16) | index_data.len() as u64,
                    root,
                    cols,
                ));
                if spec.unique || spec.primary {
                    d.unique.set(true);
                }
                if spec.ignore_nulls {
                    d.ignore_nulls.set(true);
                }
                index_data.push(d.clone());
                // Backfill from the current rows.
                let mut c = Cursor::scan(table.clone());
                while c.move_next(self)? {
                    let rowid = c.current_rowid().unwrap();
                    let row = c.current_row().unwrap_or(&[]).to_vec();
                    if let Some(key) = d.key_from_row(&row)? {
                        d.insert(&self.file, &key, rowid)?;
                    }
                }
                index_data.len() - 1
            }
        };
        let unique = spec.unique || spec.primary;
        let d = &index_data[data_ord];
        if unique {
            d.unique.set(true);
        }
        if spec.ignore_nulls {
            d.ignore_nulls.set(true);
        }
        {
            let mut n = d.name.borrow_mut();
            if n.is_empty() || spec.primary {
                *n = spec.name.clone();
            }
        }
        logical.push(LogicalIndex {
            name: spec.name.clone(),
            data_ord,
            unique,
            ignore_nulls: spec.ignore_nulls,
            primary: spec.primary,
            foreign_key,
        });
        let rebuilt = Rc::new(Table {
            id: table.id,
            name: table.name.clone(),
            def_page: table.def_page,
            info: table.info.clone(),
            index_data,
            logical,
            data_map: UsageMap::load(&self.file, table.data_map.owner(), AllocMode::Normal)?,
            free_map: UsageMap::load(&self.file, table.free_map.owner(), AllocMode::Normal)?,
            lval_map: UsageMap::load(&self.file, table.lval_map.owner(), AllocMode::Normal)?,
            row_count: Cell::new(table.row_count.get()),
            next_auto: Cell::new(table.next_auto.get()),
            system: table.system,
            read_only: Cell::new(table.read_only.get()),
        });
        rebuilt.save_def(&self.file)?;
        self.tables
            .borrow_mut()
            .insert(rebuilt.def_page, rebuilt.clone());
        Ok(rebuilt.logical.len() - 1)
    }

    /// Create a relationship. The parent columns must already carry a
    /// unique index; the child side gets a foreign-key index when none
    /// exists, and existing child rows are verified.
    pub fn create_relationship(self: &DB, spec: &RelationshipSpec) -> Result<()> {
        let child = self.open_table(&spec.child_table)?.table;
        let parent = self.open_table(&spec.parent_table)?.table;
        if spec.child_cols.len() != spec.parent_cols.len() || spec.child_cols.is_empty() {
            return Err(Error::InvalidArgument(
                "relationship column lists must be non-empty and of equal length".to_string(),
            ));
        }
        // Parent side: a unique IndexData over exactly the referenced columns.
        let parent_ords: Vec<usize> = spec
            .parent_cols
            .iter()
            .map(|c| {
                parent.info.get(c).ok_or_else(|| {
                    Error::InvalidArgument(format!("no column '{}' in '{}'", c, parent.name))
                })
            })
            .collect::<Result<_>>()?;
        let parent_index = parent
            .index_data
            .iter()
            .position(|d| {
                d.unique.get()
                    && d.cols.len() == parent_ords.len()
                    && d.cols.iter().zip(parent_ords.iter()).all(|(a, b)| a.col == *b)
            })
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "referenced columns of '{}' carry no unique index",
                    parent.name
                ))
            })?;

        self.with_write(|| {
            let r = self.create_relationship_inner(&child, &parent, parent_index, spec);
            if r.is_err() {
                self.rollback()?;
            }
            r
        })
    }

    fn create_relationship_inner(
        self: &DB,
        child: &TablePtr,
        parent: &TablePtr,
        parent_index: usize,
        spec: &RelationshipSpec,
    ) -> Result<()> {
        let fk = ForeignKeyRef {
            parent_table: parent.id,
            parent_index,
        };
        let mut ispec = IndexSpec::new(&spec.name, &[]);
        ispec.cols = spec.child_cols.iter().map(|c| (c.clone(), false)).collect();
        ispec.unique = spec.flags & REL_ONE_TO_ONE != 0;
        let logical_ord = self.create_index_inner(child, &ispec, Some(fk))?;
        let child = self.cached_table(child.def_page)?;
        let child_index = child.logical[logical_ord].data_ord;

        // Existing child rows must satisfy the relationship.
        if spec.flags & REL_NO_INTEGRITY == 0 {
            let parent_data = &parent.index_data[parent_index];
            let child_data = &child.index_data[child_index];
            let mut c = Cursor::scan(child.clone());
            while c.move_next(self)? {
                let row = c.current_row().unwrap_or(&[]);
                let mut vals = Vec::new();
                let mut any_null = false;
                for ic in &child_data.cols {
                    if row[ic.col].is_null() {
                        any_null = true;
                        break;
                    }
                    vals.push(row[ic.col].clone());
                }
                if any_null {
                    continue;
                }
                let key = parent_data.key_from_values(&vals)?;
                if !parent_data.contains_key(&self.file, &key)? {
                    return Err(Error::ReferentialIntegrityViolation {
                        relationship: spec.name.clone(),
                    });
                }
            }
        }

        let trel = self.sys_relations();
        let mut row = trel.row();
        row[1] = Value::text(&spec.name);
        row[2] = Value::Int(child.id);
        row[3] = Value::Int(child_index as i32);
        row[4] = Value::Int(parent.id);
        row[5] = Value::Int(parent_index as i32);
        row[6] = Value::Int(spec.flags as i32);
        trel.insert_row(self, &mut row)?;
        *self.relations.borrow_mut() = sys::load_relationships(self)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Complex columns

    /// Attach a complex-value flat table to a Complex column. The value
    /// type is only used for multi-value columns.
    pub fn add_complex_column(
        self: &DB,
        table_name: &str,
        column: &str,
        kind: ComplexKind,
        value_type: DataType,
    ) -> Result<()> {
        if !self.file.fmt().complex_columns {
            return Err(Error::InvalidArgument(
                "this file version has no complex columns".to_string(),
            ));
        }
        let table = self.open_table(table_name)?.table;
        let ord = table.info.get(column).ok_or_else(|| {
            Error::InvalidArgument(format!("no column '{}' in '{}'", column, table_name))
        })?;
        if table.info.cols[ord].typ != DataType::Complex {
            return Err(Error::InvalidArgument(format!(
                "column '{}' is not of the complex type",
                column
            )));
        }
        let flat_name = format!("f_{}_{}", table.id, column);
        self.with_write(|| {
            let flat = self.create_hidden_table(
                &complex::flat_spec(&flat_name, kind, value_type),
                sys::OBJ_FLAT,
            )?;
            let t = self.sys_complex();
            let mut row = t.row();
            row[1] = Value::Int(table.id);
            row[2] = Value::Int(ord as i32);
            row[3] = Value::Int(flat.id);
            row[4] = Value::Byte(kind.tag());
            row[5] = Value::Int(1);
            t.insert_row(self, &mut row)?;
            *self.complex_cols.borrow_mut() = sys::load_complex_columns(self)?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // Links, evaluator, properties

    /// Register the resolver used to open linked databases.
    pub fn set_link_resolver(&self, r: Box<dyn LinkResolver>) {
        *self.link_resolver.borrow_mut() = Some(r);
    }

    /// Open ( or fetch from cache ) the database behind a linked path.
    pub fn resolve_link(self: &DB, path: &str) -> Result<DB> {
        if let Some(db) = self.linked_dbs.borrow().get(path) {
            return Ok(db.clone());
        }
        let resolver = self.link_resolver.borrow();
        let r = resolver.as_ref().ok_or_else(|| {
            Error::InvalidArgument("no link resolver registered".to_string())
        })?;
        let linked = r.resolve(self, path)?;
        drop(resolver);
        self.linked_dbs
            .borrow_mut()
            .insert(path.to_string(), linked.clone());
        Ok(linked)
    }

    /// Install the expression evaluator.
    pub fn set_evaluator(&self, ev: Rc<dyn ExprEvaluator>) {
        *self.evaluator.borrow_mut() = Some(ev);
    }

    /// Replace the evaluator configuration.
    pub fn set_eval_config(&self, cfg: EvalConfig) {
        *self.eval_config.borrow_mut() = cfg;
    }

    pub(crate) fn apply_insert_hooks(
        self: &DB,
        table: &Table,
        values: &mut Vec<Value>,
    ) -> Result<()> {
        let ev = match &*self.evaluator.borrow() {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        if !eval::eval_enabled_default() {
            return Ok(());
        }
        for col in &table.info.cols {
            if col.default_expr.is_some() && values[col.ordinal].is_null() {
                let v = ev.evaluate_default(self, table, col, values)?;
                values[col.ordinal] = v;
            }
        }
        self.apply_shared_hooks(&ev, table, values)
    }

    pub(crate) fn apply_update_hooks(
        self: &DB,
        table: &Table,
        values: &mut Vec<Value>,
    ) -> Result<()> {
        let ev = match &*self.evaluator.borrow() {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        if !eval::eval_enabled_default() {
            return Ok(());
        }
        self.apply_shared_hooks(&ev, table, values)
    }

    fn apply_shared_hooks(
        self: &DB,
        ev: &Rc<dyn ExprEvaluator>,
        table: &Table,
        values: &mut Vec<Value>,
    ) -> Result<()> {
        for col in &table.info.cols {
            if col.calc_expr.is_some() {
                let v = ev.evaluate_calculated(self, table, col, values)?;
                values[col.ordinal] = v;
            }
        }
        for col in &table.info.cols {
            if col.validation.is_some() {
                ev.validate_column(self, table, col, values)?;
            }
        }
        if table.info.row_validation.is_some() {
            ev.validate_row(self, table, values)?;
        }
        Ok(())
    }

    /// The database object's property map.
    pub fn database_props(self: &DB) -> Result<PropertyMap> {
        Ok(sys::object_props(self, sys::DB_OBJECT_NAME)?.section(""))
    }

    ///
    pub fn set_database_props(self: &DB, map: PropertyMap) -> Result<()> {
        let mut set = sys::object_props(self, sys::DB_OBJECT_NAME)?;
        set.set_section("", map);
        sys::set_object_props(self, sys::DB_OBJECT_NAME, &set)
    }

    /// A table's property map.
    pub fn table_props(self: &DB, table: &str) -> Result<PropertyMap> {
        Ok(sys::object_props(self, table)?.section(""))
    }

    ///
    pub fn set_table_props(self: &DB, table: &str, map: PropertyMap) -> Result<()> {
        let mut set = sys::object_props(self, table)?;
        set.set_section("", map);
        sys::set_object_props(self, table, &set)
    }

    /// A column's property map.
    pub fn column_props(self: &DB, table: &str, column: &str) -> Result<PropertyMap> {
        Ok(sys::object_props(self, table)?.section(&PropertySet::column_key(column)))
    }

    ///
    pub fn set_column_props(self: &DB, table: &str, column: &str, map: PropertyMap) -> Result<()> {
        let mut set = sys::object_props(self, table)?;
        set.set_section(&PropertySet::column_key(column), map);
        sys::set_object_props(self, table, &set)
    }

    /// An index's property map.
    pub fn index_props(self: &DB, table: &str, index: &str) -> Result<PropertyMap> {
        Ok(sys::object_props(self, table)?.section(&PropertySet::index_key(index)))
    }

    ///
    pub fn set_index_props(self: &DB, table: &str, index: &str, map: PropertyMap) -> Result<()> {
        let mut set = sys::object_props(self, table)?;
        set.set_section(&PropertySet::index_key(index), map);
        sys::set_object_props(self, table, &set)
    }
} // end impl Database

/// An open table plus the database it belongs to. For linked tables the
/// database is the resolved foreign container, so the handle behaves as
/// if the table were local.
#[derive(Clone)]
pub struct TableHandle {
    ///
    pub db: DB,
    ///
    pub table: TablePtr,
}

impl TableHandle {
    ///
    pub fn name(&self) -> &str {
        &self.table.name
    }

    /// A fresh all-null row.
    pub fn row(&self) -> Vec<Value> {
        self.table.row()
    }

    ///
    pub fn row_count(&self) -> u32 {
        self.table.row_count.get()
    }

    ///
    pub fn insert_row(&self, values: &mut Vec<Value>) -> Result<RowId> {
        self.table.insert_row(&self.db, values)
    }

    ///
    pub fn update_row(&self, rowid: RowId, values: &mut Vec<Value>) -> Result<RowId> {
        self.table.update_row(&self.db, rowid, values)
    }

    ///
    pub fn delete_row(&self, rowid: RowId) -> Result<()> {
        self.table.delete_row(&self.db, rowid)
    }

    ///
    pub fn get_row(&self, rowid: RowId) -> Result<Option<Vec<Value>>> {
        self.table.get_row(&self.db, rowid)
    }

    /// Cursor in physical page order.
    pub fn cursor(&self) -> Cursor {
        Cursor::scan(self.table.clone())
    }

    /// Cursor bound to a named index.
    pub fn index_cursor(&self, index: &str) -> Result<Cursor> {
        Cursor::index(self.table.clone(), index)
    }

    /// Cursor bound to the primary key.
    pub fn primary_cursor(&self) -> Result<Cursor> {
        Cursor::primary(self.table.clone())
    }

    ///
    pub fn add_attachment(&self, rowid: RowId, column: &str, att: &Attachment) -> Result<()> {
        complex::add_attachment(&self.db, &self.table, rowid, column, att)
    }

    ///
    pub fn get_attachments(&self, rowid: RowId, column: &str) -> Result<Vec<Attachment>> {
        complex::get_attachments(&self.db, &self.table, rowid, column)
    }

    ///
    pub fn add_multi_value(&self, rowid: RowId, column: &str, value: Value) -> Result<()> {
        complex::add_multi_value(&self.db, &self.table, rowid, column, value)
    }

    ///
    pub fn get_multi_values(&self, rowid: RowId, column: &str) -> Result<Vec<Value>> {
        complex::get_multi_values(&self.db, &self.table, rowid, column)
    }

    ///
    pub fn add_version(
        &self,
        rowid: RowId,
        column: &str,
        value: &str,
        modified: chrono::NaiveDateTime,
    ) -> Result<()> {
        complex::add_version(&self.db, &self.table, rowid, column, value, modified)
    }

    ///
    pub fn get_versions(&self, rowid: RowId, column: &str) -> Result<Vec<ValueVersion>> {
        complex::get_versions(&self.db, &self.table, rowid, column)
    }
}
