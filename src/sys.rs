use crate::*;

/// Catalog object types ( Type column of the system object table ).
pub const OBJ_DATABASE: u8 = 0;
/// System table.
pub const OBJ_SYSTEM: u8 = 1;
/// User table.
pub const OBJ_TABLE: u8 = 2;
/// Table living in a foreign database file.
pub const OBJ_LINKED: u8 = 3;
/// ODBC-linked table ( schema visible, data read-only ).
pub const OBJ_LINKED_ODBC: u8 = 4;
/// Hidden complex-value flat table.
pub const OBJ_FLAT: u8 = 5;

// MSysObjects columns.
pub(crate) const OBJ_ID: usize = 0;
pub(crate) const OBJ_NAME: usize = 1;
pub(crate) const OBJ_TYPE: usize = 2;
pub(crate) const OBJ_FLAGS: usize = 3;
pub(crate) const OBJ_DEF_PAGE: usize = 4;
pub(crate) const OBJ_CONNECT: usize = 5;
pub(crate) const OBJ_FOREIGN_NAME: usize = 6;
pub(crate) const OBJ_PROPS: usize = 7;

/// Name of the catalog row describing the database itself.
pub const DB_OBJECT_NAME: &str = "MSysDb";

/// Caller-supplied callback that opens a database referenced by a
/// linked-table record. The path string is opaque to the core.
pub trait LinkResolver {
    /// Open ( or find ) the database behind a linked-table path.
    fn resolve(&self, from: &DB, path: &str) -> Result<DB>;
}

/// Resolver that treats the path as a local file name.
pub struct FileLinkResolver;

impl LinkResolver for FileLinkResolver {
    fn resolve(&self, _from: &DB, path: &str) -> Result<DB> {
        let stg = SimpleFileStorage::new(path)?;
        Database::open(Box::new(stg))
    }
}

/// Column layout of the system object table.
pub fn objects_spec() -> TableSpec {
    let mut s = TableSpec::new("MSysObjects");
    let mut id = ColumnSpec::new("Id", DataType::Long);
    id.auto_number = true;
    s.columns.push(id);
    let mut name = ColumnSpec::new("Name", DataType::Text);
    name.len = Some(240);
    name.nullable = false;
    s.columns.push(name);
    s.columns.push(ColumnSpec::new("Type", DataType::Byte));
    s.columns.push(ColumnSpec::new("Flags", DataType::Long));
    s.columns.push(ColumnSpec::new("DefPage", DataType::Long));
    s.columns.push(ColumnSpec::new("Connect", DataType::Memo));
    let mut fname = ColumnSpec::new("ForeignName", DataType::Text);
    fname.len = Some(240);
    s.columns.push(fname);
    s.columns.push(ColumnSpec::new("Properties", DataType::Ole));
    s.indexes.push(IndexSpec::primary("PrimaryKey", &["Id"]));
    s.indexes.push(IndexSpec::new("ByName", &["Name"]));
    s
}

/// Column layout of the system relationship table.
pub fn relationships_spec() -> TableSpec {
    let mut s = TableSpec::new("MSysRelationships");
    let mut id = ColumnSpec::new("Id", DataType::Long);
    id.auto_number = true;
    s.columns.push(id);
    let mut name = ColumnSpec::new("Name", DataType::Text);
    name.len = Some(240);
    s.columns.push(name);
    s.columns.push(ColumnSpec::new("ChildTable", DataType::Long));
    s.columns.push(ColumnSpec::new("ChildIndex", DataType::Long));
    s.columns.push(ColumnSpec::new("ParentTable", DataType::Long));
    s.columns.push(ColumnSpec::new("ParentIndex", DataType::Long));
    s.columns.push(ColumnSpec::new("Flags", DataType::Long));
    s.indexes.push(IndexSpec::primary("PrimaryKey", &["Id"]));
    s
}

/// Column layout of the system complex-column table.
pub fn complex_spec() -> TableSpec {
    let mut s = TableSpec::new("MSysComplexColumns");
    let mut id = ColumnSpec::new("Id", DataType::Long);
    id.auto_number = true;
    s.columns.push(id);
    s.columns.push(ColumnSpec::new("TableId", DataType::Long));
    s.columns.push(ColumnSpec::new("ColumnOrd", DataType::Long));
    s.columns.push(ColumnSpec::new("FlatTableId", DataType::Long));
    s.columns.push(ColumnSpec::new("Kind", DataType::Byte));
    s.columns.push(ColumnSpec::new("NextFk", DataType::Long));
    s.indexes.push(IndexSpec::primary("PrimaryKey", &["Id"]));
    s
}

/// Insert a catalog row, returning the object id.
pub fn add_object(
    db: &DB,
    id: Option<i32>,
    name: &str,
    typ: u8,
    def_page: u32,
    connect: Option<&str>,
    foreign_name: Option<&str>,
) -> Result<i32> {
    let t = db.sys_objects();
    let mut row = t.row();
    if let Some(id) = id {
        row[OBJ_ID] = Value::Int(id);
    }
    row[OBJ_NAME] = Value::text(name);
    row[OBJ_TYPE] = Value::Byte(typ);
    row[OBJ_FLAGS] = Value::Int(0);
    row[OBJ_DEF_PAGE] = Value::Int(def_page as i32);
    if let Some(c) = connect {
        row[OBJ_CONNECT] = Value::text(c);
    }
    if let Some(f) = foreign_name {
        row[OBJ_FOREIGN_NAME] = Value::text(f);
    }
    t.insert_row(db, &mut row)?;
    match row[OBJ_ID] {
        Value::Int(x) => Ok(x),
        _ => Err(Error::corrupt("object id not assigned")),
    }
}

/// Find a catalog row by object name ( case-insensitive ).
pub fn find_object(db: &DB, name: &str) -> Result<Option<(RowId, Vec<Value>)>> {
    let mut c = Cursor::scan(db.sys_objects());
    while c.move_next(db)? {
        let row = c.current_row().unwrap_or(&[]);
        if let Some(n) = row[OBJ_NAME].as_str() {
            if n.eq_ignore_ascii_case(name) {
                return Ok(Some((c.current_rowid().unwrap(), row.to_vec())));
            }
        }
    }
    Ok(None)
}

/// Find a catalog row by object id.
pub fn find_object_by_id(db: &DB, id: i32) -> Result<Option<(RowId, Vec<Value>)>> {
    let t = db.sys_objects();
    let mut c = Cursor::primary(t)?;
    if c.find_first_row_by_entry(db, &[Value::Int(id)])? {
        let rowid = c.current_rowid().unwrap();
        let row = c.current_row().unwrap_or(&[]).to_vec();
        return Ok(Some((rowid, row)));
    }
    Ok(None)
}

/// Enumerate user table names ( system, flat and database rows excluded ).
pub fn user_table_names(db: &DB) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut c = Cursor::scan(db.sys_objects());
    while c.move_next(db)? {
        let row = c.current_row().unwrap_or(&[]);
        let typ = match row[OBJ_TYPE] {
            Value::Byte(b) => b,
            _ => continue,
        };
        if matches!(typ, OBJ_TABLE | OBJ_LINKED | OBJ_LINKED_ODBC) {
            if let Some(n) = row[OBJ_NAME].as_str() {
                out.push(n.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Materialize a table ( any catalog type ) from its catalog row.
pub fn open_object(db: &DB, row: &[Value]) -> Result<TableHandle> {
    let typ = match row[OBJ_TYPE] {
        Value::Byte(b) => b,
        _ => return Err(Error::corrupt("catalog row missing object type")),
    };
    let name = row[OBJ_NAME].as_str().unwrap_or_default().to_string();
    match typ {
        OBJ_LINKED => {
            let path = row[OBJ_CONNECT]
                .as_str()
                .ok_or_else(|| Error::corrupt("linked table without a path"))?;
            let foreign = row[OBJ_FOREIGN_NAME].as_str().unwrap_or(&name);
            let linked = db.resolve_link(path)?;
            let h = linked.open_table(foreign)?;
            Ok(TableHandle {
                db: h.db,
                table: h.table,
            })
        }
        OBJ_LINKED_ODBC => {
            // Schema is visible from the local definition pages; data
            // operations are rejected.
            let def_page = row[OBJ_DEF_PAGE].as_int().unwrap_or(0) as u32;
            let table = db.cached_table(def_page)?;
            table.read_only.set(true);
            Ok(TableHandle {
                db: db.clone(),
                table,
            })
        }
        _ => {
            let def_page = row[OBJ_DEF_PAGE].as_int().unwrap_or(0) as u32;
            if def_page == 0 {
                return Err(Error::corrupt(format!(
                    "object '{}' has no definition page",
                    name
                )));
            }
            let table = db.cached_table(def_page)?;
            Ok(TableHandle {
                db: db.clone(),
                table,
            })
        }
    }
}

/// Read the property set blob of a catalog object.
pub fn object_props(db: &DB, object: &str) -> Result<PropertySet> {
    match find_object(db, object)? {
        Some((_, row)) => match &row[OBJ_PROPS] {
            Value::Binary(b) => PropertySet::from_bytes(b),
            _ => Ok(PropertySet::default()),
        },
        None => Err(Error::InvalidArgument(format!(
            "no such object '{}'",
            object
        ))),
    }
}

/// Write a property set back through the normal row-update path.
pub fn set_object_props(db: &DB, object: &str, set: &PropertySet) -> Result<()> {
    match find_object(db, object)? {
        Some((rowid, mut row)) => {
            row[OBJ_PROPS] = Value::Binary(Rc::new(set.to_bytes()));
            let t = db.sys_objects();
            t.update_row(db, rowid, &mut row)?;
            Ok(())
        }
        None => Err(Error::InvalidArgument(format!(
            "no such object '{}'",
            object
        ))),
    }
}

/// Load every relationship from the system table.
pub fn load_relationships(db: &DB) -> Result<Vec<Rc<Relationship>>> {
    let mut out = Vec::new();
    let mut c = Cursor::scan(db.sys_relations());
    while c.move_next(db)? {
        let row = c.current_row().unwrap_or(&[]);
        out.push(Rc::new(Relationship {
            id: row[0].as_int().unwrap_or(0) as i32,
            name: row[1].as_str().unwrap_or_default().to_string(),
            child_table: row[2].as_int().unwrap_or(0) as i32,
            child_index: row[3].as_int().unwrap_or(0) as usize,
            parent_table: row[4].as_int().unwrap_or(0) as i32,
            parent_index: row[5].as_int().unwrap_or(0) as usize,
            flags: row[6].as_int().unwrap_or(0) as u32,
        }));
    }
    Ok(out)
}

/// Load every complex-column record from the system table.
pub fn load_complex_columns(db: &DB) -> Result<Vec<Rc<ComplexColumnInfo>>> {
    let mut out = Vec::new();
    let mut c = Cursor::scan(db.sys_complex());
    while c.move_next(db)? {
        let row = c.current_row().unwrap_or(&[]);
        let kind = match row[4] {
            Value::Byte(k) => ComplexKind::from_tag(k),
            _ => ComplexKind::Unsupported,
        };
        out.push(Rc::new(ComplexColumnInfo {
            id: row[0].as_int().unwrap_or(0) as i32,
            table_id: row[1].as_int().unwrap_or(0) as i32,
            column: row[2].as_int().unwrap_or(0) as usize,
            flat_table: row[3].as_int().unwrap_or(0) as i32,
            kind,
        }));
    }
    Ok(out)
}

/// Next complex foreign-key id for a complex column, persisted through the
/// normal row-update path.
pub fn alloc_complex_fk(db: &DB, complex_id: i32) -> Result<i32> {
    let t = db.sys_complex();
    let mut c = Cursor::primary(t.clone())?;
    if !c.find_first_row_by_entry(db, &[Value::Int(complex_id)])? {
        return Err(Error::corrupt("complex column record missing"));
    }
    let rowid = c.current_rowid().unwrap();
    let mut row = c.current_row().unwrap_or(&[]).to_vec();
    let next = match row[5] {
        Value::Int(x) => x,
        _ => 1,
    };
    row[5] = Value::Int(next + 1);
    t.update_row(db, rowid, &mut row)?;
    Ok(next)
}
