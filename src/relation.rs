use crate::*;

/// One-to-one relationship ( unique child index ).
pub const REL_ONE_TO_ONE: u32 = 0x0000_0001;
/// Referential integrity is not enforced.
pub const REL_NO_INTEGRITY: u32 = 0x0000_0002;
/// Parent key updates propagate to child rows.
pub const REL_CASCADE_UPDATES: u32 = 0x0000_0100;
/// Parent deletes delete matching child rows.
pub const REL_CASCADE_DELETES: u32 = 0x0000_1000;
/// Parent deletes null the child's foreign key columns.
pub const REL_CASCADE_NULL: u32 = 0x0000_2000;
/// Join hint only; not enforced by the core.
pub const REL_LEFT_OUTER: u32 = 0x0100_0000;
/// Join hint only; not enforced by the core.
pub const REL_RIGHT_OUTER: u32 = 0x0200_0000;

/// A pair of indexes in two tables plus a flags word.
#[derive(Clone, Debug)]
pub struct Relationship {
    ///
    pub id: i32,
    ///
    pub name: String,
    /// Object id of the child ( referencing ) table.
    pub child_table: i32,
    /// IndexData ordinal of the foreign-key index on the child.
    pub child_index: usize,
    /// Object id of the parent ( referenced ) table.
    pub parent_table: i32,
    /// IndexData ordinal of the referenced unique index on the parent.
    pub parent_index: usize,
    ///
    pub flags: u32,
}

impl Relationship {
    ///
    pub fn enforced(&self) -> bool {
        self.flags & REL_NO_INTEGRITY == 0
    }
    ///
    pub fn cascade_deletes(&self) -> bool {
        self.flags & REL_CASCADE_DELETES != 0
    }
    ///
    pub fn cascade_updates(&self) -> bool {
        self.flags & REL_CASCADE_UPDATES != 0
    }
    ///
    pub fn cascade_null(&self) -> bool {
        self.flags & REL_CASCADE_NULL != 0
    }
    ///
    pub fn one_to_one(&self) -> bool {
        self.flags & REL_ONE_TO_ONE != 0
    }
}

/// Relationship description for creation.
pub struct RelationshipSpec {
    ///
    pub name: String,
    ///
    pub child_table: String,
    /// Foreign key columns on the child, in key order.
    pub child_cols: Vec<String>,
    ///
    pub parent_table: String,
    /// Referenced columns on the parent; must carry a unique index.
    pub parent_cols: Vec<String>,
    ///
    pub flags: u32,
}

impl RelationshipSpec {
    /// Enforced relationship between single-column keys.
    pub fn new(name: &str, child: &str, child_col: &str, parent: &str, parent_col: &str) -> Self {
        RelationshipSpec {
            name: name.to_string(),
            child_table: child.to_string(),
            child_cols: vec![child_col.to_string()],
            parent_table: parent.to_string(),
            parent_cols: vec![parent_col.to_string()],
            flags: 0,
        }
    }
}

/// Row ids of index entries whose key starts with the prefix.
pub(crate) fn matching_rows(
    ch: &PageChannel,
    data: &IndexDataPtr,
    prefix: &[u8],
) -> Result<Vec<RowId>> {
    let mut out = Vec::new();
    let mut ic = IndexCursor::new(data.clone());
    if !ic.seek(ch, prefix)? {
        return Ok(out);
    }
    loop {
        let (key, rowid) = match ic.current() {
            Some((k, r)) => (k.to_vec(), r),
            None => break,
        };
        if !key.starts_with(prefix) {
            break;
        }
        out.push(rowid);
        if !ic.move_next(ch)? {
            break;
        }
    }
    Ok(out)
}

fn rels_where<F: Fn(&Relationship) -> bool>(db: &DB, f: F) -> Vec<Rc<Relationship>> {
    db.relations
        .borrow()
        .iter()
        .filter(|r| r.enforced() && f(r))
        .cloned()
        .collect()
}

/// Key values of a row projected onto an index's columns. None when any
/// column is null ( partially null foreign keys are not checked ).
fn project(data: &IndexData, row: &[Value]) -> Option<Vec<Value>> {
    let mut out = Vec::with_capacity(data.cols.len());
    for c in &data.cols {
        if row[c.col].is_null() {
            return None;
        }
        out.push(row[c.col].clone());
    }
    Some(out)
}

/// Child-side check on insert and update: every fully non-null foreign key
/// must exist in the parent's referenced index.
pub fn check_child(db: &DB, table: &Table, values: &[Value]) -> Result<()> {
    for rel in rels_where(db, |r| r.child_table == table.id) {
        let child_data = match table.index_data.get(rel.child_index) {
            Some(d) => d,
            None => continue,
        };
        let Some(key_vals) = project(child_data, values) else {
            continue;
        };
        let parent = db.table_by_id(rel.parent_table)?;
        let parent_data = parent
            .index_data
            .get(rel.parent_index)
            .ok_or_else(|| Error::corrupt(format!("relationship '{}' index missing", rel.name)))?;
        let key = parent_data.key_from_values(&key_vals)?;
        if !parent_data.contains_key(&db.file, &key)? {
            return Err(Error::ReferentialIntegrityViolation {
                relationship: rel.name.clone(),
            });
        }
    }
    Ok(())
}

/// Parent-side pre-check on delete: relationships without a delete action
/// restrict the delete while child rows exist.
pub fn check_parent_restrict(db: &DB, table: &Table, values: &[Value]) -> Result<()> {
    for rel in rels_where(db, |r| {
        r.parent_table == table.id && !r.cascade_deletes() && !r.cascade_null()
    }) {
        let parent_data = match table.index_data.get(rel.parent_index) {
            Some(d) => d,
            None => continue,
        };
        let Some(key_vals) = project(parent_data, values) else {
            continue;
        };
        let child = db.table_by_id(rel.child_table)?;
        let child_data = child
            .index_data
            .get(rel.child_index)
            .ok_or_else(|| Error::corrupt(format!("relationship '{}' index missing", rel.name)))?;
        let prefix = child_data.key_from_values(&key_vals)?;
        if !matching_rows(&db.file, child_data, &prefix)?.is_empty() {
            return Err(Error::ReferentialIntegrityViolation {
                relationship: rel.name.clone(),
            });
        }
    }
    Ok(())
}

/// Fire delete cascades for a removed parent row, depth first within the
/// caller's write barrier. At the cascade root, any error rolls the
/// barrier back.
pub fn cascade_parent_delete(
    db: &DB,
    table: &Rc<Table>,
    values: &[Value],
    path: &mut Vec<i32>,
) -> Result<()> {
    let root = path.is_empty();
    let r = cascade_delete_impl(db, table, values, path);
    if r.is_err() && root {
        db.rollback()?;
    }
    r
}

fn cascade_delete_impl(
    db: &DB,
    table: &Rc<Table>,
    values: &[Value],
    path: &mut Vec<i32>,
) -> Result<()> {
    for rel in rels_where(db, |r| {
        r.parent_table == table.id && (r.cascade_deletes() || r.cascade_null())
    }) {
        if path.contains(&rel.id) {
            return Err(Error::CascadeCycle(rel.name.clone()));
        }
        let parent_data = match table.index_data.get(rel.parent_index) {
            Some(d) => d,
            None => continue,
        };
        let Some(key_vals) = project(parent_data, values) else {
            continue;
        };
        let child = db.table_by_id(rel.child_table)?;
        let child_data = child
            .index_data
            .get(rel.child_index)
            .ok_or_else(|| Error::corrupt(format!("relationship '{}' index missing", rel.name)))?;
        let prefix = child_data.key_from_values(&key_vals)?;
        let rows = matching_rows(&db.file, child_data, &prefix)?;

        path.push(rel.id);
        let fk_cols: Vec<usize> = child_data.cols.iter().map(|c| c.col).collect();
        for rowid in rows {
            if rel.cascade_deletes() {
                child.delete_inner(db, rowid, path)?;
            } else {
                let mut row = match child.get_row(db, rowid)? {
                    Some(r) => r,
                    None => continue,
                };
                for c in &fk_cols {
                    row[*c] = Value::Null;
                }
                child.update_inner(db, rowid, &mut row, path)?;
            }
        }
        path.pop();
    }
    Ok(())
}

/// Propagate ( or restrict ) a parent key change. At the cascade root, any
/// error rolls the barrier back.
pub fn cascade_parent_update(
    db: &DB,
    table: &Rc<Table>,
    old: &[Value],
    new: &[Value],
    path: &mut Vec<i32>,
) -> Result<()> {
    let root = path.is_empty();
    let r = cascade_update_impl(db, table, old, new, path);
    if r.is_err() && root {
        db.rollback()?;
    }
    r
}

fn cascade_update_impl(
    db: &DB,
    table: &Rc<Table>,
    old: &[Value],
    new: &[Value],
    path: &mut Vec<i32>,
) -> Result<()> {
    for rel in rels_where(db, |r| r.parent_table == table.id) {
        let parent_data = match table.index_data.get(rel.parent_index) {
            Some(d) => d,
            None => continue,
        };
        let old_key = project(parent_data, old);
        let new_key = project(parent_data, new);
        if old_key == new_key {
            continue;
        }
        let Some(old_vals) = old_key else { continue };
        if path.contains(&rel.id) {
            return Err(Error::CascadeCycle(rel.name.clone()));
        }
        let child = db.table_by_id(rel.child_table)?;
        let child_data = child
            .index_data
            .get(rel.child_index)
            .ok_or_else(|| Error::corrupt(format!("relationship '{}' index missing", rel.name)))?;
        let prefix = child_data.key_from_values(&old_vals)?;
        let rows = matching_rows(&db.file, child_data, &prefix)?;
        if rows.is_empty() {
            continue;
        }
        if !rel.cascade_updates() {
            return Err(Error::ReferentialIntegrityViolation {
                relationship: rel.name.clone(),
            });
        }
        path.push(rel.id);
        let fk_cols: Vec<usize> = child_data.cols.iter().map(|c| c.col).collect();
        let parent_cols: Vec<usize> = parent_data.cols.iter().map(|c| c.col).collect();
        for rowid in rows {
            let mut row = match child.get_row(db, rowid)? {
                Some(r) => r,
                None => continue,
            };
            for (fc, pc) in fk_cols.iter().zip(parent_cols.iter()) {
                row[*fc] = new[*pc].clone();
            }
            child.update_inner(db, rowid, &mut row, path)?;
        }
        path.pop();
    }
    Ok(())
}
