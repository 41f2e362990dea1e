use crate::*;

/// Pluggable column comparison for match-pattern iteration.
pub trait ColumnMatcher {
    /// Whether the stored value matches the expected value.
    fn matches(&self, table: &Table, col: usize, actual: &Value, expected: &Value) -> bool;
}

/// Exact comparison.
pub struct SimpleColumnMatcher;

impl ColumnMatcher for SimpleColumnMatcher {
    fn matches(&self, _table: &Table, _col: usize, actual: &Value, expected: &Value) -> bool {
        actual == expected
    }
}

/// Case-insensitive comparison for text, exact otherwise.
pub struct CaseInsensitiveColumnMatcher;

impl ColumnMatcher for CaseInsensitiveColumnMatcher {
    fn matches(&self, _table: &Table, _col: usize, actual: &Value, expected: &Value) -> bool {
        match (actual, expected) {
            (Value::Text(a), Value::Text(b)) => a.to_lowercase() == b.to_lowercase(),
            _ => actual == expected,
        }
    }
}

/// Cursor life cycle. A cursor positioned on a row that is deleted under
/// it keeps serving the cached snapshot; `is_current_row_deleted` reports
/// the live state and `move_next` proceeds from the deletion point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CursorState {
    ///
    BeforeFirst,
    ///
    OnRow,
    ///
    AfterLast,
}

enum Kind {
    /// Physical page order.
    Scan,
    /// Bound to an index.
    Index(IndexCursor),
}

/// A stable position over a live, mutating table.
pub struct Cursor {
    ///
    pub table: TablePtr,
    kind: Kind,
    state: CursorState,
    /// Cached ( row id, values ) snapshot of the current row.
    current: Option<(RowId, Vec<Value>)>,
}

/// Saved cursor position, a value type with no resource ownership.
#[derive(Clone)]
pub struct Savepoint {
    table_id: i32,
    state: CursorState,
    scan_at: Option<RowId>,
    index_sp: Option<IndexSavepoint>,
}

impl Cursor {
    /// Cursor in physical page order.
    pub fn scan(table: TablePtr) -> Cursor {
        Cursor {
            table,
            kind: Kind::Scan,
            state: CursorState::BeforeFirst,
            current: None,
        }
    }

    /// Cursor bound to the named logical index.
    pub fn index(table: TablePtr, index_name: &str) -> Result<Cursor> {
        let l = table.find_index(index_name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "no index '{}' on table '{}'",
                index_name, table.name
            ))
        })?;
        let data = table.data_of(l);
        Ok(Cursor {
            table,
            kind: Kind::Index(IndexCursor::new(data)),
            state: CursorState::BeforeFirst,
            current: None,
        })
    }

    /// Cursor bound to the primary key.
    pub fn primary(table: TablePtr) -> Result<Cursor> {
        let data = table.primary_data().ok_or_else(|| {
            Error::InvalidArgument(format!("table '{}' has no primary key", table.name))
        })?;
        Ok(Cursor {
            table,
            kind: Kind::Index(IndexCursor::new(data)),
            state: CursorState::BeforeFirst,
            current: None,
        })
    }

    ///
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Reset before the first row.
    pub fn before_first(&mut self) {
        self.state = CursorState::BeforeFirst;
        self.current = None;
        if let Kind::Index(ic) = &mut self.kind {
            ic.before_first();
        }
    }

    /// Reset after the last row.
    pub fn after_last(&mut self) {
        self.state = CursorState::AfterLast;
        self.current = None;
        if let Kind::Index(ic) = &mut self.kind {
            ic.after_last();
        }
    }

    /// Current row id.
    pub fn current_rowid(&self) -> Option<RowId> {
        self.current.as_ref().map(|(r, _)| *r)
    }

    /// Cached snapshot of the current row, served even if the row has been
    /// deleted since the cursor arrived on it.
    pub fn current_row(&self) -> Option<&[Value]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    /// Live tombstone state of the current row.
    pub fn is_current_row_deleted(&self, db: &DB) -> Result<bool> {
        match &self.current {
            Some((rowid, _)) => self.table.is_deleted(db, *rowid),
            None => Ok(false),
        }
    }

    fn arrive(&mut self, db: &DB, rowid: RowId) -> Result<bool> {
        match self.table.get_row(db, rowid)? {
            Some(values) => {
                self.current = Some((rowid, values));
                self.state = CursorState::OnRow;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Scan order: next live slot after the given position, re-validated
    /// against the usage map and row-offset table on every step.
    fn scan_next_from(&self, db: &DB, from: Option<RowId>) -> Result<Option<RowId>> {
        let pages = self.table.data_map.snapshot();
        let (start_page, start_slot) = match from {
            Some(r) => (r.page, Some(r.slot)),
            None => (0, None),
        };
        for pnum in pages {
            if pnum < start_page {
                continue;
            }
            for rid in self.table.live_rows_on(db, pnum)? {
                if pnum == start_page {
                    if let Some(s) = start_slot {
                        if rid.slot <= s {
                            continue;
                        }
                    }
                }
                return Ok(Some(rid));
            }
        }
        Ok(None)
    }

    fn scan_prev_from(&self, db: &DB, from: Option<RowId>) -> Result<Option<RowId>> {
        let pages = self.table.data_map.snapshot();
        let mut best: Option<RowId> = None;
        for pnum in pages {
            if let Some(f) = from {
                if pnum > f.page {
                    break;
                }
            }
            for rid in self.table.live_rows_on(db, pnum)? {
                if let Some(f) = from {
                    if rid.page == f.page && rid.slot >= f.slot {
                        continue;
                    }
                }
                best = Some(rid);
            }
        }
        Ok(best)
    }

    /// One step of the underlying index cursor, returning the row id it
    /// lands on.
    fn index_step(&mut self, db: &DB, forward: bool) -> Result<Option<RowId>> {
        let ic = match &mut self.kind {
            Kind::Index(ic) => ic,
            Kind::Scan => unreachable!(),
        };
        let stepped = if forward {
            ic.move_next(&db.file)?
        } else {
            ic.move_previous(&db.file)?
        };
        if !stepped {
            return Ok(None);
        }
        Ok(ic.current().map(|(_, r)| r))
    }

    /// Move to the next row. Returns false at the end.
    pub fn move_next(&mut self, db: &DB) -> Result<bool> {
        db.file.check()?;
        if matches!(self.kind, Kind::Scan) {
            if self.state == CursorState::AfterLast {
                return Ok(false);
            }
            let from = match self.state {
                CursorState::BeforeFirst => None,
                _ => self.current_rowid(),
            };
            return match self.scan_next_from(db, from)? {
                Some(rid) => self.arrive(db, rid),
                None => {
                    self.state = CursorState::AfterLast;
                    self.current = None;
                    Ok(false)
                }
            };
        }
        loop {
            match self.index_step(db, true)? {
                Some(rowid) => {
                    if self.arrive(db, rowid)? {
                        return Ok(true);
                    }
                }
                None => break,
            }
        }
        self.state = CursorState::AfterLast;
        self.current = None;
        Ok(false)
    }

    /// Move to the previous row. Returns false at the start.
    pub fn move_previous(&mut self, db: &DB) -> Result<bool> {
        db.file.check()?;
        if matches!(self.kind, Kind::Scan) {
            if self.state == CursorState::BeforeFirst {
                return Ok(false);
            }
            let from = match self.state {
                CursorState::AfterLast => None,
                _ => self.current_rowid(),
            };
            let got = match self.state {
                CursorState::AfterLast => {
                    // Last live row overall.
                    let mut last = None;
                    let mut at = None;
                    loop {
                        match self.scan_next_from(db, at)? {
                            Some(r) => {
                                last = Some(r);
                                at = Some(r);
                            }
                            None => break,
                        }
                    }
                    last
                }
                _ => self.scan_prev_from(db, from)?,
            };
            return match got {
                Some(rid) => self.arrive(db, rid),
                None => {
                    self.state = CursorState::BeforeFirst;
                    self.current = None;
                    Ok(false)
                }
            };
        }
        loop {
            match self.index_step(db, false)? {
                Some(rowid) => {
                    if self.arrive(db, rowid)? {
                        return Ok(true);
                    }
                }
                None => break,
            }
        }
        self.state = CursorState::BeforeFirst;
        self.current = None;
        Ok(false)
    }

    /// Take a savepoint of the current position.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            table_id: self.table.id,
            state: self.state,
            scan_at: self.current_rowid(),
            index_sp: match &self.kind {
                Kind::Index(ic) => Some(ic.savepoint()),
                Kind::Scan => None,
            },
        }
    }

    /// Restore a savepoint taken from a cursor over the same table and
    /// index. If the saved row is gone, the cursor lands on the next
    /// surviving row.
    pub fn restore(&mut self, db: &DB, sp: &Savepoint) -> Result<()> {
        if sp.table_id != self.table.id {
            return Err(Error::SavepointMismatch);
        }
        match (matches!(self.kind, Kind::Scan), &sp.index_sp) {
            (false, Some(isp)) => {
                let cur = {
                    let ic = match &mut self.kind {
                        Kind::Index(ic) => ic,
                        Kind::Scan => unreachable!(),
                    };
                    ic.restore(&db.file, isp)?;
                    ic.current().map(|(_, r)| r)
                };
                match cur {
                    Some(rowid) => {
                        if !self.arrive(db, rowid)? {
                            self.move_next(db)?;
                        }
                    }
                    None => {
                        self.state = sp.state;
                        self.current = None;
                    }
                }
                Ok(())
            }
            (true, None) => {
                match sp.scan_at {
                    Some(rowid) => {
                        if self.table.is_deleted(db, rowid)? {
                            // Next surviving row after the saved position.
                            match self.scan_next_from(db, Some(rowid))? {
                                Some(rid) => {
                                    self.arrive(db, rid)?;
                                }
                                None => {
                                    self.state = CursorState::AfterLast;
                                    self.current = None;
                                }
                            }
                        } else {
                            self.arrive(db, rowid)?;
                        }
                    }
                    None => {
                        self.state = sp.state;
                        self.current = None;
                    }
                }
                Ok(())
            }
            _ => Err(Error::SavepointMismatch),
        }
    }

    // -----------------------------------------------------------------
    // Index entry lookups

    fn index_data(&self) -> Result<IndexDataPtr> {
        match &self.kind {
            Kind::Index(ic) => Ok(ic.data.clone()),
            Kind::Scan => Err(Error::InvalidArgument(
                "cursor is not bound to an index".to_string(),
            )),
        }
    }

    /// Position on the first row whose leading index columns equal the
    /// given values exactly. Returns false when there is no match.
    pub fn find_first_row_by_entry(&mut self, db: &DB, vals: &[Value]) -> Result<bool> {
        let data = self.index_data()?;
        let prefix = data.key_from_values(vals)?;
        let hit = {
            let ic = match &mut self.kind {
                Kind::Index(ic) => ic,
                Kind::Scan => unreachable!(),
            };
            if !ic.seek(&db.file, &prefix)? {
                None
            } else {
                match ic.current() {
                    Some((k, r)) if k.starts_with(&prefix) => Some(r),
                    _ => None,
                }
            }
        };
        match hit {
            Some(rowid) => self.arrive(db, rowid),
            None => {
                self.state = CursorState::AfterLast;
                self.current = None;
                Ok(false)
            }
        }
    }

    /// Position on the first row whose key is >= the given values.
    pub fn find_closest_row_by_entry(&mut self, db: &DB, vals: &[Value]) -> Result<bool> {
        let data = self.index_data()?;
        let prefix = data.key_from_values(vals)?;
        let hit = {
            let ic = match &mut self.kind {
                Kind::Index(ic) => ic,
                Kind::Scan => unreachable!(),
            };
            if !ic.seek(&db.file, &prefix)? {
                None
            } else {
                ic.current().map(|(_, r)| r)
            }
        };
        match hit {
            Some(rowid) => self.arrive(db, rowid),
            None => {
                self.state = CursorState::AfterLast;
                self.current = None;
                Ok(false)
            }
        }
    }

    /// Row ids of every row matching the ( possibly partial ) key, in
    /// index order.
    pub fn entry_rows(&mut self, db: &DB, vals: &[Value]) -> Result<Vec<RowId>> {
        let data = self.index_data()?;
        let prefix = data.key_from_values(vals)?;
        let mut out = Vec::new();
        match &mut self.kind {
            Kind::Index(ic) => {
                if !ic.seek(&db.file, &prefix)? {
                    return Ok(out);
                }
                loop {
                    let (key, rowid) = match ic.current() {
                        Some((k, r)) => (k.to_vec(), r),
                        None => break,
                    };
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    out.push(rowid);
                    if !ic.move_next(&db.file)? {
                        break;
                    }
                }
            }
            Kind::Scan => unreachable!(),
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Match-pattern iteration

    /// Advance to the next row for which every ( column, expected ) pair
    /// matches under the given matcher.
    pub fn move_next_matching(
        &mut self,
        db: &DB,
        pattern: &[(String, Value)],
        matcher: &dyn ColumnMatcher,
    ) -> Result<bool> {
        let cols: Vec<usize> = pattern
            .iter()
            .map(|(name, _)| {
                self.table.info.get(name).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no column '{}' in table '{}'",
                        name, self.table.name
                    ))
                })
            })
            .collect::<Result<_>>()?;
        while self.move_next(db)? {
            let row = self.current_row().unwrap_or(&[]);
            let all = cols
                .iter()
                .zip(pattern.iter())
                .all(|(c, (_, want))| matcher.matches(&self.table, *c, &row[*c], want));
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Linear scan from the start for the first matching row.
    pub fn find_first_row(
        &mut self,
        db: &DB,
        pattern: &[(String, Value)],
        matcher: &dyn ColumnMatcher,
    ) -> Result<bool> {
        self.before_first();
        self.move_next_matching(db, pattern, matcher)
    }
}
