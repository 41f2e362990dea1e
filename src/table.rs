use crate::*;

/// Per-column metadata, immutable once the table is persisted.
#[derive(Clone, Debug)]
pub struct Column {
    ///
    pub name: String,
    ///
    pub typ: DataType,
    /// Ordinal position, fixed at table creation.
    pub ordinal: usize,
    /// Declared payload length in bytes for text / binary columns.
    pub declared_len: u16,
    ///
    pub precision: u8,
    ///
    pub scale: u8,
    /// Value lives in the variable-length region.
    pub variable: bool,
    ///
    pub auto_number: bool,
    ///
    pub nullable: bool,
    /// Compressed-unicode opt-in for text.
    pub compressed: bool,
    /// Placeholder retained for a dropped column.
    pub dropped: bool,
    /// Offset in the fixed region ( fixed columns ).
    pub fixed_off: usize,
    /// Position among variable columns ( variable columns ).
    pub var_index: usize,
    /// Default-value expression, evaluated by the external evaluator.
    pub default_expr: Option<String>,
    /// Calculated-column expression.
    pub calc_expr: Option<String>,
    /// Column validation rule.
    pub validation: Option<String>,
}

impl Column {
    /// Size of this column's slot in the fixed region.
    pub fn fixed_size(&self) -> usize {
        match self.typ.intrinsic_size() {
            Some(n) => n,
            // Fixed text / binary: u16 payload length plus payload space.
            None => self.declared_len as usize + 2,
        }
    }
}

/// Column layout information for a table.
#[derive(Clone, Debug, Default)]
pub struct ColInfo {
    ///
    pub cols: Vec<Column>,
    /// Lower-case name to ordinal.
    pub colmap: BTreeMap<String, usize>,
    /// Total size of the fixed region.
    pub fixed_total: usize,
    /// Number of variable-length columns.
    pub var_count: usize,
    /// Row-level validation rule.
    pub row_validation: Option<String>,
}

impl ColInfo {
    /// Column ordinal from a name ( case-insensitive ).
    pub fn get(&self, name: &str) -> Option<usize> {
        self.colmap.get(&name.to_lowercase()).copied()
    }

    fn null_bytes(&self) -> usize {
        (self.cols.len() + 7) / 8
    }
}

/// Column description for table creation.
#[derive(Clone)]
pub struct ColumnSpec {
    ///
    pub name: String,
    ///
    pub typ: DataType,
    /// Payload length in bytes for text / binary ( default 510 ).
    pub len: Option<u16>,
    ///
    pub precision: u8,
    ///
    pub scale: u8,
    /// Store text / binary in the fixed region.
    pub fixed: bool,
    ///
    pub auto_number: bool,
    ///
    pub nullable: bool,
    ///
    pub compressed: bool,
}

impl ColumnSpec {
    ///
    pub fn new(name: &str, typ: DataType) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            typ,
            len: None,
            precision: 18,
            scale: 0,
            fixed: false,
            auto_number: false,
            nullable: true,
            compressed: true,
        }
    }
}

/// Index description for table creation.
#[derive(Clone)]
pub struct IndexSpec {
    ///
    pub name: String,
    /// ( column name, descending ) pairs.
    pub cols: Vec<(String, bool)>,
    ///
    pub unique: bool,
    ///
    pub primary: bool,
    ///
    pub ignore_nulls: bool,
}

impl IndexSpec {
    /// Ascending index over the named columns.
    pub fn new(name: &str, cols: &[&str]) -> IndexSpec {
        IndexSpec {
            name: name.to_string(),
            cols: cols.iter().map(|c| (c.to_string(), false)).collect(),
            unique: false,
            primary: false,
            ignore_nulls: false,
        }
    }

    /// Primary key over the named columns.
    pub fn primary(name: &str, cols: &[&str]) -> IndexSpec {
        IndexSpec {
            name: name.to_string(),
            cols: cols.iter().map(|c| (c.to_string(), false)).collect(),
            unique: true,
            primary: true,
            ignore_nulls: false,
        }
    }
}

/// Table description for creation.
#[derive(Clone)]
pub struct TableSpec {
    ///
    pub name: String,
    ///
    pub columns: Vec<ColumnSpec>,
    ///
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    ///
    pub fn new(name: &str) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }
}

/// Database base table: column layout, index list, usage maps and row
/// bookkeeping. The descriptor persists on a chain of TABLE_DEF pages.
pub struct Table {
    /// Object id in the system catalog.
    pub id: i32,
    ///
    pub name: String,
    /// Primary definition page.
    pub def_page: u32,
    ///
    pub info: ColInfo,
    /// Backing B-trees, shared between logical indexes.
    pub index_data: Vec<IndexDataPtr>,
    ///
    pub logical: Vec<LogicalIndex>,
    /// Pages holding this table's rows.
    pub data_map: UsageMap,
    /// Data pages with spare room.
    pub free_map: UsageMap,
    /// Long-value pages.
    pub lval_map: UsageMap,
    ///
    pub row_count: Cell<u32>,
    /// Next LONG auto-number value.
    pub next_auto: Cell<i32>,
    ///
    pub system: bool,
    /// Data operations fail on ODBC-linked tables.
    pub read_only: Cell<bool>,
}

///
pub type TablePtr = Rc<Table>;

// Data page: [tag][unused][table id u32][nrows u16][data_end u16][unused u16]
// Row cells are length prefixed; the slot table grows back from the page
// tail, one u16 per slot. Bit 15 of a slot is the tombstone flag.
const SLOT_DEL: u16 = 0x8000;
const SLOT_OFF_MASK: u16 = 0x3FFF;

/// Payloads up to this size stay inline in the row's long-value cell.
const LVAL_INLINE_MAX: usize = 32;

const LVAL_INLINE: u32 = 0x8000_0000;
const LVAL_SINGLE: u32 = 0x4000_0000;
const LVAL_LEN_MASK: u32 = 0x3FFF_FFFF;

fn page_init(ps: usize, table_id: i32) -> Vec<u8> {
    let mut buf = vec![0u8; ps];
    buf[0] = PageType::Data as u8;
    util::setu32(&mut buf, 2, table_id as u32);
    util::setu16(&mut buf, 6, 0);
    util::setu16(&mut buf, 8, DATA_HDR as u16);
    buf
}

fn page_nrows(data: &[u8]) -> usize {
    util::getu16(data, 6) as usize
}

fn page_free_space(data: &[u8], ps: usize) -> usize {
    let nrows = page_nrows(data);
    let data_end = util::getu16(data, 8) as usize;
    let tail = ps - 2 * (nrows + 1);
    tail.saturating_sub(data_end)
}

fn slot_entry(data: &[u8], ps: usize, slot: usize) -> u16 {
    util::getu16(data, ps - 2 * (slot + 1))
}

fn set_slot_entry(data: &mut [u8], ps: usize, slot: usize, val: u16) {
    let off = ps - 2 * (slot + 1);
    util::setu16(data, off, val);
}

/// Append a cell, returning its slot number. Caller checks free space.
fn page_add_cell(data: &mut [u8], ps: usize, cell: &[u8]) -> u16 {
    let nrows = page_nrows(data);
    let data_end = util::getu16(data, 8) as usize;
    util::setu16(data, data_end, cell.len() as u16);
    data[data_end + 2..data_end + 2 + cell.len()].copy_from_slice(cell);
    set_slot_entry(data, ps, nrows, data_end as u16);
    util::setu16(data, 6, (nrows + 1) as u16);
    util::setu16(data, 8, (data_end + 2 + cell.len()) as u16);
    nrows as u16
}

/// Cell bytes for a slot, None when tombstoned.
fn page_cell(data: &[u8], ps: usize, slot: usize) -> Result<Option<&[u8]>> {
    if slot >= page_nrows(data) {
        return Err(Error::corrupt(format!("row slot {} out of range", slot)));
    }
    let e = slot_entry(data, ps, slot);
    if e & SLOT_DEL != 0 {
        return Ok(None);
    }
    let off = (e & SLOT_OFF_MASK) as usize;
    if off + 2 > ps {
        return Err(Error::corrupt("row offset outside page"));
    }
    let len = util::getu16(data, off) as usize;
    if off + 2 + len > ps {
        return Err(Error::corrupt("row extends outside page"));
    }
    Ok(Some(&data[off + 2..off + 2 + len]))
}

/// Mark a slot tombstoned. The slot is never reused until compaction.
fn page_delete_cell(data: &mut [u8], ps: usize, slot: usize) {
    let e = slot_entry(data, ps, slot);
    set_slot_entry(data, ps, slot, e | SLOT_DEL);
}

/// Replace a cell in place where the new bytes fit the old cell or the
/// page's free space; returns false when neither fits.
fn page_replace_cell(data: &mut [u8], ps: usize, slot: usize, cell: &[u8]) -> bool {
    let e = slot_entry(data, ps, slot);
    let off = (e & SLOT_OFF_MASK) as usize;
    let old_len = util::getu16(data, off) as usize;
    if cell.len() <= old_len {
        util::setu16(data, off, cell.len() as u16);
        data[off + 2..off + 2 + cell.len()].copy_from_slice(cell);
        return true;
    }
    let data_end = util::getu16(data, 8) as usize;
    let nrows = page_nrows(data);
    let tail = ps - 2 * (nrows + 1);
    if data_end + 2 + cell.len() > tail {
        return false;
    }
    util::setu16(data, data_end, cell.len() as u16);
    data[data_end + 2..data_end + 2 + cell.len()].copy_from_slice(cell);
    set_slot_entry(data, ps, slot, data_end as u16);
    util::setu16(data, 8, (data_end + 2 + cell.len()) as u16);
    true
}

// ---------------------------------------------------------------------
// Row image codec

struct VarCell {
    col: usize,
    bytes: Vec<u8>,
    /// Spillable long value payload not yet written to long-value pages.
    spill: Option<Vec<u8>>,
}

impl Table {
    fn lval_descriptor(flags: u32, len: usize, rowid: RowId) -> Vec<u8> {
        let mut d = vec![0u8; 12];
        util::setu32(&mut d, 0, flags | (len as u32 & LVAL_LEN_MASK));
        util::setu32(&mut d, 4, rowid.page);
        util::setu16(&mut d, 8, rowid.slot);
        d
    }

    /// Assemble the row image: column count, fixed region, variable region,
    /// then from the tail backwards the null bitmap, the variable count and
    /// the variable-offset table.
    fn encode_row(&self, db: &DB, values: &[Value]) -> Result<Vec<u8>> {
        let info = &self.info;
        let fmt = db.file.fmt();
        let mut fixed = vec![0u8; info.fixed_total];
        let mut nulls = vec![0u8; info.null_bytes()];
        let mut vars: Vec<VarCell> = Vec::new();

        for col in &info.cols {
            let val = &values[col.ordinal];
            if val.is_null() {
                if !col.nullable && !col.dropped {
                    return Err(Error::ConstraintViolation {
                        column: col.name.clone(),
                        reason: "null value in required column".to_string(),
                    });
                }
                continue;
            }
            nulls[col.ordinal / 8] |= 1 << (col.ordinal % 8);
            if col.variable {
                let payload = codec::encode_var(val, col.typ, col.compressed, &col.name)?;
                if col.typ.always_variable() {
                    // Long value: starts inline, may spill below.
                    if payload.len() <= LVAL_INLINE_MAX {
                        let mut cell =
                            Self::lval_descriptor(LVAL_INLINE, payload.len(), RowId::ZERO);
                        cell.extend_from_slice(&payload);
                        vars.push(VarCell {
                            col: col.ordinal,
                            bytes: cell,
                            spill: None,
                        });
                    } else {
                        vars.push(VarCell {
                            col: col.ordinal,
                            bytes: Vec::new(),
                            spill: Some(payload),
                        });
                    }
                } else {
                    if payload.len() > col.declared_len as usize {
                        return Err(Error::invalid(
                            &col.name,
                            "value exceeds declared column length",
                        ));
                    }
                    vars.push(VarCell {
                        col: col.ordinal,
                        bytes: payload,
                        spill: None,
                    });
                }
            } else {
                let off = col.fixed_off;
                match col.typ {
                    DataType::Text => {
                        let s = val.as_str().ok_or_else(|| {
                            Error::invalid(&col.name, "value does not fit type Text")
                        })?;
                        codec::encode_text_slot(
                            s,
                            col.compressed,
                            &mut fixed[off..off + col.fixed_size()],
                        )
                        .map_err(|_| {
                            Error::invalid(&col.name, "text exceeds declared column length")
                        })?;
                    }
                    DataType::Binary => {
                        let b = val.as_bytes().ok_or_else(|| {
                            Error::invalid(&col.name, "value does not fit type Binary")
                        })?;
                        if b.len() + 2 > col.fixed_size() {
                            return Err(Error::invalid(
                                &col.name,
                                "binary exceeds declared column length",
                            ));
                        }
                        util::setu16(&mut fixed[off..], 0, b.len() as u16);
                        fixed[off + 2..off + 2 + b.len()].copy_from_slice(b);
                    }
                    _ => {
                        let enc = codec::encode_fixed(val, col.typ, col.scale, &col.name)?;
                        fixed[off..off + enc.len()].copy_from_slice(&enc);
                    }
                }
            }
        }

        // Spill long values, largest first, until the row fits.
        let row_len = |vars: &[VarCell]| {
            2 + info.fixed_total
                + vars.iter().map(|v| v.bytes.len()).sum::<usize>()
                + 2 * (vars.len() + 1)
                + 2
                + info.null_bytes()
        };
        for v in vars.iter_mut() {
            if v.spill.is_some() && v.bytes.is_empty() {
                // Oversize long values spill unconditionally.
                let payload = v.spill.take().unwrap();
                v.bytes = self.write_lval(db, &payload)?;
            }
        }
        while row_len(&vars) > fmt.max_row_size {
            // Push the largest remaining long-value cell out of line.
            let mut pick: Option<usize> = None;
            for (i, v) in vars.iter().enumerate() {
                let inline_lval = v.bytes.len() > 12
                    && info.cols[v.col].typ.always_variable()
                    && util::getu32(&v.bytes, 0) & LVAL_INLINE != 0;
                if inline_lval {
                    if let Some(p) = pick {
                        if v.bytes.len() > vars[p].bytes.len() {
                            pick = Some(i);
                        }
                    } else {
                        pick = Some(i);
                    }
                }
            }
            let Some(p) = pick else {
                return Err(Error::invalid("", "row exceeds maximum row size"));
            };
            let payload = vars[p].bytes[12..].to_vec();
            vars[p].bytes = self.write_lval(db, &payload)?;
        }

        // Sort variable cells by variable index so decode can map them back.
        vars.sort_by_key(|v| info.cols[v.col].var_index);

        let mut row = Vec::with_capacity(row_len(&vars));
        row.extend_from_slice(&(info.cols.len() as u16).to_le_bytes());
        row.extend_from_slice(&fixed);
        let mut offsets = Vec::with_capacity(vars.len() + 1);
        for v in &vars {
            offsets.push(row.len() as u16);
            row.extend_from_slice(&v.bytes);
        }
        offsets.push(row.len() as u16);
        for off in &offsets {
            row.extend_from_slice(&off.to_le_bytes());
        }
        row.extend_from_slice(&(vars.len() as u16).to_le_bytes());
        row.extend_from_slice(&nulls);
        Ok(row)
    }

    /// Decode a row image back into values, following long-value chains.
    pub(crate) fn decode_row(&self, db: &DB, cell: &[u8]) -> Result<Vec<Value>> {
        let info = &self.info;
        let nb = info.null_bytes();
        if cell.len() < 2 + info.fixed_total + 2 + 2 + nb {
            return Err(Error::corrupt("row image too short"));
        }
        let ncols = util::getu16(cell, 0) as usize;
        if ncols != info.cols.len() {
            return Err(Error::corrupt("row column count mismatch"));
        }
        let nulls = &cell[cell.len() - nb..];
        let var_count = util::getu16(cell, cell.len() - nb - 2) as usize;
        let off_base = cell.len() - nb - 2 - 2 * (var_count + 1);
        let offsets: Vec<usize> = (0..=var_count)
            .map(|i| util::getu16(cell, off_base + 2 * i) as usize)
            .collect();

        let mut values = vec![Value::Null; info.cols.len()];
        let mut var_rank = 0usize;
        for col in info.cols.iter() {
            let present = nulls[col.ordinal / 8] & (1 << (col.ordinal % 8)) != 0;
            if !present {
                continue;
            }
            if col.variable {
                if var_rank >= var_count {
                    return Err(Error::corrupt("variable offset table truncated"));
                }
                let (s, e) = (offsets[var_rank], offsets[var_rank + 1]);
                var_rank += 1;
                if s > e || e > off_base {
                    return Err(Error::corrupt("bad variable offset entry"));
                }
                let data = &cell[s..e];
                values[col.ordinal] = if col.typ.always_variable() {
                    let payload = self.read_lval(db, data)?;
                    codec::decode_var(&payload, col.typ)?
                } else {
                    codec::decode_var(data, col.typ)?
                };
            } else {
                let off = 2 + col.fixed_off;
                let slot = &cell[off..off + col.fixed_size()];
                values[col.ordinal] = match col.typ {
                    DataType::Text => Value::Text(Rc::new(codec::decode_text_slot(slot)?)),
                    DataType::Binary => {
                        let len = util::getu16(slot, 0) as usize;
                        if len + 2 > slot.len() {
                            return Err(Error::corrupt("binary slot length exceeds slot"));
                        }
                        Value::Binary(Rc::new(slot[2..2 + len].to_vec()))
                    }
                    _ => codec::decode_fixed(slot, col.typ, col.scale)?,
                };
            }
        }
        Ok(values)
    }

    // -----------------------------------------------------------------
    // Long value storage

    /// Write a long value payload, returning the 12-byte descriptor cell.
    fn write_lval(&self, db: &DB, payload: &[u8]) -> Result<Vec<u8>> {
        let ps = db.file.page_size();
        let cap = ps - DATA_HDR - 2 - 2;
        if payload.len() <= cap {
            let rowid = self.lval_add(db, payload)?;
            return Ok(Self::lval_descriptor(LVAL_SINGLE, payload.len(), rowid));
        }
        // Chain: each row is a 6-byte next reference plus a chunk, written
        // tail first so each row knows its successor.
        let chunk = cap - 6;
        let mut next = RowId::ZERO;
        let chunks: Vec<&[u8]> = payload.chunks(chunk).collect();
        for part in chunks.iter().rev() {
            let mut row = Vec::with_capacity(6 + part.len());
            row.extend_from_slice(&next.to_le6());
            row.extend_from_slice(part);
            next = self.lval_add(db, &row)?;
        }
        Ok(Self::lval_descriptor(0, payload.len(), next))
    }

    /// Read a long value from its descriptor cell.
    fn read_lval(&self, db: &DB, cell: &[u8]) -> Result<Vec<u8>> {
        if cell.len() < 12 {
            return Err(Error::corrupt("short long-value descriptor"));
        }
        let word = util::getu32(cell, 0);
        let len = (word & LVAL_LEN_MASK) as usize;
        let flags = word & !LVAL_LEN_MASK;
        if flags == LVAL_INLINE {
            if cell.len() < 12 + len {
                return Err(Error::corrupt("inline long value truncated"));
            }
            return Ok(cell[12..12 + len].to_vec());
        }
        let rowid = RowId::new(util::getu32(cell, 4), util::getu16(cell, 8));
        if flags == LVAL_SINGLE {
            let row = self.lval_get(db, rowid)?;
            if row.len() < len {
                return Err(Error::corrupt("single long value truncated"));
            }
            return Ok(row[0..len].to_vec());
        }
        if flags != 0 {
            return Err(Error::UnknownEncoding(flags >> 30));
        }
        let mut out = Vec::with_capacity(len);
        let mut at = rowid;
        while at != RowId::ZERO {
            let row = self.lval_get(db, at)?;
            if row.len() < 6 {
                return Err(Error::corrupt("long value chain row too short"));
            }
            at = RowId::from_le6(&row[0..6]);
            out.extend_from_slice(&row[6..]);
        }
        if out.len() < len {
            return Err(Error::corrupt("long value chain truncated"));
        }
        out.truncate(len);
        Ok(out)
    }

    fn lval_add(&self, db: &DB, row: &[u8]) -> Result<RowId> {
        let ps = db.file.page_size();
        for pnum in self.lval_map.snapshot() {
            let data = db.file.read_page(pnum)?;
            if page_free_space(&data, ps) >= row.len() + 2 {
                let mut data = data;
                let buf = Arc::make_mut(&mut data);
                let slot = page_add_cell(buf, ps, row);
                db.file.write_page(pnum, data)?;
                return Ok(RowId::new(pnum, slot));
            }
        }
        let pnum = db.file.alloc_page()?;
        let mut buf = page_init(ps, self.id);
        let slot = page_add_cell(&mut buf, ps, row);
        db.file.write_page(pnum, Arc::new(buf))?;
        self.lval_map.add(&db.file, pnum)?;
        Ok(RowId::new(pnum, slot))
    }

    fn lval_get(&self, db: &DB, rowid: RowId) -> Result<Vec<u8>> {
        let data = db.file.read_page(rowid.page)?;
        expect_page(&data, rowid.page, PageType::Data)?;
        match page_cell(&data, db.file.page_size(), rowid.slot as usize)? {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(Error::corrupt("long value row deleted")),
        }
    }

    /// Free the long-value rows referenced by a row image.
    fn drop_lvals(&self, db: &DB, cell: &[u8]) -> Result<()> {
        let info = &self.info;
        let nb = info.null_bytes();
        let nulls = &cell[cell.len() - nb..];
        let var_count = util::getu16(cell, cell.len() - nb - 2) as usize;
        let off_base = cell.len() - nb - 2 - 2 * (var_count + 1);
        let mut var_rank = 0usize;
        for col in info.cols.iter() {
            let present = nulls[col.ordinal / 8] & (1 << (col.ordinal % 8)) != 0;
            if !present || !col.variable {
                continue;
            }
            let s = util::getu16(cell, off_base + 2 * var_rank) as usize;
            let e = util::getu16(cell, off_base + 2 * (var_rank + 1)) as usize;
            var_rank += 1;
            if !col.typ.always_variable() {
                continue;
            }
            let desc = &cell[s..e];
            let word = util::getu32(desc, 0);
            let flags = word & !LVAL_LEN_MASK;
            if flags == LVAL_INLINE {
                continue;
            }
            let mut at = RowId::new(util::getu32(desc, 4), util::getu16(desc, 8));
            let chained = flags == 0;
            while at != RowId::ZERO {
                let row = self.lval_get(db, at)?;
                let next = if chained && row.len() >= 6 {
                    RowId::from_le6(&row[0..6])
                } else {
                    RowId::ZERO
                };
                let mut data = db.file.read_page(at.page)?;
                let buf = Arc::make_mut(&mut data);
                page_delete_cell(buf, db.file.page_size(), at.slot as usize);
                db.file.write_page(at.page, data)?;
                at = next;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Definition pages

// TABLE_DEF page: [tag][unused][next u32][len u16][payload...]
const DEF_HDR: usize = 8;

const CF_VAR: u8 = 1;
const CF_AUTO: u8 = 2;
const CF_NULLABLE: u8 = 4;
const CF_COMPRESSED: u8 = 8;
const CF_DROPPED: u8 = 16;

const IF_UNIQUE: u8 = 1;
const IF_IGNORE_NULLS: u8 = 2;
const IF_PRIMARY: u8 = 4;
const IF_FK: u8 = 8;

const TF_SYSTEM: u8 = 1;

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_opt_str(out: &mut Vec<u8>, s: &Option<String>) {
    match s {
        Some(s) => {
            out.push(1);
            put_str(out, s);
        }
        None => out.push(0),
    }
}

struct DefReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> DefReader<'a> {
    fn need(&self, n: usize) -> Result<()> {
        if self.off + n > self.data.len() {
            return Err(Error::corrupt("truncated table definition"));
        }
        Ok(())
    }
    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let x = self.data[self.off];
        self.off += 1;
        Ok(x)
    }
    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let x = util::getu16(self.data, self.off);
        self.off += 2;
        Ok(x)
    }
    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let x = util::getu32(self.data, self.off);
        self.off += 4;
        Ok(x)
    }
    fn str(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        self.need(n)?;
        let s = std::str::from_utf8(&self.data[self.off..self.off + n])
            .map_err(|_| Error::corrupt("bad utf-8 in table definition"))?
            .to_string();
        self.off += n;
        Ok(s)
    }
    fn opt_str(&mut self) -> Result<Option<String>> {
        Ok(if self.u8()? != 0 {
            Some(self.str()?)
        } else {
            None
        })
    }
}

impl Table {
    fn def_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(if self.system { TF_SYSTEM } else { 0 });
        out.extend_from_slice(&self.row_count.get().to_le_bytes());
        out.extend_from_slice(&self.next_auto.get().to_le_bytes());
        out.extend_from_slice(&self.data_map.owner().page.to_le_bytes());
        out.extend_from_slice(&self.free_map.owner().page.to_le_bytes());
        out.extend_from_slice(&self.lval_map.owner().page.to_le_bytes());
        put_str(&mut out, &self.name);

        out.extend_from_slice(&(self.info.cols.len() as u16).to_le_bytes());
        for c in &self.info.cols {
            out.push(c.typ.ordinal());
            let mut f = 0u8;
            if c.variable {
                f |= CF_VAR;
            }
            if c.auto_number {
                f |= CF_AUTO;
            }
            if c.nullable {
                f |= CF_NULLABLE;
            }
            if c.compressed {
                f |= CF_COMPRESSED;
            }
            if c.dropped {
                f |= CF_DROPPED;
            }
            out.push(f);
            out.extend_from_slice(&c.declared_len.to_le_bytes());
            out.push(c.precision);
            out.push(c.scale);
            let pos = if c.variable { c.var_index } else { c.fixed_off };
            out.extend_from_slice(&(pos as u16).to_le_bytes());
            put_str(&mut out, &c.name);
            put_opt_str(&mut out, &c.default_expr);
            put_opt_str(&mut out, &c.calc_expr);
            put_opt_str(&mut out, &c.validation);
        }

        out.push(self.index_data.len() as u8);
        for d in &self.index_data {
            out.extend_from_slice(&d.root.get().to_le_bytes());
            out.push(d.cols.len() as u8);
            for c in &d.cols {
                out.extend_from_slice(&(c.col as u16).to_le_bytes());
                out.push(c.descending as u8);
            }
        }

        out.push(self.logical.len() as u8);
        for l in &self.logical {
            out.push(l.data_ord as u8);
            let mut f = 0u8;
            if l.unique {
                f |= IF_UNIQUE;
            }
            if l.ignore_nulls {
                f |= IF_IGNORE_NULLS;
            }
            if l.primary {
                f |= IF_PRIMARY;
            }
            if l.foreign_key.is_some() {
                f |= IF_FK;
            }
            out.push(f);
            if let Some(fk) = &l.foreign_key {
                out.extend_from_slice(&fk.parent_table.to_le_bytes());
                out.push(fk.parent_index as u8);
            }
            put_str(&mut out, &l.name);
        }

        put_opt_str(&mut out, &self.info.row_validation);
        out
    }

    /// Persist the descriptor across its chain of definition pages.
    pub fn save_def(&self, ch: &PageChannel) -> Result<()> {
        let payload = self.def_payload();
        let ps = ch.page_size();
        let cap = ps - DEF_HDR;
        let mut pnum = self.def_page;
        let mut off = 0usize;
        loop {
            let take = std::cmp::min(cap, payload.len() - off);
            let old = ch.read_page(pnum)?;
            let mut old_next = 0;
            if old[0] == PageType::TableDef as u8 {
                old_next = util::getu32(&old, 2);
            }
            let more = off + take < payload.len();
            let next = if more {
                if old_next != 0 {
                    old_next
                } else {
                    ch.alloc_page()?
                }
            } else {
                0
            };
            let mut buf = vec![0u8; ps];
            buf[0] = PageType::TableDef as u8;
            util::setu32(&mut buf, 2, next);
            util::setu16(&mut buf, 6, take as u16);
            buf[DEF_HDR..DEF_HDR + take].copy_from_slice(&payload[off..off + take]);
            ch.write_page(pnum, Arc::new(buf))?;
            off += take;
            if !more {
                // Free any leftover continuation pages.
                let mut p = old_next;
                while p != 0 && next == 0 {
                    let d = ch.read_page(p)?;
                    let nn = if d[0] == PageType::TableDef as u8 {
                        util::getu32(&d, 2)
                    } else {
                        0
                    };
                    ch.free_page(p)?;
                    p = nn;
                }
                return Ok(());
            }
            pnum = next;
        }
    }

    /// Load a table from its primary definition page.
    pub fn load(ch: &PageChannel, def_page: u32) -> Result<Table> {
        let mut payload = Vec::new();
        let mut pnum = def_page;
        while pnum != 0 {
            let data = ch.read_page(pnum)?;
            expect_page(&data, pnum, PageType::TableDef)?;
            let len = util::getu16(&data, 6) as usize;
            if DEF_HDR + len > data.len() {
                return Err(Error::corrupt("definition page length overflows"));
            }
            payload.extend_from_slice(&data[DEF_HDR..DEF_HDR + len]);
            pnum = util::getu32(&data, 2);
        }
        let mut r = DefReader {
            data: &payload,
            off: 0,
        };
        let id = r.u32()? as i32;
        let tflags = r.u8()?;
        let row_count = r.u32()?;
        let next_auto = r.u32()? as i32;
        let data_map_page = r.u32()?;
        let free_map_page = r.u32()?;
        let lval_map_page = r.u32()?;
        let name = r.str()?;

        let ncols = r.u16()? as usize;
        let mut info = ColInfo::default();
        for ordinal in 0..ncols {
            let typ = DataType::from_ordinal(r.u8()?)?;
            let f = r.u8()?;
            let declared_len = r.u16()?;
            let precision = r.u8()?;
            let scale = r.u8()?;
            let pos = r.u16()? as usize;
            let cname = r.str()?;
            let default_expr = r.opt_str()?;
            let calc_expr = r.opt_str()?;
            let validation = r.opt_str()?;
            let variable = f & CF_VAR != 0;
            let col = Column {
                name: cname.clone(),
                typ,
                ordinal,
                declared_len,
                precision,
                scale,
                variable,
                auto_number: f & CF_AUTO != 0,
                nullable: f & CF_NULLABLE != 0,
                compressed: f & CF_COMPRESSED != 0,
                dropped: f & CF_DROPPED != 0,
                fixed_off: if variable { 0 } else { pos },
                var_index: if variable { pos } else { 0 },
                default_expr,
                calc_expr,
                validation,
            };
            if variable {
                info.var_count += 1;
            } else {
                let end = col.fixed_off + col.fixed_size();
                if end > info.fixed_total {
                    info.fixed_total = end;
                }
            }
            info.colmap.insert(cname.to_lowercase(), ordinal);
            info.cols.push(col);
        }

        let n_data = r.u8()? as usize;
        let mut index_data = Vec::with_capacity(n_data);
        for ord in 0..n_data {
            let root = r.u32()?;
            let nc = r.u8()? as usize;
            let mut cols = Vec::with_capacity(nc);
            for _ in 0..nc {
                let cn = r.u16()? as usize;
                let desc = r.u8()? != 0;
                if cn >= info.cols.len() {
                    return Err(Error::corrupt("index column ordinal out of range"));
                }
                cols.push(IndexColumn {
                    col: cn,
                    typ: info.cols[cn].typ,
                    descending: desc,
                });
            }
            index_data.push(Rc::new(IndexData::new(
                ((id as u64) << 16) | ord as u64,
                root,
                cols,
            )));
        }

        let n_logical = r.u8()? as usize;
        let mut logical = Vec::with_capacity(n_logical);
        for _ in 0..n_logical {
            let data_ord = r.u8()? as usize;
            let f = r.u8()?;
            let foreign_key = if f & IF_FK != 0 {
                let parent_table = r.u32()? as i32;
                let parent_index = r.u8()? as usize;
                Some(ForeignKeyRef {
                    parent_table,
                    parent_index,
                })
            } else {
                None
            };
            let lname = r.str()?;
            if data_ord >= index_data.len() {
                return Err(Error::corrupt("logical index refers past index list"));
            }
            logical.push(LogicalIndex {
                name: lname,
                data_ord,
                unique: f & IF_UNIQUE != 0,
                ignore_nulls: f & IF_IGNORE_NULLS != 0,
                primary: f & IF_PRIMARY != 0,
                foreign_key,
            });
        }
        info.row_validation = r.opt_str()?;

        // Fold logical flags onto the shared index data.
        for l in &logical {
            let d = &index_data[l.data_ord];
            if l.unique {
                d.unique.set(true);
            }
            if l.ignore_nulls {
                d.ignore_nulls.set(true);
            }
            let mut n = d.name.borrow_mut();
            if n.is_empty() || l.primary {
                *n = l.name.clone();
            }
        }

        Ok(Table {
            id,
            name,
            def_page,
            info,
            index_data,
            logical,
            data_map: UsageMap::load(ch, MapOwner::new(data_map_page, 2), AllocMode::Normal)?,
            free_map: UsageMap::load(ch, MapOwner::new(free_map_page, 2), AllocMode::Normal)?,
            lval_map: UsageMap::load(ch, MapOwner::new(lval_map_page, 2), AllocMode::Normal)?,
            row_count: Cell::new(row_count),
            next_auto: Cell::new(next_auto),
            system: tflags & TF_SYSTEM != 0,
            read_only: Cell::new(false),
        })
    }

    fn alloc_map_page(ch: &PageChannel) -> Result<u32> {
        let (pnum, mut buf) = ch.alloc_typed(PageType::UsageMap)?;
        UsageMap::init_inline(&mut buf[2..], 2);
        ch.write_page(pnum, Arc::new(buf))?;
        Ok(pnum)
    }

    /// Create a new table from a spec. Must run inside a write barrier; the
    /// catalog row is written by the caller.
    pub fn create(ch: &PageChannel, id: i32, spec: &TableSpec, system: bool) -> Result<Table> {
        let mut info = ColInfo::default();
        for (ordinal, cs) in spec.columns.iter().enumerate() {
            if info.colmap.contains_key(&cs.name.to_lowercase()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate column name '{}'",
                    cs.name
                )));
            }
            if cs.auto_number && !matches!(cs.typ, DataType::Long | DataType::Guid) {
                return Err(Error::InvalidArgument(format!(
                    "auto-number column '{}' must be long or guid",
                    cs.name
                )));
            }
            if cs.typ == DataType::Numeric && (cs.precision > 28 || cs.scale > cs.precision) {
                return Err(Error::InvalidArgument(format!(
                    "numeric column '{}' precision/scale out of range",
                    cs.name
                )));
            }
            let sizable = matches!(cs.typ, DataType::Text | DataType::Binary);
            let variable = if cs.typ.always_variable() {
                true
            } else if sizable {
                !cs.fixed
            } else {
                false
            };
            let declared_len = cs.len.unwrap_or(if sizable { 510 } else { 0 });
            let mut col = Column {
                name: cs.name.clone(),
                typ: cs.typ,
                ordinal,
                declared_len,
                precision: cs.precision,
                scale: cs.scale,
                variable,
                auto_number: cs.auto_number,
                nullable: cs.nullable && !cs.auto_number,
                compressed: cs.compressed,
                dropped: false,
                fixed_off: 0,
                var_index: 0,
                default_expr: None,
                calc_expr: None,
                validation: None,
            };
            if variable {
                col.var_index = info.var_count;
                info.var_count += 1;
            } else {
                col.fixed_off = info.fixed_total;
                info.fixed_total += col.fixed_size();
            }
            info.colmap.insert(cs.name.to_lowercase(), ordinal);
            info.cols.push(col);
        }
        let overhead = 2 + info.fixed_total + 2 * (info.var_count + 1) + 2 + info.null_bytes();
        if overhead > ch.fmt().max_row_size {
            return Err(Error::InvalidArgument(
                "fixed row layout exceeds maximum row size".to_string(),
            ));
        }

        let mut index_data: Vec<IndexDataPtr> = Vec::new();
        let mut logical = Vec::new();
        for is in &spec.indexes {
            let mut cols = Vec::with_capacity(is.cols.len());
            for (cname, desc) in &is.cols {
                let ord = info.get(cname).ok_or_else(|| {
                    Error::InvalidArgument(format!("no column '{}' for index '{}'", cname, is.name))
                })?;
                cols.push(IndexColumn {
                    col: ord,
                    typ: info.cols[ord].typ,
                    descending: *desc,
                });
            }
            // Logical indexes over the same column set share one IndexData.
            let same = |d: &IndexDataPtr| {
                d.cols.len() == cols.len()
                    && d.cols
                        .iter()
                        .zip(cols.iter())
                        .all(|(a, b)| a.col == b.col && a.descending == b.descending)
            };
            let data_ord = match index_data.iter().position(same) {
                Some(i) => i,
                None => {
                    let root = IndexData::create_root(ch)?;
                    index_data.push(Rc::new(IndexData::new(
                        ((id as u64) << 16) | index_data.len() as u64,
                        root,
                        cols,
                    )));
                    index_data.len() - 1
                }
            };
            let unique = is.unique || is.primary;
            let d = &index_data[data_ord];
            if unique {
                d.unique.set(true);
            }
            if is.ignore_nulls {
                d.ignore_nulls.set(true);
            }
            let mut n = d.name.borrow_mut();
            if n.is_empty() || is.primary {
                *n = is.name.clone();
            }
            drop(n);
            logical.push(LogicalIndex {
                name: is.name.clone(),
                data_ord,
                unique,
                ignore_nulls: is.ignore_nulls,
                primary: is.primary,
                foreign_key: None,
            });
        }

        let def_page = ch.alloc_page()?;
        let table = Table {
            id,
            name: spec.name.clone(),
            def_page,
            info,
            index_data,
            logical,
            data_map: UsageMap::load(
                ch,
                MapOwner::new(Self::alloc_map_page(ch)?, 2),
                AllocMode::Normal,
            )?,
            free_map: UsageMap::load(
                ch,
                MapOwner::new(Self::alloc_map_page(ch)?, 2),
                AllocMode::Normal,
            )?,
            lval_map: UsageMap::load(
                ch,
                MapOwner::new(Self::alloc_map_page(ch)?, 2),
                AllocMode::Normal,
            )?,
            row_count: Cell::new(0),
            next_auto: Cell::new(1),
            system,
            read_only: Cell::new(false),
        };
        // The def page must exist before save_def reads it back.
        let mut fresh = vec![0u8; ch.page_size()];
        fresh[0] = PageType::TableDef as u8;
        ch.write_page(def_page, Arc::new(fresh))?;
        table.save_def(ch)?;
        Ok(table)
    }
}

// ---------------------------------------------------------------------
// Row operations

/// Pages with less spare room than this leave the free-space map.
const MIN_PAGE_FREE: usize = 64;

impl Table {
    /// A fresh all-null row with one slot per column.
    pub fn row(&self) -> Vec<Value> {
        vec![Value::Null; self.info.cols.len()]
    }

    /// Logical index by name ( case-insensitive ).
    pub fn find_index(&self, name: &str) -> Option<&LogicalIndex> {
        self.logical
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Backing B-tree of a logical index.
    pub fn data_of(&self, l: &LogicalIndex) -> IndexDataPtr {
        self.index_data[l.data_ord].clone()
    }

    /// The primary key's backing B-tree, if any.
    pub fn primary_data(&self) -> Option<IndexDataPtr> {
        self.logical
            .iter()
            .find(|l| l.primary)
            .map(|l| self.data_of(l))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.get() {
            return Err(Error::LinkedTableReadOnly(self.name.clone()));
        }
        Ok(())
    }

    /// Data page with room for `need` bytes, allocating one if no owned
    /// page fits.
    fn select_page(&self, db: &DB, need: usize) -> Result<u32> {
        let ps = db.file.page_size();
        for pnum in self.free_map.snapshot() {
            let data = db.file.read_page(pnum)?;
            let free = page_free_space(&data, ps);
            if free >= need + 2 {
                return Ok(pnum);
            }
            if free < MIN_PAGE_FREE {
                self.free_map.remove(&db.file, pnum)?;
            }
        }
        let pnum = db.file.alloc_page()?;
        db.file.write_page(pnum, Arc::new(page_init(ps, self.id)))?;
        self.data_map.add(&db.file, pnum)?;
        self.free_map.add(&db.file, pnum)?;
        Ok(pnum)
    }

    /// Read a row by id. None when the slot is tombstoned.
    pub fn get_row(&self, db: &DB, rowid: RowId) -> Result<Option<Vec<Value>>> {
        if !self.data_map.contains(rowid.page) {
            return Err(Error::InvalidArgument(format!(
                "row {:?} is not in table '{}'",
                rowid, self.name
            )));
        }
        let data = db.file.read_page(rowid.page)?;
        expect_page(&data, rowid.page, PageType::Data)?;
        match page_cell(&data, db.file.page_size(), rowid.slot as usize)? {
            Some(cell) => Ok(Some(self.decode_row(db, cell)?)),
            None => Ok(None),
        }
    }

    /// Whether the slot is tombstoned.
    pub fn is_deleted(&self, db: &DB, rowid: RowId) -> Result<bool> {
        let data = db.file.read_page(rowid.page)?;
        Ok(page_cell(&data, db.file.page_size(), rowid.slot as usize)?.is_none())
    }

    /// Insert a row. Auto-number columns are assigned here; on constraint
    /// failure the counter is restored and nothing is changed.
    pub fn insert_row(self: &Rc<Table>, db: &DB, values: &mut Vec<Value>) -> Result<RowId> {
        self.check_writable()?;
        if values.len() != self.info.cols.len() {
            return Err(Error::InvalidArgument(format!(
                "{} values supplied, table '{}' has {} columns",
                values.len(),
                self.name,
                self.info.cols.len()
            )));
        }
        db.with_write(|| {
            let auto_snapshot = self.next_auto.get();
            let r = self.insert_inner(db, values);
            if r.is_err() {
                self.next_auto.set(auto_snapshot);
            }
            r
        })
    }

    fn insert_inner(&self, db: &DB, values: &mut Vec<Value>) -> Result<RowId> {
        db.apply_insert_hooks(self, values)?;

        for col in &self.info.cols {
            if !col.auto_number {
                continue;
            }
            let v = &mut values[col.ordinal];
            match col.typ {
                DataType::Long => {
                    if v.is_null() {
                        let n = self.next_auto.get();
                        *v = Value::Int(n);
                        self.next_auto.set(n + 1);
                    } else if let Some(x) = v.as_int() {
                        // An explicit id bumps the allocator past itself.
                        if x as i32 >= self.next_auto.get() {
                            self.next_auto.set(x as i32 + 1);
                        }
                    }
                }
                DataType::Guid => {
                    if v.is_null() {
                        *v = Value::Guid(uuid::Uuid::new_v4());
                    }
                }
                _ => {}
            }
        }

        relation::check_child(db, self, values)?;

        let keys: Vec<Option<Vec<u8>>> = self
            .index_data
            .iter()
            .map(|d| d.key_from_row(values))
            .collect::<Result<_>>()?;
        for (d, key) in self.index_data.iter().zip(keys.iter()) {
            if d.unique.get() {
                if let Some(key) = key {
                    if d.contains_key(&db.file, key)? {
                        return Err(Error::UniquenessViolation {
                            index: d.name.borrow().clone(),
                        });
                    }
                }
            }
        }

        let cell = self.encode_row(db, values)?;
        let ps = db.file.page_size();
        let pnum = self.select_page(db, cell.len())?;
        let mut data = db.file.read_page(pnum)?;
        let buf = Arc::make_mut(&mut data);
        let slot = page_add_cell(buf, ps, &cell);
        let low = page_free_space(buf, ps) < MIN_PAGE_FREE;
        db.file.write_page(pnum, data)?;
        if low {
            self.free_map.remove(&db.file, pnum)?;
        }
        let rowid = RowId::new(pnum, slot);

        // An index failure here rolls the row write back within the barrier.
        let mut done = 0;
        for (d, key) in self.index_data.iter().zip(keys.iter()) {
            if let Some(key) = key {
                if let Err(e) = d.insert(&db.file, key, rowid) {
                    for (d2, key2) in self.index_data.iter().zip(keys.iter()).take(done) {
                        if let Some(key2) = key2 {
                            d2.delete(&db.file, key2, rowid)?;
                        }
                    }
                    let mut data = db.file.read_page(pnum)?;
                    let buf = Arc::make_mut(&mut data);
                    page_delete_cell(buf, ps, slot as usize);
                    db.file.write_page(pnum, data)?;
                    self.drop_lvals(db, &cell)?;
                    return Err(e);
                }
            }
            done += 1;
        }

        self.row_count.set(self.row_count.get() + 1);
        self.save_def(&db.file)?;
        Ok(rowid)
    }

    /// Update a row in place. The row id is preserved where the new image
    /// fits its page; otherwise the row moves and the new id is returned.
    pub fn update_row(
        self: &Rc<Table>,
        db: &DB,
        rowid: RowId,
        values: &mut Vec<Value>,
    ) -> Result<RowId> {
        self.check_writable()?;
        if values.len() != self.info.cols.len() {
            return Err(Error::InvalidArgument(format!(
                "{} values supplied, table '{}' has {} columns",
                values.len(),
                self.name,
                self.info.cols.len()
            )));
        }
        db.with_write(|| {
            let mut path = Vec::new();
            self.update_inner(db, rowid, values, &mut path)
        })
    }

    pub(crate) fn update_inner(
        self: &Rc<Table>,
        db: &DB,
        rowid: RowId,
        values: &mut Vec<Value>,
        path: &mut Vec<i32>,
    ) -> Result<RowId> {
        let old = self
            .get_row(db, rowid)?
            .ok_or_else(|| Error::InvalidArgument("update of a deleted row".to_string()))?;
        db.apply_update_hooks(self, values)?;

        // Auto-number values never change on update.
        for col in &self.info.cols {
            if col.auto_number && values[col.ordinal].is_null() {
                values[col.ordinal] = old[col.ordinal].clone();
            }
        }

        relation::check_child(db, self, values)?;

        let old_keys: Vec<Option<Vec<u8>>> = self
            .index_data
            .iter()
            .map(|d| d.key_from_row(&old))
            .collect::<Result<_>>()?;
        let new_keys: Vec<Option<Vec<u8>>> = self
            .index_data
            .iter()
            .map(|d| d.key_from_row(values))
            .collect::<Result<_>>()?;
        for ((d, old_key), new_key) in self
            .index_data
            .iter()
            .zip(old_keys.iter())
            .zip(new_keys.iter())
        {
            if d.unique.get() && new_key != old_key {
                if let Some(key) = new_key {
                    if d.contains_key(&db.file, key)? {
                        return Err(Error::UniquenessViolation {
                            index: d.name.borrow().clone(),
                        });
                    }
                }
            }
        }

        // Mutation phase: failures below abandon the whole barrier.
        let r = self.update_apply(db, rowid, values, &old_keys, &new_keys);
        let new_rowid = match r {
            Ok(x) => x,
            Err(e) => {
                db.rollback()?;
                return Err(e);
            }
        };
        relation::cascade_parent_update(db, self, &old, values, path)?;
        Ok(new_rowid)
    }

    fn update_apply(
        &self,
        db: &DB,
        rowid: RowId,
        values: &[Value],
        old_keys: &[Option<Vec<u8>>],
        new_keys: &[Option<Vec<u8>>],
    ) -> Result<RowId> {
        let ps = db.file.page_size();
        let data = db.file.read_page(rowid.page)?;
        let old_cell = match page_cell(&data, ps, rowid.slot as usize)? {
            Some(c) => c.to_vec(),
            None => return Err(Error::InvalidArgument("update of a deleted row".to_string())),
        };
        let cell = self.encode_row(db, values)?;

        let mut data = data;
        let buf = Arc::make_mut(&mut data);
        let new_rowid = if page_replace_cell(buf, ps, rowid.slot as usize, &cell) {
            db.file.write_page(rowid.page, data)?;
            rowid
        } else {
            // Delete and reinsert elsewhere; the old slot stays tombstoned.
            page_delete_cell(buf, ps, rowid.slot as usize);
            db.file.write_page(rowid.page, data)?;
            self.free_map.add(&db.file, rowid.page)?;
            let pnum = self.select_page(db, cell.len())?;
            let mut dest = db.file.read_page(pnum)?;
            let dbuf = Arc::make_mut(&mut dest);
            let slot = page_add_cell(dbuf, ps, &cell);
            db.file.write_page(pnum, dest)?;
            RowId::new(pnum, slot)
        };
        self.drop_lvals(db, &old_cell)?;

        for ((d, old_key), new_key) in self
            .index_data
            .iter()
            .zip(old_keys.iter())
            .zip(new_keys.iter())
        {
            let moved = new_rowid != rowid;
            if old_key == new_key && !moved {
                continue;
            }
            if let Some(k) = old_key {
                d.delete(&db.file, k, rowid)?;
            }
            if let Some(k) = new_key {
                d.insert(&db.file, k, new_rowid)?;
            }
        }
        self.save_def(&db.file)?;
        Ok(new_rowid)
    }

    /// Delete a row: tombstone the slot, drop index entries, then fire
    /// relationship cascades depth first within the same barrier.
    pub fn delete_row(self: &Rc<Table>, db: &DB, rowid: RowId) -> Result<()> {
        self.check_writable()?;
        db.with_write(|| {
            let mut path = Vec::new();
            self.delete_inner(db, rowid, &mut path)
        })
    }

    pub(crate) fn delete_inner(
        self: &Rc<Table>,
        db: &DB,
        rowid: RowId,
        path: &mut Vec<i32>,
    ) -> Result<()> {
        let values = self
            .get_row(db, rowid)?
            .ok_or_else(|| Error::InvalidArgument("delete of a deleted row".to_string()))?;
        relation::check_parent_restrict(db, self, &values)?;

        let ps = db.file.page_size();
        let mut data = db.file.read_page(rowid.page)?;
        let cell = match page_cell(&data, ps, rowid.slot as usize)? {
            Some(c) => c.to_vec(),
            None => return Err(Error::InvalidArgument("delete of a deleted row".to_string())),
        };
        let buf = Arc::make_mut(&mut data);
        page_delete_cell(buf, ps, rowid.slot as usize);
        db.file.write_page(rowid.page, data)?;
        self.drop_lvals(db, &cell)?;
        self.free_map.add(&db.file, rowid.page)?;

        for d in &self.index_data {
            if let Some(key) = d.key_from_row(&values)? {
                d.delete(&db.file, &key, rowid)?;
            }
        }
        self.row_count.set(self.row_count.get() - 1);
        self.save_def(&db.file)?;

        relation::cascade_parent_delete(db, self, &values, path)
    }

    /// Free every page the table owns ( drop ).
    pub fn free_all_pages(&self, db: &DB) -> Result<()> {
        for d in &self.index_data {
            d.free_pages(&db.file)?;
        }
        for pnum in self.data_map.snapshot() {
            db.file.free_page(pnum)?;
        }
        for pnum in self.lval_map.snapshot() {
            db.file.free_page(pnum)?;
        }
        for m in [&self.data_map, &self.free_map, &self.lval_map] {
            m.free_meta_pages(&db.file)?;
            db.file.free_page(m.owner().page)?;
        }
        let mut pnum = self.def_page;
        while pnum != 0 {
            let d = db.file.read_page(pnum)?;
            let next = if d[0] == PageType::TableDef as u8 {
                util::getu32(&d, 2)
            } else {
                0
            };
            db.file.free_page(pnum)?;
            pnum = next;
        }
        Ok(())
    }

    /// Row ids of live rows in physical page order.
    pub(crate) fn live_rows_on(&self, db: &DB, pnum: u32) -> Result<Vec<RowId>> {
        let data = db.file.read_page(pnum)?;
        expect_page(&data, pnum, PageType::Data)?;
        let ps = db.file.page_size();
        let mut out = Vec::new();
        for slot in 0..page_nrows(&data) {
            if page_cell(&data, ps, slot)?.is_some() {
                out.push(RowId::new(pnum, slot as u16));
            }
        }
        Ok(out)
    }
}
