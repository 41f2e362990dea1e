use crate::*;
use chrono::NaiveDateTime;
use std::io::{Read, Write};

/// The kinds of complex column, identified by the flat table's schema.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ComplexKind {
    ///
    Attachment,
    ///
    MultiValue,
    /// Immutable version history.
    VersionHistory,
    ///
    Unsupported,
}

impl ComplexKind {
    ///
    pub fn tag(self) -> u8 {
        match self {
            ComplexKind::Attachment => 1,
            ComplexKind::MultiValue => 2,
            ComplexKind::VersionHistory => 3,
            ComplexKind::Unsupported => 0,
        }
    }

    ///
    pub fn from_tag(x: u8) -> ComplexKind {
        match x {
            1 => ComplexKind::Attachment,
            2 => ComplexKind::MultiValue,
            3 => ComplexKind::VersionHistory,
            _ => ComplexKind::Unsupported,
        }
    }
}

/// Shared record of a complex column: the owning table and column, the
/// hidden flat table holding the groups, and the kind tag.
#[derive(Clone, Debug)]
pub struct ComplexColumnInfo {
    /// Catalog id of the complex-column record.
    pub id: i32,
    /// Object id of the owning table.
    pub table_id: i32,
    /// Ordinal of the complex column in the owning table.
    pub column: usize,
    /// Object id of the flat table.
    pub flat_table: i32,
    ///
    pub kind: ComplexKind,
}

// Flat table column ordinals: Id, ComplexFK, then the kind columns.
const FLAT_ID: usize = 0;
const FLAT_FK: usize = 1;

/// Attachment flat-table columns, in declared order.
const ATTACHMENT_COLS: [(&str, DataType); 6] = [
    ("FileURL", DataType::Memo),
    ("FileName", DataType::Text),
    ("FileType", DataType::Text),
    ("FileData", DataType::Ole),
    ("FileTimeStamp", DataType::ShortDateTime),
    ("FileFlags", DataType::Long),
];

/// One attachment.
#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    ///
    pub file_url: Option<String>,
    ///
    pub file_name: String,
    ///
    pub file_type: Option<String>,
    /// Decoded payload bytes.
    pub file_data: Vec<u8>,
    ///
    pub timestamp: Option<NaiveDateTime>,
    ///
    pub flags: i32,
}

/// One version of a version-history column.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueVersion {
    /// Flat row id, the version's identity.
    pub id: i32,
    ///
    pub value: String,
    ///
    pub modified: NaiveDateTime,
}

/// The flat-table schema for a complex column kind.
pub fn flat_spec(name: &str, kind: ComplexKind, value_type: DataType) -> TableSpec {
    let mut s = TableSpec::new(name);
    let mut id = ColumnSpec::new("Id", DataType::Long);
    id.auto_number = true;
    s.columns.push(id);
    let mut fk = ColumnSpec::new("ComplexFK", DataType::Long);
    fk.nullable = false;
    s.columns.push(fk);
    match kind {
        ComplexKind::Attachment => {
            for (n, t) in ATTACHMENT_COLS {
                s.columns.push(ColumnSpec::new(n, t));
            }
        }
        ComplexKind::MultiValue => {
            s.columns.push(ColumnSpec::new("Value", value_type));
        }
        ComplexKind::VersionHistory => {
            s.columns.push(ColumnSpec::new("Value", DataType::Memo));
            s.columns.push(ColumnSpec::new("Modified", DataType::ShortDateTime));
        }
        ComplexKind::Unsupported => {}
    }
    s.indexes.push(IndexSpec::primary("PrimaryKey", &["Id"]));
    s.indexes.push(IndexSpec::new("ByFK", &["ComplexFK"]));
    s
}

/// Resolve the attachment columns of a flat table. Expected names are
/// matched first; if the schema is malformed the columns are assigned in
/// declared order ( name, type ) with a warning.
fn attachment_cols(table: &Table) -> Vec<usize> {
    let mut out = Vec::with_capacity(ATTACHMENT_COLS.len());
    let by_name: Vec<Option<usize>> = ATTACHMENT_COLS
        .iter()
        .map(|(n, _)| table.info.get(n))
        .collect();
    if by_name.iter().all(|o| o.is_some()) {
        return by_name.into_iter().map(|o| o.unwrap()).collect();
    }
    log::warn!(
        "attachment flat table '{}' does not carry the expected column names; assigning columns in declared order",
        table.name
    );
    let mut ord = FLAT_FK + 1;
    for _ in ATTACHMENT_COLS {
        out.push(ord);
        ord += 1;
    }
    out
}

// ---------------------------------------------------------------------
// Attachment blob codec
//
// 8-byte header ( typeFlag u32, decodedLength u32 ), then either the raw
// bytes ( typeFlag 0 ) or a DEFLATE stream ( typeFlag 1 ) whose first
// field is a length-prefixed file-extension preamble followed by the
// payload of decodedLength - preambleLength bytes.

const ATT_RAW: u32 = 0;
const ATT_DEFLATE: u32 = 1;

/// Payloads shorter than this are stored raw.
const ATT_COMPRESS_MIN: usize = 8;

/// Encode an attachment payload, compressing unless it is tiny.
pub fn encode_attachment_blob(data: &[u8], file_type: Option<&str>) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 16);
    if data.len() < ATT_COMPRESS_MIN {
        out.extend_from_slice(&ATT_RAW.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        return Ok(out);
    }
    let ext = file_type.unwrap_or("");
    let preamble_len = 2 + ext.len();
    let mut decoded = Vec::with_capacity(preamble_len + data.len());
    decoded.extend_from_slice(&(preamble_len as u16).to_le_bytes());
    decoded.extend_from_slice(ext.as_bytes());
    decoded.extend_from_slice(data);

    out.extend_from_slice(&ATT_DEFLATE.to_le_bytes());
    out.extend_from_slice(&(decoded.len() as u32).to_le_bytes());
    let mut enc = flate2::write::DeflateEncoder::new(out, flate2::Compression::default());
    enc.write_all(&decoded)?;
    Ok(enc.finish()?)
}

/// Decode an attachment blob into ( payload, extension ).
pub fn decode_attachment_blob(blob: &[u8]) -> Result<(Vec<u8>, Option<String>)> {
    if blob.len() < 8 {
        return Err(Error::corrupt("attachment blob shorter than its header"));
    }
    let flag = util::getu32(blob, 0);
    let decoded_len = util::getu32(blob, 4) as usize;
    match flag {
        ATT_RAW => {
            if blob.len() < 8 + decoded_len {
                return Err(Error::corrupt("raw attachment truncated"));
            }
            Ok((blob[8..8 + decoded_len].to_vec(), None))
        }
        ATT_DEFLATE => {
            let mut dec = flate2::read::DeflateDecoder::new(&blob[8..]);
            let mut decoded = Vec::with_capacity(decoded_len);
            dec.read_to_end(&mut decoded)?;
            if decoded.len() != decoded_len || decoded.len() < 2 {
                return Err(Error::corrupt("attachment stream length mismatch"));
            }
            let preamble_len = util::getu16(&decoded, 0) as usize;
            if preamble_len < 2 || preamble_len > decoded.len() {
                return Err(Error::corrupt("bad attachment preamble length"));
            }
            let ext = std::str::from_utf8(&decoded[2..preamble_len])
                .map_err(|_| Error::corrupt("bad attachment extension"))?;
            let ext = if ext.is_empty() {
                None
            } else {
                Some(ext.to_string())
            };
            Ok((decoded[preamble_len..].to_vec(), ext))
        }
        x => Err(Error::UnknownEncoding(x)),
    }
}

// ---------------------------------------------------------------------
// Complex value operations

/// The complex column record for a table column.
pub fn complex_info(db: &DB, table: &Table, column: &str) -> Result<Rc<ComplexColumnInfo>> {
    let ord = table.info.get(column).ok_or_else(|| {
        Error::InvalidArgument(format!("no column '{}' in table '{}'", column, table.name))
    })?;
    db.complex_cols
        .borrow()
        .iter()
        .find(|c| c.table_id == table.id && c.column == ord)
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!("column '{}' is not a complex column", column))
        })
}

/// The foreign key of a row's complex column, allocating a fresh group id
/// ( and updating the row ) when none exists yet.
fn resolve_fk(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    info: &ComplexColumnInfo,
    create: bool,
) -> Result<Option<i32>> {
    let mut row = table
        .get_row(db, rowid)?
        .ok_or_else(|| Error::InvalidArgument("row is deleted".to_string()))?;
    match row[info.column] {
        Value::Complex(0) | Value::Null => {
            if !create {
                return Ok(None);
            }
            let fk = sys::alloc_complex_fk(db, info.id)?;
            row[info.column] = Value::Complex(fk);
            table.update_row(db, rowid, &mut row)?;
            Ok(Some(fk))
        }
        Value::Complex(fk) => Ok(Some(fk)),
        _ => Err(Error::corrupt("complex column does not hold a foreign key")),
    }
}

fn flat_handle(db: &DB, info: &ComplexColumnInfo) -> Result<TablePtr> {
    db.table_by_id(info.flat_table)
}

fn group_rows(db: &DB, flat: &TablePtr, fk: i32) -> Result<Vec<RowId>> {
    let l = flat
        .find_index("ByFK")
        .ok_or_else(|| Error::corrupt("flat table lost its foreign key index"))?;
    let data = flat.data_of(l);
    let prefix = data.key_from_values(&[Value::Int(fk)])?;
    relation::matching_rows(&db.file, &data, &prefix)
}

/// Add an attachment to a row's attachment column.
pub fn add_attachment(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
    att: &Attachment,
) -> Result<()> {
    let info = complex_info(db, table, column)?;
    if info.kind != ComplexKind::Attachment {
        return Err(Error::InvalidArgument(format!(
            "column '{}' is not an attachment column",
            column
        )));
    }
    db.with_write(|| {
        let fk = resolve_fk(db, table, rowid, &info, true)?.unwrap_or(0);
        let flat = flat_handle(db, &info)?;
        let cols = attachment_cols(&flat);
        let blob = encode_attachment_blob(&att.file_data, att.file_type.as_deref())?;
        let mut row = flat.row();
        row[FLAT_FK] = Value::Int(fk);
        if let Some(u) = &att.file_url {
            row[cols[0]] = Value::text(u);
        }
        row[cols[1]] = Value::text(&att.file_name);
        if let Some(t) = &att.file_type {
            row[cols[2]] = Value::text(t);
        }
        row[cols[3]] = Value::Binary(Rc::new(blob));
        if let Some(ts) = att.timestamp {
            row[cols[4]] = Value::DateTime(ts);
        }
        row[cols[5]] = Value::Int(att.flags);
        flat.insert_row(db, &mut row)?;
        Ok(())
    })
}

/// Read every attachment of a row's attachment column.
pub fn get_attachments(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
) -> Result<Vec<Attachment>> {
    let info = complex_info(db, table, column)?;
    if info.kind != ComplexKind::Attachment {
        return Err(Error::InvalidArgument(format!(
            "column '{}' is not an attachment column",
            column
        )));
    }
    let Some(fk) = resolve_fk(db, table, rowid, &info, false)? else {
        return Ok(Vec::new());
    };
    let flat = flat_handle(db, &info)?;
    let cols = attachment_cols(&flat);
    let mut out = Vec::new();
    for rid in group_rows(db, &flat, fk)? {
        let row = match flat.get_row(db, rid)? {
            Some(r) => r,
            None => continue,
        };
        let blob = row[cols[3]].as_bytes().unwrap_or(&[]).to_vec();
        let (data, ext) = decode_attachment_blob(&blob)?;
        out.push(Attachment {
            file_url: row[cols[0]].as_str().map(str::to_string),
            file_name: row[cols[1]].as_str().unwrap_or_default().to_string(),
            file_type: row[cols[2]]
                .as_str()
                .map(str::to_string)
                .or(ext),
            file_data: data,
            timestamp: match row[cols[4]] {
                Value::DateTime(ts) => Some(ts),
                _ => None,
            },
            flags: row[cols[5]].as_int().unwrap_or(0) as i32,
        });
    }
    Ok(out)
}

/// Add a value to a multi-value column.
pub fn add_multi_value(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
    value: Value,
) -> Result<()> {
    let info = complex_info(db, table, column)?;
    if info.kind != ComplexKind::MultiValue {
        return Err(Error::InvalidArgument(format!(
            "column '{}' is not a multi-value column",
            column
        )));
    }
    db.with_write(|| {
        let fk = resolve_fk(db, table, rowid, &info, true)?.unwrap_or(0);
        let flat = flat_handle(db, &info)?;
        let mut row = flat.row();
        row[FLAT_FK] = Value::Int(fk);
        row[FLAT_FK + 1] = value.clone();
        flat.insert_row(db, &mut row)?;
        Ok(())
    })
}

/// Read the values of a multi-value column.
pub fn get_multi_values(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
) -> Result<Vec<Value>> {
    let info = complex_info(db, table, column)?;
    let Some(fk) = resolve_fk(db, table, rowid, &info, false)? else {
        return Ok(Vec::new());
    };
    let flat = flat_handle(db, &info)?;
    let mut out = Vec::new();
    for rid in group_rows(db, &flat, fk)? {
        if let Some(row) = flat.get_row(db, rid)? {
            out.push(row[FLAT_FK + 1].clone());
        }
    }
    Ok(out)
}

/// Remove one multi-value entry by its current value.
pub fn delete_multi_value(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
    value: &Value,
) -> Result<bool> {
    let info = complex_info(db, table, column)?;
    if info.kind != ComplexKind::MultiValue {
        return Err(Error::InvalidArgument(format!(
            "column '{}' is not a multi-value column",
            column
        )));
    }
    let Some(fk) = resolve_fk(db, table, rowid, &info, false)? else {
        return Ok(false);
    };
    let flat = flat_handle(db, &info)?;
    for rid in group_rows(db, &flat, fk)? {
        if let Some(row) = flat.get_row(db, rid)? {
            if &row[FLAT_FK + 1] == value {
                flat.delete_row(db, rid)?;
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Append a version to a version-history column.
pub fn add_version(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
    value: &str,
    modified: NaiveDateTime,
) -> Result<()> {
    let info = complex_info(db, table, column)?;
    if info.kind != ComplexKind::VersionHistory {
        return Err(Error::InvalidArgument(format!(
            "column '{}' is not a version-history column",
            column
        )));
    }
    db.with_write(|| {
        let fk = resolve_fk(db, table, rowid, &info, true)?.unwrap_or(0);
        let flat = flat_handle(db, &info)?;
        let mut row = flat.row();
        row[FLAT_FK] = Value::Int(fk);
        row[FLAT_FK + 1] = Value::text(value);
        row[FLAT_FK + 2] = Value::DateTime(modified);
        flat.insert_row(db, &mut row)?;
        Ok(())
    })
}

/// Versions sorted by descending modification date, then descending value
/// id, then descending foreign-key id.
pub fn get_versions(
    db: &DB,
    table: &TablePtr,
    rowid: RowId,
    column: &str,
) -> Result<Vec<ValueVersion>> {
    let info = complex_info(db, table, column)?;
    if info.kind != ComplexKind::VersionHistory {
        return Err(Error::InvalidArgument(format!(
            "column '{}' is not a version-history column",
            column
        )));
    }
    let Some(fk) = resolve_fk(db, table, rowid, &info, false)? else {
        return Ok(Vec::new());
    };
    let flat = flat_handle(db, &info)?;
    let mut out = Vec::new();
    for rid in group_rows(db, &flat, fk)? {
        if let Some(row) = flat.get_row(db, rid)? {
            let modified = match row[FLAT_FK + 2] {
                Value::DateTime(ts) => ts,
                _ => continue,
            };
            out.push((
                modified,
                row[FLAT_ID].as_int().unwrap_or(0) as i32,
                fk,
                ValueVersion {
                    id: row[FLAT_ID].as_int().unwrap_or(0) as i32,
                    value: row[FLAT_FK + 1].as_str().unwrap_or_default().to_string(),
                    modified,
                },
            ));
        }
    }
    out.sort_by(|a, b| (b.0, b.1, b.2).cmp(&(a.0, a.1, a.2)));
    Ok(out.into_iter().map(|(_, _, _, v)| v).collect())
}

/// Versions are immutable.
pub fn update_version(
    _db: &DB,
    _table: &TablePtr,
    _rowid: RowId,
    _column: &str,
    _version: &ValueVersion,
) -> Result<()> {
    Err(Error::VersionImmutable)
}

/// Versions are immutable.
pub fn delete_version(
    _db: &DB,
    _table: &TablePtr,
    _rowid: RowId,
    _column: &str,
    _version: &ValueVersion,
) -> Result<()> {
    Err(Error::VersionImmutable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_blob_round_trip() {
        let payload = b"this is some test data for attachment.";
        let blob = encode_attachment_blob(payload, Some("txt")).unwrap();
        assert_eq!(&blob[0..4], &[1, 0, 0, 0]);
        let (back, ext) = decode_attachment_blob(&blob).unwrap();
        assert_eq!(back, payload);
        assert_eq!(ext.as_deref(), Some("txt"));
    }

    #[test]
    fn tiny_attachment_stays_raw() {
        let payload = b"abc";
        let blob = encode_attachment_blob(payload, Some("txt")).unwrap();
        assert_eq!(&blob[0..4], &[0, 0, 0, 0]);
        let (back, ext) = decode_attachment_blob(&blob).unwrap();
        assert_eq!(back, payload);
        assert_eq!(ext, None);
    }

    #[test]
    fn unknown_encoding_rejected() {
        let mut blob = vec![0u8; 12];
        blob[0] = 7;
        assert!(matches!(
            decode_attachment_blob(&blob),
            Err(Error::UnknownEncoding(7))
        ));
    }
}
