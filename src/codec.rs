use crate::*;
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

/// Signal prefix for compressed unicode text.
pub const TEXT_COMPRESSION_SIGNAL: [u8; 2] = [0xFF, 0xFE];

/// Epoch of the short date/time type, 1899-12-30.
pub fn short_date_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn ext_date_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Days ( integer part ) and day fraction since the epoch.
pub fn datetime_to_days(dt: NaiveDateTime) -> f64 {
    let delta = dt - short_date_epoch();
    delta.num_milliseconds() as f64 / 86_400_000.0
}

/// Inverse of [datetime_to_days], rounded to the nearest millisecond.
pub fn days_to_datetime(days: f64) -> NaiveDateTime {
    let ms = (days * 86_400_000.0).round() as i64;
    short_date_epoch() + Duration::milliseconds(ms)
}

/// Current time as days since the epoch ( file creation stamp ).
pub fn now_datetime_days() -> f64 {
    datetime_to_days(chrono::Utc::now().naive_utc())
}

// ---------------------------------------------------------------------
// Text

/// Encode text as UTF-16-LE, or one byte per code unit behind the
/// compression signal when the column opts in and every unit fits.
pub fn encode_text(s: &str, compress: bool) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    if compress && !units.is_empty() && units.iter().all(|u| *u < 0x100) {
        let mut out = Vec::with_capacity(2 + units.len());
        out.extend_from_slice(&TEXT_COMPRESSION_SIGNAL);
        out.extend(units.iter().map(|u| *u as u8));
        return out;
    }
    let mut out = Vec::with_capacity(units.len() * 2);
    for u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

/// Decode text, accepting either the compressed or the raw form.
pub fn decode_text(data: &[u8]) -> Result<String> {
    if data.len() >= 2 && data[0..2] == TEXT_COMPRESSION_SIGNAL {
        let units: Vec<u16> = data[2..].iter().map(|b| *b as u16).collect();
        return String::from_utf16(&units)
            .map_err(|_| Error::corrupt("invalid compressed text payload"));
    }
    if data.len() % 2 != 0 {
        return Err(Error::corrupt("odd length UTF-16 text payload"));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Error::corrupt("invalid UTF-16 text payload"))
}

/// Write text into a fixed slot: u16 payload length, payload, zero fill.
pub fn encode_text_slot(s: &str, compress: bool, slot: &mut [u8]) -> Result<()> {
    let payload = encode_text(s, compress);
    if payload.len() + 2 > slot.len() {
        return Err(Error::invalid("", "text exceeds declared column length"));
    }
    util::setu16(slot, 0, payload.len() as u16);
    slot[2..2 + payload.len()].copy_from_slice(&payload);
    for b in slot[2 + payload.len()..].iter_mut() {
        *b = 0;
    }
    Ok(())
}

/// Read text from a fixed slot.
pub fn decode_text_slot(slot: &[u8]) -> Result<String> {
    let len = util::getu16(slot, 0) as usize;
    if len + 2 > slot.len() {
        return Err(Error::corrupt("text slot length exceeds slot"));
    }
    decode_text(&slot[2..2 + len])
}

// ---------------------------------------------------------------------
// Numeric

/// 17 bytes: sign byte then 16-byte big-endian magnitude. The scale is
/// taken from the column declaration and preserved exactly.
pub fn encode_numeric(d: &Decimal, col_scale: u8, column: &str) -> Result<[u8; 17]> {
    let d = d
        .rescale(col_scale)
        .ok_or_else(|| Error::invalid(column, "numeric value does not fit column scale"))?;
    let mut out = [0u8; 17];
    out[0] = if d.negative && d.mantissa != 0 { 1 } else { 0 };
    out[1..17].copy_from_slice(&d.mantissa.to_be_bytes());
    Ok(out)
}

///
pub fn decode_numeric(data: &[u8], scale: u8) -> Result<Decimal> {
    if data.len() < 17 {
        return Err(Error::corrupt("short numeric field"));
    }
    let negative = match data[0] {
        0 => false,
        1 => true,
        x => return Err(Error::corrupt(format!("bad numeric sign byte {}", x))),
    };
    let mantissa = u128::from_be_bytes(data[1..17].try_into().unwrap());
    Ok(Decimal::new(negative, mantissa, scale))
}

// ---------------------------------------------------------------------
// Extended date/time

fn encode_ext_datetime(dt: NaiveDateTime) -> [u8; 12] {
    let delta = dt - ext_date_epoch();
    let secs = delta.num_seconds();
    let nanos = dt.nanosecond();
    let mut out = [0u8; 12];
    out[0..8].copy_from_slice(&secs.to_le_bytes());
    out[8..12].copy_from_slice(&nanos.to_le_bytes());
    out
}

fn decode_ext_datetime(data: &[u8]) -> Result<NaiveDateTime> {
    if data.len() < 12 {
        return Err(Error::corrupt("short extended date/time field"));
    }
    let secs = i64::from_le_bytes(data[0..8].try_into().unwrap());
    let nanos = u32::from_le_bytes(data[8..12].try_into().unwrap());
    Ok(ext_date_epoch() + Duration::seconds(secs) + Duration::nanoseconds(nanos as i64))
}

// ---------------------------------------------------------------------
// Fixed-size values

/// Encode a fixed-size value into its exact on-page byte form.
/// Text and binary fixed slots are handled by the slot helpers above.
pub fn encode_fixed(val: &Value, typ: DataType, scale: u8, column: &str) -> Result<Vec<u8>> {
    let bad = || Error::invalid(column, format!("value does not fit type {:?}", typ));
    Ok(match (typ, val) {
        (DataType::Boolean, Value::Bool(x)) => vec![*x as u8],
        (DataType::Byte, Value::Byte(x)) => vec![*x],
        (DataType::Short, Value::Short(x)) => x.to_le_bytes().to_vec(),
        (DataType::Long, Value::Int(x)) => x.to_le_bytes().to_vec(),
        (DataType::Complex, Value::Complex(x)) => x.to_le_bytes().to_vec(),
        (DataType::BigInt, Value::BigInt(x)) => x.to_le_bytes().to_vec(),
        (DataType::Money, Value::Money(x)) => x.to_le_bytes().to_vec(),
        (DataType::Float, Value::Float(x)) => x.to_le_bytes().to_vec(),
        (DataType::Double, Value::Double(x)) => x.to_le_bytes().to_vec(),
        (DataType::ShortDateTime, Value::DateTime(dt)) => {
            datetime_to_days(*dt).to_le_bytes().to_vec()
        }
        (DataType::ExtDateTime, Value::ExtDateTime(dt)) => encode_ext_datetime(*dt).to_vec(),
        (DataType::Guid, Value::Guid(g)) => g.as_bytes().to_vec(),
        (DataType::Numeric, Value::Numeric(d)) => encode_numeric(d, scale, column)?.to_vec(),
        _ => return Err(bad()),
    })
}

/// Decode a fixed-size value from its on-page byte form.
pub fn decode_fixed(data: &[u8], typ: DataType, scale: u8) -> Result<Value> {
    let need = typ.intrinsic_size().unwrap_or(0);
    if data.len() < need {
        return Err(Error::corrupt(format!("short field of type {:?}", typ)));
    }
    Ok(match typ {
        DataType::Boolean => Value::Bool(data[0] != 0),
        DataType::Byte => Value::Byte(data[0]),
        DataType::Short => Value::Short(i16::from_le_bytes(data[0..2].try_into().unwrap())),
        DataType::Long => Value::Int(i32::from_le_bytes(data[0..4].try_into().unwrap())),
        DataType::Complex => Value::Complex(i32::from_le_bytes(data[0..4].try_into().unwrap())),
        DataType::BigInt => Value::BigInt(i64::from_le_bytes(data[0..8].try_into().unwrap())),
        DataType::Money => Value::Money(i64::from_le_bytes(data[0..8].try_into().unwrap())),
        DataType::Float => Value::Float(f32::from_le_bytes(data[0..4].try_into().unwrap())),
        DataType::Double => Value::Double(f64::from_le_bytes(data[0..8].try_into().unwrap())),
        DataType::ShortDateTime => Value::DateTime(days_to_datetime(util::getf64(data, 0))),
        DataType::ExtDateTime => Value::ExtDateTime(decode_ext_datetime(data)?),
        DataType::Guid => Value::Guid(uuid::Uuid::from_bytes(data[0..16].try_into().unwrap())),
        DataType::Numeric => Value::Numeric(decode_numeric(data, scale)?),
        _ => return Err(Error::corrupt(format!("type {:?} is not fixed size", typ))),
    })
}

/// Encode the payload of a variable-length value ( text / memo as text,
/// binary / OLE as bytes ).
pub fn encode_var(val: &Value, typ: DataType, compress: bool, column: &str) -> Result<Vec<u8>> {
    Ok(match (typ, val) {
        (DataType::Text | DataType::Memo, Value::Text(s)) => encode_text(s, compress),
        (DataType::Binary | DataType::Ole, Value::Binary(b)) => b.as_ref().clone(),
        _ => {
            return Err(Error::invalid(
                column,
                format!("value does not fit type {:?}", typ),
            ))
        }
    })
}

/// Decode the payload of a variable-length value.
pub fn decode_var(data: &[u8], typ: DataType) -> Result<Value> {
    Ok(match typ {
        DataType::Text | DataType::Memo => Value::Text(Rc::new(decode_text(data)?)),
        DataType::Binary | DataType::Ole => Value::Binary(Rc::new(data.to_vec())),
        _ => return Err(Error::corrupt(format!("type {:?} is not variable", typ))),
    })
}

// ---------------------------------------------------------------------
// Index keys
//
// Per-column key bytes concatenate directly; lexicographic comparison of
// the concatenation matches logical comparison. Non-null values get a
// 0x7F presence byte, nulls a bare 0x00, so nulls order first ascending.
// Descending columns xor every byte with 0xFF.

const KEY_NULL: u8 = 0x00;
const KEY_PRESENT: u8 = 0x7F;

/// Upper bound on one column's encoded key bytes.
const KEY_COLUMN_MAX: usize = 1024;

/// Append bytes with 0x00 escaped ( 0x00 -> 0x00 0xFF ) then a 0x00 0x01
/// terminator, keeping variable-length keys prefix-free and ordered.
fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for b in data {
        if *b == 0 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(*b);
        }
    }
    out.push(0x00);
    out.push(0x01);
}

fn push_f64_key(out: &mut Vec<u8>, x: f64) {
    let bits = x.to_bits();
    let bits = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    out.extend_from_slice(&bits.to_be_bytes());
}

/// Order-preserving key bytes for one column value.
pub fn encode_index_key(val: &Value, typ: DataType, descending: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if val.is_null() {
        out.push(KEY_NULL);
    } else {
        out.push(KEY_PRESENT);
        match (typ, val) {
            (DataType::Boolean, Value::Bool(x)) => out.push(*x as u8),
            (DataType::Byte, Value::Byte(x)) => out.push(*x),
            (DataType::Short, Value::Short(x)) => {
                out.extend_from_slice(&((*x as u16) ^ 0x8000).to_be_bytes())
            }
            (DataType::Long, Value::Int(x)) | (DataType::Complex, Value::Complex(x)) => {
                out.extend_from_slice(&((*x as u32) ^ 0x8000_0000).to_be_bytes())
            }
            (DataType::BigInt, Value::BigInt(x)) | (DataType::Money, Value::Money(x)) => {
                out.extend_from_slice(&((*x as u64) ^ (1 << 63)).to_be_bytes())
            }
            (DataType::Float, Value::Float(x)) => push_f64_key(&mut out, *x as f64),
            (DataType::Double, Value::Double(x)) => push_f64_key(&mut out, *x),
            (DataType::ShortDateTime, Value::DateTime(dt)) => {
                push_f64_key(&mut out, datetime_to_days(*dt))
            }
            (DataType::ExtDateTime, Value::ExtDateTime(dt)) => {
                let delta = *dt - ext_date_epoch();
                let secs = delta.num_seconds();
                out.extend_from_slice(&((secs as u64) ^ (1 << 63)).to_be_bytes());
                out.extend_from_slice(&dt.nanosecond().to_be_bytes());
            }
            (DataType::Guid, Value::Guid(g)) => out.extend_from_slice(g.as_bytes()),
            (DataType::Numeric, Value::Numeric(d)) => {
                let zero = d.mantissa == 0;
                if d.negative && !zero {
                    out.push(0x00);
                    for b in d.mantissa.to_be_bytes() {
                        out.push(!b);
                    }
                } else {
                    out.push(0x01);
                    out.extend_from_slice(&d.mantissa.to_be_bytes());
                }
            }
            (DataType::Text | DataType::Memo, Value::Text(s)) => {
                let mut be = Vec::with_capacity(s.len() * 2);
                for u in s.encode_utf16() {
                    be.extend_from_slice(&u.to_be_bytes());
                }
                push_escaped(&mut out, &be);
            }
            (DataType::Binary | DataType::Ole, Value::Binary(b)) => push_escaped(&mut out, b),
            _ => {
                return Err(Error::invalid(
                    "",
                    format!("cannot build index key of type {:?} from {:?}", typ, val),
                ))
            }
        }
    }
    if out.len() > KEY_COLUMN_MAX {
        return Err(Error::invalid("", "value too long to index"));
    }
    if descending {
        for b in out.iter_mut() {
            *b = !*b;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn text_compression() {
        let enc = encode_text("hello", true);
        assert_eq!(&enc[0..2], &TEXT_COMPRESSION_SIGNAL);
        assert_eq!(enc.len(), 7);
        assert_eq!(decode_text(&enc).unwrap(), "hello");

        // A code unit above 0xFF forces the raw form.
        let enc = encode_text("héllo\u{0416}", true);
        assert_ne!(&enc[0..2], &TEXT_COMPRESSION_SIGNAL);
        assert_eq!(decode_text(&enc).unwrap(), "héllo\u{0416}");

        // Uncompressed columns always emit raw UTF-16-LE.
        let enc = encode_text("hi", false);
        assert_eq!(enc, vec![b'h', 0, b'i', 0]);
    }

    #[test]
    fn fixed_round_trips() {
        let cases: Vec<(Value, DataType)> = vec![
            (Value::Bool(true), DataType::Boolean),
            (Value::Byte(200), DataType::Byte),
            (Value::Short(-1234), DataType::Short),
            (Value::Int(-123456), DataType::Long),
            (Value::BigInt(i64::MIN + 1), DataType::BigInt),
            (Value::Money(123456789), DataType::Money),
            (Value::Float(1.5), DataType::Float),
            (Value::Double(-2.25), DataType::Double),
            (Value::Guid(uuid::Uuid::from_u128(0xDEADBEEF)), DataType::Guid),
            (Value::Complex(42), DataType::Complex),
            (
                Value::DateTime(dt(2021, 6, 15, 12, 30, 45)),
                DataType::ShortDateTime,
            ),
            (
                Value::ExtDateTime(dt(2021, 6, 15, 12, 30, 45)),
                DataType::ExtDateTime,
            ),
        ];
        for (v, t) in cases {
            let enc = encode_fixed(&v, t, 0, "c").unwrap();
            assert_eq!(enc.len(), t.intrinsic_size().unwrap());
            let back = decode_fixed(&enc, t, 0).unwrap();
            assert_eq!(back, v, "type {:?}", t);
        }
    }

    #[test]
    fn numeric_scale_preserved() {
        let d = Decimal::new(true, 123450, 3);
        let enc = encode_numeric(&d, 3, "n").unwrap();
        let back = decode_numeric(&enc, 3).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.scale, 3);
        // Rescale on the way in when the column scale differs.
        let enc = encode_numeric(&d, 5, "n").unwrap();
        assert_eq!(decode_numeric(&enc, 5).unwrap().mantissa, 12345000);
    }

    #[test]
    fn date_rounding_within_1ms() {
        let orig = dt(1999, 12, 31, 23, 59, 59);
        let days = datetime_to_days(orig);
        let back = days_to_datetime(days);
        let diff = (back - orig).num_milliseconds().abs();
        assert!(diff <= 1, "round trip error {} ms", diff);
    }

    fn key(v: &Value, t: DataType, desc: bool) -> Vec<u8> {
        encode_index_key(v, t, desc).unwrap()
    }

    #[test]
    fn key_order_matches_value_order() {
        let ints: Vec<i32> = vec![i32::MIN, -5, -1, 0, 1, 7, i32::MAX];
        for w in ints.windows(2) {
            let a = key(&Value::Int(w[0]), DataType::Long, false);
            let b = key(&Value::Int(w[1]), DataType::Long, false);
            assert!(a < b, "{} vs {}", w[0], w[1]);
            // Descending flip reverses the relation.
            let a = key(&Value::Int(w[0]), DataType::Long, true);
            let b = key(&Value::Int(w[1]), DataType::Long, true);
            assert!(a > b);
        }

        let floats = vec![-1000.5, -0.25, 0.0, 0.25, 3.5, 1e9];
        for w in floats.windows(2) {
            let a = key(&Value::Double(w[0]), DataType::Double, false);
            let b = key(&Value::Double(w[1]), DataType::Double, false);
            assert!(a < b);
        }

        let texts = ["", "A", "AB", "B", "a", "ab"];
        for w in texts.windows(2) {
            let a = key(&Value::text(w[0]), DataType::Text, false);
            let b = key(&Value::text(w[1]), DataType::Text, false);
            assert!(a < b, "{:?} vs {:?}", w[0], w[1]);
        }

        // Null orders before everything ascending.
        let n = key(&Value::Null, DataType::Long, false);
        let z = key(&Value::Int(i32::MIN), DataType::Long, false);
        assert!(n < z);

        // Prefix property for partial-key lookup.
        let a = key(&Value::text("C"), DataType::Text, false);
        let full = key(&Value::text("C"), DataType::Text, false);
        assert!(full.starts_with(&a));
    }

    #[test]
    fn numeric_key_order() {
        let vals = vec![
            Decimal::new(true, 5000, 2),
            Decimal::new(true, 1, 2),
            Decimal::new(false, 0, 2),
            Decimal::new(false, 99, 2),
            Decimal::new(false, 123456, 2),
        ];
        for w in vals.windows(2) {
            let a = key(&Value::Numeric(w[0]), DataType::Numeric, false);
            let b = key(&Value::Numeric(w[1]), DataType::Numeric, false);
            assert!(a < b, "{} vs {}", w[0], w[1]);
        }
    }
}
