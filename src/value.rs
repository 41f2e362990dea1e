use crate::*;
use chrono::NaiveDateTime;
use uuid::Uuid;

/// Column data types. The ordinal values match the on-disk type codes of
/// the container format and must be preserved.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum DataType {
    ///
    Boolean,
    ///
    Byte,
    /// 16 bit signed integer.
    Short,
    /// 32 bit signed integer.
    Long,
    /// Currency, i64 scaled by 10,000.
    Money,
    /// 32 bit float.
    Float,
    /// 64 bit float.
    Double,
    /// Days since the 1899-12-30 epoch, stored as a double.
    ShortDateTime,
    /// Fixed or variable length byte string.
    Binary,
    /// Fixed or variable length UTF-16-LE text.
    Text,
    /// Long binary, possibly spilled to long-value pages.
    Ole,
    /// Long text, possibly spilled to long-value pages.
    Memo,
    ///
    Guid,
    /// Fixed precision decimal.
    Numeric,
    /// Foreign key into a complex-value flat table.
    Complex,
    /// 64 bit signed integer.
    BigInt,
    /// Seconds plus nanoseconds since 0001-01-01.
    ExtDateTime,
}

impl DataType {
    /// On-disk type ordinal.
    pub fn ordinal(self) -> u8 {
        match self {
            DataType::Boolean => 0x01,
            DataType::Byte => 0x02,
            DataType::Short => 0x03,
            DataType::Long => 0x04,
            DataType::Money => 0x05,
            DataType::Float => 0x06,
            DataType::Double => 0x07,
            DataType::ShortDateTime => 0x08,
            DataType::Binary => 0x09,
            DataType::Text => 0x0A,
            DataType::Ole => 0x0B,
            DataType::Memo => 0x0C,
            DataType::Guid => 0x0F,
            DataType::Numeric => 0x10,
            DataType::Complex => 0x12,
            DataType::BigInt => 0x13,
            DataType::ExtDateTime => 0x14,
        }
    }

    /// Type from on-disk ordinal.
    pub fn from_ordinal(x: u8) -> Result<DataType> {
        Ok(match x {
            0x01 => DataType::Boolean,
            0x02 => DataType::Byte,
            0x03 => DataType::Short,
            0x04 => DataType::Long,
            0x05 => DataType::Money,
            0x06 => DataType::Float,
            0x07 => DataType::Double,
            0x08 => DataType::ShortDateTime,
            0x09 => DataType::Binary,
            0x0A => DataType::Text,
            0x0B => DataType::Ole,
            0x0C => DataType::Memo,
            0x0F => DataType::Guid,
            0x10 => DataType::Numeric,
            0x12 => DataType::Complex,
            0x13 => DataType::BigInt,
            0x14 => DataType::ExtDateTime,
            _ => return Err(Error::corrupt(format!("unknown column type 0x{:02x}", x))),
        })
    }

    /// Intrinsic fixed size in bytes, None for types whose size comes from
    /// the column declaration ( text / binary ) or that are always variable.
    pub fn intrinsic_size(self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::Byte => Some(1),
            DataType::Short => Some(2),
            DataType::Long | DataType::Float | DataType::Complex => Some(4),
            DataType::Money | DataType::Double | DataType::ShortDateTime | DataType::BigInt => {
                Some(8)
            }
            DataType::ExtDateTime => Some(12),
            DataType::Guid => Some(16),
            DataType::Numeric => Some(17),
            DataType::Text | DataType::Binary | DataType::Ole | DataType::Memo => None,
        }
    }

    /// True for types that always live in the variable-length region.
    pub fn always_variable(self) -> bool {
        matches!(self, DataType::Ole | DataType::Memo)
    }
}

/// Fixed precision decimal: sign, unscaled magnitude and decimal scale.
#[derive(Clone, Copy, Debug)]
pub struct Decimal {
    ///
    pub negative: bool,
    /// Unscaled magnitude, at most 28 decimal digits.
    pub mantissa: u128,
    /// Number of digits to the right of the decimal point.
    pub scale: u8,
}

impl Decimal {
    ///
    pub fn new(negative: bool, mantissa: u128, scale: u8) -> Decimal {
        Decimal {
            negative,
            mantissa,
            scale,
        }
    }

    ///
    pub fn from_i64(x: i64, scale: u8) -> Decimal {
        Decimal {
            negative: x < 0,
            mantissa: x.unsigned_abs() as u128,
            scale,
        }
    }

    /// Change the scale, preserving the value exactly.
    pub fn rescale(&self, scale: u8) -> Option<Decimal> {
        if scale == self.scale {
            return Some(*self);
        }
        if scale > self.scale {
            let f = 10u128.checked_pow((scale - self.scale) as u32)?;
            let mantissa = self.mantissa.checked_mul(f)?;
            Some(Decimal::new(self.negative, mantissa, scale))
        } else {
            let f = 10u128.checked_pow((self.scale - scale) as u32)?;
            if self.mantissa % f != 0 {
                return None;
            }
            Some(Decimal::new(self.negative, self.mantissa / f, scale))
        }
    }

    /// ( integer part, fraction scaled to 28 digits ) for comparisons.
    /// Scales beyond 28 digits are not representable in a column.
    fn parts(&self) -> (u128, u128) {
        let scale = (self.scale as u32).min(28);
        let f = 10u128.pow(scale);
        let int = self.mantissa / f;
        let frac = (self.mantissa % f) * 10u128.pow(28 - scale);
        (int, frac)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Decimal) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl Ord for Decimal {
    fn cmp(&self, other: &Decimal) -> Ordering {
        let a_zero = self.mantissa == 0;
        let b_zero = other.mantissa == 0;
        let a_neg = self.negative && !a_zero;
        let b_neg = other.negative && !b_zero;
        match (a_neg, b_neg) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (neg, _) => {
                let c = self.parts().cmp(&other.parts());
                if neg {
                    c.reverse()
                } else {
                    c
                }
            }
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Decimal) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let sign = if self.negative && self.mantissa != 0 {
            "-"
        } else {
            ""
        };
        let scale = (self.scale as u32).min(28);
        if scale == 0 {
            return write!(f, "{}{}", sign, self.mantissa);
        }
        let p = 10u128.pow(scale);
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            self.mantissa / p,
            self.mantissa % p,
            width = scale as usize
        )
    }
}

/// A column value.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Value {
    ///
    Null,
    ///
    Bool(bool),
    ///
    Byte(u8),
    ///
    Short(i16),
    ///
    Int(i32),
    ///
    BigInt(i64),
    ///
    Float(f32),
    ///
    Double(f64),
    /// Currency, scaled by 10,000.
    Money(i64),
    ///
    Numeric(Decimal),
    ///
    DateTime(NaiveDateTime),
    ///
    ExtDateTime(NaiveDateTime),
    ///
    Text(Rc<String>),
    ///
    Binary(Rc<Vec<u8>>),
    ///
    Guid(Uuid),
    /// Complex-value foreign key, zero means no group allocated yet.
    Complex(i32),
}

impl Value {
    /// Text value from a &str.
    pub fn text(s: &str) -> Value {
        Value::Text(Rc::new(s.to_string()))
    }

    /// Binary value from a byte slice.
    pub fn binary(b: &[u8]) -> Value {
        Value::Binary(Rc::new(b.to_vec()))
    }

    ///
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Zero-ish default for a data type.
    pub fn default_for(typ: DataType) -> Value {
        match typ {
            DataType::Boolean => Value::Bool(false),
            DataType::Byte => Value::Byte(0),
            DataType::Short => Value::Short(0),
            DataType::Long => Value::Int(0),
            DataType::BigInt => Value::BigInt(0),
            DataType::Money => Value::Money(0),
            DataType::Float => Value::Float(0.0),
            DataType::Double => Value::Double(0.0),
            DataType::Numeric => Value::Numeric(Decimal::new(false, 0, 0)),
            DataType::Text | DataType::Memo => Value::Text(Rc::new(String::new())),
            DataType::Binary | DataType::Ole => Value::Binary(Rc::new(Vec::new())),
            DataType::Guid => Value::Guid(Uuid::nil()),
            DataType::ShortDateTime => Value::DateTime(codec::short_date_epoch()),
            DataType::ExtDateTime => Value::ExtDateTime(codec::short_date_epoch()),
            DataType::Complex => Value::Complex(0),
        }
    }

    /// Get integer content where the value is integral.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Byte(x) => Some(*x as i64),
            Value::Short(x) => Some(*x as i64),
            Value::Int(x) => Some(*x as i64),
            Value::BigInt(x) => Some(*x),
            Value::Complex(x) => Some(*x as i64),
            _ => None,
        }
    }

    /// Get text content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get binary content.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::BigInt(_) => 2,
            Value::Float(_) | Value::Double(_) => 3,
            Value::Money(_) => 4,
            Value::Numeric(_) => 5,
            Value::DateTime(_) => 6,
            Value::ExtDateTime(_) => 7,
            Value::Text(_) => 8,
            Value::Binary(_) => 9,
            Value::Guid(_) => 10,
            Value::Complex(_) => 11,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    /// Logical ordering. Null compares less than any value; integral values
    /// compare across widths; otherwise unlike types order by type.
    fn cmp(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Float(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Float(b)) => a.total_cmp(&(*b as f64)),
            (Money(a), Money(b)) => a.cmp(b),
            (Numeric(a), Numeric(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (ExtDateTime(a), ExtDateTime(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.as_str().cmp(b.as_str()),
            (Binary(a), Binary(b)) => a.cmp(b),
            (Guid(a), Guid(b)) => a.cmp(b),
            (Complex(a), Complex(b)) => a.cmp(b),
            (a, b) => {
                if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                    x.cmp(&y)
                } else {
                    a.rank().cmp(&b.rank())
                }
            }
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(x) => write!(f, "{}", x),
            Value::Byte(x) => write!(f, "{}", x),
            Value::Short(x) => write!(f, "{}", x),
            Value::Int(x) => write!(f, "{}", x),
            Value::BigInt(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Double(x) => write!(f, "{}", x),
            Value::Money(x) => {
                let (sign, a) = if *x < 0 {
                    ("-", x.unsigned_abs())
                } else {
                    ("", *x as u64)
                };
                write!(f, "{}{}.{:04}", sign, a / 10_000, a % 10_000)
            }
            Value::Numeric(x) => write!(f, "{}", x),
            Value::DateTime(x) => write!(f, "{}", x),
            Value::ExtDateTime(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Binary(b) => write!(f, "{}", util::to_hex(b)),
            Value::Guid(g) => write!(f, "{}", g),
            Value::Complex(x) => write!(f, "complex#{}", x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_ordering() {
        let a = Decimal::new(false, 1500, 2); // 15.00
        let b = Decimal::new(false, 151, 1); // 15.1
        let c = Decimal::new(true, 1, 0); // -1
        assert!(a < b);
        assert!(c < a);
        assert_eq!(a.rescale(3).unwrap(), Decimal::new(false, 15000, 3));
        assert!(Decimal::new(false, 151, 1).rescale(0).is_none());
        assert_eq!(format!("{}", b), "15.1");
        assert_eq!(format!("{}", c), "-1");
    }

    #[test]
    fn value_ordering() {
        assert!(Value::Null < Value::Int(i32::MIN));
        assert!(Value::Int(2) < Value::BigInt(3));
        assert!(Value::text("abc") < Value::text("abd"));
        assert_eq!(Value::Short(5), Value::Int(5));
    }

    #[test]
    fn type_ordinals_round_trip() {
        for t in [
            DataType::Boolean,
            DataType::Byte,
            DataType::Short,
            DataType::Long,
            DataType::Money,
            DataType::Float,
            DataType::Double,
            DataType::ShortDateTime,
            DataType::Binary,
            DataType::Text,
            DataType::Ole,
            DataType::Memo,
            DataType::Guid,
            DataType::Numeric,
            DataType::Complex,
            DataType::BigInt,
            DataType::ExtDateTime,
        ] {
            assert_eq!(DataType::from_ordinal(t.ordinal()).unwrap(), t);
        }
        assert!(DataType::from_ordinal(0x7E).is_err());
    }
}
