use crate::*;
use serde::{Deserialize, Serialize};

/// A property value. The type ordinal is implied by the variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    ///
    Bool(bool),
    ///
    Int(i64),
    ///
    Double(f64),
    ///
    Text(String),
    ///
    Binary(Vec<u8>),
}

impl PropertyValue {
    fn tag(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) => 2,
            PropertyValue::Double(_) => 3,
            PropertyValue::Text(_) => 4,
            PropertyValue::Binary(_) => 5,
        }
    }
}

/// Set of named properties attached to a schema object.
///
/// The serialized representation round-trips: parse, serialize, parse
/// again yields the same tuple set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyMap {
    props: BTreeMap<String, PropertyValue>,
}

impl PropertyMap {
    ///
    pub fn new() -> PropertyMap {
        PropertyMap::default()
    }

    ///
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.props.get(name)
    }

    /// Convenience accessor for text properties.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.props.get(name) {
            Some(PropertyValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    ///
    pub fn put(&mut self, name: &str, value: PropertyValue) {
        self.props.insert(name.to_string(), value);
    }

    ///
    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.props.remove(name)
    }

    ///
    pub fn len(&self) -> usize {
        self.props.len()
    }

    ///
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    ///
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.props.iter()
    }

    /// Serialize: count-prefixed ( name, type, value ) records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.props.len() as u16).to_le_bytes());
        for (name, value) in &self.props {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(value.tag());
            let vb = match value {
                PropertyValue::Bool(x) => vec![*x as u8],
                PropertyValue::Int(x) => x.to_le_bytes().to_vec(),
                PropertyValue::Double(x) => x.to_le_bytes().to_vec(),
                PropertyValue::Text(s) => s.as_bytes().to_vec(),
                PropertyValue::Binary(b) => b.clone(),
            };
            out.extend_from_slice(&(vb.len() as u32).to_le_bytes());
            out.extend_from_slice(&vb);
        }
        out
    }

    ///
    pub fn from_bytes(data: &[u8]) -> Result<PropertyMap> {
        let mut map = PropertyMap::new();
        if data.is_empty() {
            return Ok(map);
        }
        let mut off = 0usize;
        let need = |off: usize, n: usize| {
            if off + n > data.len() {
                Err(Error::corrupt("truncated property map"))
            } else {
                Ok(())
            }
        };
        need(off, 2)?;
        let count = util::getu16(data, off) as usize;
        off += 2;
        for _ in 0..count {
            need(off, 2)?;
            let nlen = util::getu16(data, off) as usize;
            off += 2;
            need(off, nlen + 1 + 4)?;
            let name = std::str::from_utf8(&data[off..off + nlen])
                .map_err(|_| Error::corrupt("bad utf-8 in property name"))?
                .to_string();
            off += nlen;
            let tag = data[off];
            off += 1;
            let vlen = util::getu32(data, off) as usize;
            off += 4;
            need(off, vlen)?;
            let vb = &data[off..off + vlen];
            off += vlen;
            let value = match tag {
                1 => {
                    if vlen != 1 {
                        return Err(Error::corrupt("bad bool property length"));
                    }
                    PropertyValue::Bool(vb[0] != 0)
                }
                2 => {
                    if vlen != 8 {
                        return Err(Error::corrupt("bad int property length"));
                    }
                    PropertyValue::Int(i64::from_le_bytes(vb.try_into().unwrap()))
                }
                3 => {
                    if vlen != 8 {
                        return Err(Error::corrupt("bad double property length"));
                    }
                    PropertyValue::Double(f64::from_le_bytes(vb.try_into().unwrap()))
                }
                4 => PropertyValue::Text(
                    std::str::from_utf8(vb)
                        .map_err(|_| Error::corrupt("bad utf-8 in property value"))?
                        .to_string(),
                ),
                5 => PropertyValue::Binary(vb.to_vec()),
                x => return Err(Error::corrupt(format!("unknown property type {}", x))),
            };
            map.props.insert(name, value);
        }
        Ok(map)
    }
}

/// Property maps for one catalog object and its columns and indexes,
/// stored together in the object's Properties blob.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertySet {
    /// Section name ( empty for the object itself, "Col:x" / "Idx:x" for
    /// its members ) to property map.
    pub sections: BTreeMap<String, PropertyMap>,
}

impl PropertySet {
    /// Section key for a column's property map.
    pub fn column_key(name: &str) -> String {
        format!("Col:{}", name.to_lowercase())
    }

    /// Section key for an index's property map.
    pub fn index_key(name: &str) -> String {
        format!("Idx:{}", name.to_lowercase())
    }

    ///
    pub fn section(&self, key: &str) -> PropertyMap {
        self.sections.get(key).cloned().unwrap_or_default()
    }

    ///
    pub fn set_section(&mut self, key: &str, map: PropertyMap) {
        if map.is_empty() {
            self.sections.remove(key);
        } else {
            self.sections.insert(key.to_string(), map);
        }
    }

    ///
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.sections.len() as u16).to_le_bytes());
        for (name, map) in &self.sections {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            let mb = map.to_bytes();
            out.extend_from_slice(&(mb.len() as u32).to_le_bytes());
            out.extend_from_slice(&mb);
        }
        out
    }

    ///
    pub fn from_bytes(data: &[u8]) -> Result<PropertySet> {
        let mut set = PropertySet::default();
        if data.is_empty() {
            return Ok(set);
        }
        if data.len() < 2 {
            return Err(Error::corrupt("truncated property set"));
        }
        let count = util::getu16(data, 0) as usize;
        let mut off = 2usize;
        for _ in 0..count {
            if off + 2 > data.len() {
                return Err(Error::corrupt("truncated property set"));
            }
            let nlen = util::getu16(data, off) as usize;
            off += 2;
            if off + nlen + 4 > data.len() {
                return Err(Error::corrupt("truncated property set"));
            }
            let name = std::str::from_utf8(&data[off..off + nlen])
                .map_err(|_| Error::corrupt("bad utf-8 in property section"))?
                .to_string();
            off += nlen;
            let mlen = util::getu32(data, off) as usize;
            off += 4;
            if off + mlen > data.len() {
                return Err(Error::corrupt("truncated property set"));
            }
            let map = PropertyMap::from_bytes(&data[off..off + mlen])?;
            off += mlen;
            set.sections.insert(name, map);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_round_trip() {
        let mut m = PropertyMap::new();
        m.put("Description", PropertyValue::Text("a table".to_string()));
        m.put("Required", PropertyValue::Bool(true));
        m.put("DefaultValue", PropertyValue::Int(42));
        m.put("Scale", PropertyValue::Double(0.5));
        m.put("Blob", PropertyValue::Binary(vec![1, 2, 3]));
        let b = m.to_bytes();
        let m2 = PropertyMap::from_bytes(&b).unwrap();
        assert_eq!(m, m2);
        // Parse, serialize, parse again is a fixpoint.
        assert_eq!(m2.to_bytes(), b);
    }

    #[test]
    fn set_round_trip() {
        let mut s = PropertySet::default();
        let mut m = PropertyMap::new();
        m.put("Caption", PropertyValue::Text("x".to_string()));
        s.set_section("", m.clone());
        s.set_section(&PropertySet::column_key("Id"), m);
        let b = s.to_bytes();
        assert_eq!(PropertySet::from_bytes(&b).unwrap(), s);
    }

    #[test]
    fn empty_and_corrupt() {
        assert!(PropertyMap::from_bytes(&[]).unwrap().is_empty());
        assert!(PropertyMap::from_bytes(&[5, 0, 1]).is_err());
    }
}
