//! Field-level wire grammar shared by every message payload.
//!
//! ```text
//! field    := [int32 fieldId] [int32 wireKind] [payload]
//! wireKind := 0 Bool | 1 Byte | 2 Int16 | 3 Int32 | 4 Int64
//!           | 5 String(int32 byteLen, UTF-8)
//!           | 6 Array(int32 elementKind, int32 count, count * payload)
//!           | 7 Complex(int32 nestedLength, field*)
//! ```
//!
//! All integers are little-endian. Every payload is self-delimiting, so a
//! decoder can step over fields it has never heard of.

use std::collections::BTreeMap;
use std::collections::btree_map;

use bytes::{Buf, BufMut, BytesMut};

use super::error::ProtocolError;

pub type FieldId = u32;

/// Nesting limit for arrays and complex fields on decode.
pub const MAX_NESTING_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireKind {
    Bool,
    Byte,
    Int16,
    Int32,
    Int64,
    String,
    Array,
    Complex,
}

impl WireKind {
    pub fn as_wire(self) -> i32 {
        match self {
            Self::Bool => 0,
            Self::Byte => 1,
            Self::Int16 => 2,
            Self::Int32 => 3,
            Self::Int64 => 4,
            Self::String => 5,
            Self::Array => 6,
            Self::Complex => 7,
        }
    }

    pub fn from_wire(raw: i32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => Self::Bool,
            1 => Self::Byte,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::String,
            6 => Self::Array,
            7 => Self::Complex,
            other => return Err(ProtocolError::corrupt(format!("unknown wire kind {other}"))),
        })
    }
}

/// A single typed property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
    /// Homogeneous array; every item must be of `element` kind.
    Array {
        element: WireKind,
        items: Vec<FieldValue>,
    },
    Complex(Fields),
}

impl FieldValue {
    pub fn kind(&self) -> WireKind {
        match self {
            Self::Bool(_) => WireKind::Bool,
            Self::Byte(_) => WireKind::Byte,
            Self::Int16(_) => WireKind::Int16,
            Self::Int32(_) => WireKind::Int32,
            Self::Int64(_) => WireKind::Int64,
            Self::String(_) => WireKind::String,
            Self::Array { .. } => WireKind::Array,
            Self::Complex(_) => WireKind::Complex,
        }
    }

    pub fn array(element: WireKind, items: Vec<FieldValue>) -> Self {
        Self::Array { element, items }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        Self::Byte(v)
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Fields> for FieldValue {
    fn from(v: Fields) -> Self {
        Self::Complex(v)
    }
}

/// Ordered field-id → value map. Iteration (and therefore encoding) is in
/// ascending id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(BTreeMap<FieldId, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: FieldId, value: impl Into<FieldValue>) -> Self {
        self.0.insert(id, value.into());
        self
    }

    pub fn insert(&mut self, id: FieldId, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.0.insert(id, value.into())
    }

    pub fn remove(&mut self, id: FieldId) -> Option<FieldValue> {
        self.0.remove(&id)
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.0.get(&id)
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FieldId, FieldValue> {
        self.0.iter()
    }

    pub fn get_bool(&self, id: FieldId) -> Option<bool> {
        match self.get(id) {
            Some(FieldValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u8(&self, id: FieldId) -> Option<u8> {
        match self.get(id) {
            Some(FieldValue::Byte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i16(&self, id: FieldId) -> Option<i16> {
        match self.get(id) {
            Some(FieldValue::Int16(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i32(&self, id: FieldId) -> Option<i32> {
        match self.get(id) {
            Some(FieldValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, id: FieldId) -> Option<i64> {
        match self.get(id) {
            Some(FieldValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, id: FieldId) -> Option<&str> {
        match self.get(id) {
            Some(FieldValue::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_array(&self, id: FieldId) -> Option<&[FieldValue]> {
        match self.get(id) {
            Some(FieldValue::Array { items, .. }) => Some(items),
            _ => None,
        }
    }

    pub fn get_complex(&self, id: FieldId) -> Option<&Fields> {
        match self.get(id) {
            Some(FieldValue::Complex(v)) => Some(v),
            _ => None,
        }
    }
}

impl FromIterator<(FieldId, FieldValue)> for Fields {
    fn from_iter<I: IntoIterator<Item = (FieldId, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Fields {
    type Item = (FieldId, FieldValue);
    type IntoIter = btree_map::IntoIter<FieldId, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Fields {
    type Item = (&'a FieldId, &'a FieldValue);
    type IntoIter = btree_map::Iter<'a, FieldId, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn wire_int(value: usize, what: &str) -> Result<i32, ProtocolError> {
    i32::try_from(value)
        .map_err(|_| ProtocolError::invalid_message(format!("{what} {value} exceeds int32 range")))
}

/// Append one field (id, kind, payload) to `dst`.
pub fn encode_field(id: FieldId, value: &FieldValue, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    dst.put_i32_le(wire_int(id as usize, "field id")?);
    dst.put_i32_le(value.kind().as_wire());
    encode_payload(value, dst)
}

pub fn encode_fields(fields: &Fields, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    for (id, value) in fields {
        encode_field(*id, value, dst)?;
    }
    Ok(())
}

fn encode_payload(value: &FieldValue, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    match value {
        FieldValue::Bool(v) => dst.put_u8(u8::from(*v)),
        FieldValue::Byte(v) => dst.put_u8(*v),
        FieldValue::Int16(v) => dst.put_i16_le(*v),
        FieldValue::Int32(v) => dst.put_i32_le(*v),
        FieldValue::Int64(v) => dst.put_i64_le(*v),
        FieldValue::String(v) => {
            dst.put_i32_le(wire_int(v.len(), "string length")?);
            dst.put_slice(v.as_bytes());
        }
        FieldValue::Array { element, items } => {
            dst.put_i32_le(element.as_wire());
            dst.put_i32_le(wire_int(items.len(), "array length")?);
            for item in items {
                if item.kind() != *element {
                    return Err(ProtocolError::invalid_message(format!(
                        "array declared as {:?} contains a {:?} item",
                        element,
                        item.kind()
                    )));
                }
                encode_payload(item, dst)?;
            }
        }
        FieldValue::Complex(nested) => {
            let start = dst.len();
            dst.put_i32_le(0);
            encode_fields(nested, dst)?;
            let nested_len = wire_int(dst.len() - start - 4, "complex length")?;
            dst[start..start + 4].copy_from_slice(&nested_len.to_le_bytes());
        }
    }
    Ok(())
}

fn need(src: &[u8], n: usize, what: &str) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::corrupt(format!(
            "truncated {what}: need {n} bytes, have {}",
            src.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn read_i32(src: &mut &[u8], what: &str) -> Result<i32, ProtocolError> {
    need(src, 4, what)?;
    Ok(src.get_i32_le())
}

fn read_len(src: &mut &[u8], what: &str) -> Result<usize, ProtocolError> {
    let len = read_i32(src, what)?;
    if len < 0 {
        return Err(ProtocolError::corrupt(format!("negative {what} {len}")));
    }
    let len = len as usize;
    need(src, len, what)?;
    Ok(len)
}

/// Decode a complete field sequence. Duplicate ids are rejected.
pub fn decode_fields(src: &[u8]) -> Result<Fields, ProtocolError> {
    decode_fields_at(src, 0)
}

fn decode_fields_at(mut src: &[u8], depth: usize) -> Result<Fields, ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::corrupt("fields nested too deeply"));
    }
    let mut fields = BTreeMap::new();
    while src.has_remaining() {
        let id = read_i32(&mut src, "field id")?;
        if id < 0 {
            return Err(ProtocolError::corrupt(format!("negative field id {id}")));
        }
        let kind = WireKind::from_wire(read_i32(&mut src, "wire kind")?)?;
        let value = decode_payload(kind, &mut src, depth)?;
        if fields.insert(id as FieldId, value).is_some() {
            return Err(ProtocolError::corrupt(format!("duplicate field id {id}")));
        }
    }
    Ok(Fields(fields))
}

fn decode_payload(kind: WireKind, src: &mut &[u8], depth: usize) -> Result<FieldValue, ProtocolError> {
    Ok(match kind {
        WireKind::Bool => {
            need(src, 1, "bool")?;
            match src.get_u8() {
                0 => FieldValue::Bool(false),
                1 => FieldValue::Bool(true),
                other => return Err(ProtocolError::corrupt(format!("invalid bool byte {other}"))),
            }
        }
        WireKind::Byte => {
            need(src, 1, "byte")?;
            FieldValue::Byte(src.get_u8())
        }
        WireKind::Int16 => {
            need(src, 2, "int16")?;
            FieldValue::Int16(src.get_i16_le())
        }
        WireKind::Int32 => FieldValue::Int32(read_i32(src, "int32")?),
        WireKind::Int64 => {
            need(src, 8, "int64")?;
            FieldValue::Int64(src.get_i64_le())
        }
        WireKind::String => {
            let len = read_len(src, "string length")?;
            let text = std::str::from_utf8(&src[..len])
                .map_err(|e| ProtocolError::corrupt(format!("string is not UTF-8: {e}")))?
                .to_string();
            src.advance(len);
            FieldValue::String(text)
        }
        WireKind::Array => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(ProtocolError::corrupt("arrays nested too deeply"));
            }
            let element = WireKind::from_wire(read_i32(src, "array element kind")?)?;
            let count = read_i32(src, "array count")?;
            if count < 0 {
                return Err(ProtocolError::corrupt(format!("negative array count {count}")));
            }
            // Every element occupies at least one byte.
            let count = count as usize;
            need(src, count, "array items")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_payload(element, src, depth + 1)?);
            }
            FieldValue::Array { element, items }
        }
        WireKind::Complex => {
            let len = read_len(src, "complex length")?;
            let nested = decode_fields_at(&src[..len], depth + 1)?;
            src.advance(len);
            FieldValue::Complex(nested)
        }
    })
}
