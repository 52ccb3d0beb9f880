use crate::error::{Error, Result};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Leaf encoding tags; one type byte ahead of the payload.
const TAG_STRING: u8 = b's';
const TAG_NUMBER: u8 = b'n';
const TAG_BOOL: u8 = b'b';
const TAG_NULL: u8 = b'z';
const TAG_COMPOUND: u8 = b'm';
const TAG_BRANCH: u8 = b't';

/// Branch marker for a subtree that reconstructs as an object.
pub const BRANCH_OBJECT: [u8; 2] = [TAG_BRANCH, b'o'];
/// Branch marker for a subtree that reconstructs as an array.
pub const BRANCH_ARRAY: [u8; 2] = [TAG_BRANCH, b'a'];

/// The shape recorded in a branch marker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BranchKind {
    Object,
    Array,
}

/// Returns the branch shape if `bytes` is a branch marker.
pub fn branch_kind(bytes: &[u8]) -> Option<BranchKind> {
    match bytes {
        [TAG_BRANCH, b'o'] => Some(BranchKind::Object),
        [TAG_BRANCH, b'a'] => Some(BranchKind::Array),
        _ => None,
    }
}

/// A JSON-like value.
///
/// Equality is structural; numbers compare by their IEEE 754 bit
/// pattern, so `NaN == NaN` and `0.0 != -0.0`.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Parses JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidJson(e.to_string()))
    }

    /// Serializes to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("value serialization is infallible")
    }

    /// Returns true for null, bool, number and string.
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Looks up a field of an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Encodes a value for storage at a single key.
    ///
    /// Primitives use the one-byte type prefix; compound values fall
    /// back to the `'m'` prefix over a compact binary body. The tree
    /// store never stores compounds this way (it decomposes), so the
    /// fallback only appears for callers that bypass decomposition.
    pub fn encode_leaf(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![TAG_NULL],
            Value::Bool(b) => vec![TAG_BOOL, *b as u8],
            Value::Number(n) => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
                out
            }
            Value::String(s) => {
                let mut out = Vec::with_capacity(1 + s.len());
                out.push(TAG_STRING);
                out.extend_from_slice(s.as_bytes());
                out
            }
            compound => {
                let body =
                    serde_cbor::to_vec(compound).expect("value serialization is infallible");
                let mut out = Vec::with_capacity(1 + body.len());
                out.push(TAG_COMPOUND);
                out.extend(body);
                out
            }
        }
    }

    /// Decodes a stored leaf. Branch markers are not leaves and yield
    /// a decode error; check [`branch_kind`] first.
    pub fn decode_leaf(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&TAG_NULL, [])) => Ok(Value::Null),
            Some((&TAG_BOOL, [b])) => Ok(Value::Bool(*b != 0)),
            Some((&TAG_NUMBER, body)) => {
                let body: [u8; 8] = body
                    .try_into()
                    .map_err(|_| Error::Decode("number leaf is not 8 bytes".into()))?;
                Ok(Value::Number(f64::from_le_bytes(body)))
            }
            Some((&TAG_STRING, body)) => {
                let s = std::str::from_utf8(body)
                    .map_err(|_| Error::Decode("string leaf is not utf8".into()))?;
                Ok(Value::String(s.into()))
            }
            Some((&TAG_COMPOUND, body)) => serde_cbor::from_slice(body)
                .map_err(|e| Error::Decode(format!("compound leaf: {}", e))),
            Some((&TAG_BRANCH, _)) => Err(Error::Decode("branch marker is not a leaf".into())),
            Some((tag, _)) => Err(Error::Decode(format!("unknown leaf tag {:#04x}", tag))),
            None => Err(Error::Decode("empty leaf".into())),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a json value")
            }

            fn visit_unit<E>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> std::result::Result<Value, D::Error> {
                Deserialize::deserialize(deserializer)
            }

            fn visit_bool<E>(self, b: bool) -> std::result::Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E>(self, n: i64) -> std::result::Result<Value, E> {
                Ok(Value::Number(n as f64))
            }

            fn visit_u64<E>(self, n: u64) -> std::result::Result<Value, E> {
                Ok(Value::Number(n as f64))
            }

            fn visit_f64<E>(self, n: f64) -> std::result::Result<Value, E> {
                Ok(Value::Number(n))
            }

            fn visit_str<E: de::Error>(self, s: &str) -> std::result::Result<Value, E> {
                Ok(Value::String(s.into()))
            }

            fn visit_string<E>(self, s: String) -> std::result::Result<Value, E> {
                Ok(Value::String(s))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Value, A::Error> {
                let mut map = BTreeMap::new();
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    map.insert(k, v);
                }
                Ok(Value::Object(map))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Shorthand for building object values in tests and examples.
#[macro_export]
macro_rules! object {
    ($($key:literal => $val:expr),* $(,)?) => {{
        let mut map = std::collections::BTreeMap::new();
        $(map.insert($key.to_string(), $crate::Value::from($val));)*
        $crate::Value::Object(map)
    }};
}
