//! Canonical, schema-less value encoding (a MessagePack-equivalent codec).
//!
//! `Value` covers the domain the replication core needs to move across the
//! wire: null, bool, integer, float, UTF-8 string, raw bytes, and arrays of
//! the same. `Value` implements `Serialize`/`Deserialize` by hand so it maps
//! directly onto MessagePack's native types instead of being wrapped in an
//! enum tag — this is what makes the encoding canonical: semantically equal
//! values always produce byte-identical output, because there is exactly
//! one way to write down each one. Maps are `BTreeMap<String, Value>`, whose
//! iteration order is already lexicographic by key, so `rmp-serde` emits
//! sorted-key maps with no extra bookkeeping.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SyncError};

/// A single canonically-encodable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
}

/// An ordered column-name to value mapping; keys are always emitted sorted.
pub type ValueMap = BTreeMap<String, Value>;

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => serializer.serialize_bytes(b),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a null, bool, integer, float, string, byte array, or array of these")
    }

    fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E>(self, v: bool) -> std::result::Result<Self::Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| de::Error::custom("integer out of i64 range"))
    }

    fn visit_f64<E>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> std::result::Result<Self::Value, E> {
        Ok(Value::Text(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
        Ok(Value::Blob(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E> {
        Ok(Value::Blob(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Encodes an ordered column map canonically.
pub fn encode_map(map: &ValueMap) -> Result<Vec<u8>> {
    rmp_serde::to_vec(map).map_err(|e| SyncError::Encoding(e.to_string()))
}

/// Decodes a canonically-encoded column map.
pub fn decode_map(bytes: &[u8]) -> Result<ValueMap> {
    rmp_serde::from_slice(bytes).map_err(|e| SyncError::Encoding(e.to_string()))
}

/// Encodes a primary key, which is one value for a simple key or several
/// for a composite key, preserving the table's declared column order.
pub fn encode_pk(parts: &[Value]) -> Result<Vec<u8>> {
    rmp_serde::to_vec(&parts.to_vec()).map_err(|e| SyncError::Encoding(e.to_string()))
}

/// Decodes a primary key back into its constituent values, in column order.
pub fn decode_pk(bytes: &[u8]) -> Result<Vec<Value>> {
    rmp_serde::from_slice(bytes).map_err(|e| SyncError::Encoding(e.to_string()))
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
            // Change capture's `json_object(col, val, ...)` never nests objects;
            // anything that does is out of the codec's supported domain.
            serde_json::Value::Object(_) => Value::Null,
        }
    }
}

/// Decodes the JSON object produced by SQLite's `json_object(...)` (as used
/// by change-capture triggers) into a canonical [`ValueMap`]. Not the
/// inverse of [`encode_map`]/[`decode_map`] — those round-trip the binary
/// codec; this bridges from SQL-generated JSON text instead.
pub fn map_from_json(json: &str) -> Result<ValueMap> {
    let parsed: serde_json::Value =
        serde_json::from_str(json).map_err(|e| SyncError::Encoding(e.to_string()))?;
    let obj = match parsed {
        serde_json::Value::Object(map) => map,
        _ => return Err(SyncError::Encoding("expected a JSON object".to_string())),
    };
    Ok(obj.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect())
}
