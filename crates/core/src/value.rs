//! The transferable value vocabulary (§4.1): the fixed set of runtime types
//! every serializer round-trips by value, plus proxies and binary arrays.
//!
//! `Value` carries its own hand-written `Serialize`/`Deserialize` rather than
//! a derived enum tagging, because the wire encoding it must produce is the
//! envelope scheme from §6 ("other envelope tags: ndarray, datetime, date,
//! tuple, ..."), not serde's default enum representation. The same impl
//! drives both concrete serializers (`serializer::msgpack`, `serializer::json`)
//! by branching on `Serializer::is_human_readable()` wherever the two wire
//! formats diverge (raw bytes vs base64 text).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::consts::{
    ENVELOPE_TAG_BYTES, ENVELOPE_TAG_DATE, ENVELOPE_TAG_DATETIME, ENVELOPE_TAG_KEY,
    ENVELOPE_TAG_NDARRAY, ENVELOPE_TAG_PROXY, ENVELOPE_TAG_TUPLE,
};
use crate::object::RemoteObject;
use crate::proxy::ProxyHandle;

/// Element type tag for an [`NdArray`]. The core treats array contents as an
/// opaque transferable buffer (per the Non-goals: shared-memory array
/// helpers are out of scope) — this enumerates only the element width/layout
/// needed to slice the raw buffer back into typed chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F64,
    F32,
    I64,
    I32,
    U8,
    Bool,
}

impl DType {
    fn as_str(&self) -> &'static str {
        match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "f64" => DType::F64,
            "f32" => DType::F32,
            "i64" => DType::I64,
            "i32" => DType::I32,
            "u8" => DType::U8,
            "bool" => DType::Bool,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Raw little-endian bytes of a contiguous, row-major buffer.
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::F64,
            shape,
            data,
        }
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if self.dtype != DType::F64 || self.data.len() % 8 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect(),
        )
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A runtime value in the transferable set, or a reference into another
/// process (`Proxy`), or — only ever produced by [`crate::serializer::decode_with_context`],
/// never by plain deserialization — a handle already resolved to a local
/// referent (`Object`).
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Tuple(Vec<Value>),
    Map(Vec<(String, Value)>),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    NdArray(NdArray),
    Proxy(ProxyHandle),
    Object(Arc<dyn RemoteObject>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes[{}]", b.len()),
            Value::Seq(s) => write!(f, "Seq{s:?}"),
            Value::Tuple(t) => write!(f, "Tuple{t:?}"),
            Value::Map(m) => write!(f, "Map{m:?}"),
            Value::DateTime(d) => write!(f, "DateTime({d})"),
            Value::Date(d) => write!(f, "Date({d})"),
            Value::NdArray(a) => write!(f, "NdArray(dtype={:?}, shape={:?})", a.dtype, a.shape),
            Value::Proxy(p) => write!(f, "Proxy({p:?})"),
            Value::Object(o) => write!(f, "Object(type={})", o.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::NdArray(a), Value::NdArray(b)) => a == b,
            (Value::Proxy(a), Value::Proxy(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<ProxyHandle> for Value {
    fn from(v: ProxyHandle) -> Self {
        Value::Proxy(v)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let human_readable = serializer.is_human_readable();
        match self {
            Value::None => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                if human_readable {
                    let mut map = serializer.serialize_map(Some(2))?;
                    map.serialize_entry(ENVELOPE_TAG_KEY, ENVELOPE_TAG_BYTES)?;
                    map.serialize_entry("data", &base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        b,
                    ))?;
                    map.end()
                } else {
                    serializer.serialize_bytes(b)
                }
            }
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Tuple(items) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(ENVELOPE_TAG_KEY, ENVELOPE_TAG_TUPLE)?;
                map.serialize_entry("items", items)?;
                map.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::DateTime(dt) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(ENVELOPE_TAG_KEY, ENVELOPE_TAG_DATETIME)?;
                map.serialize_entry("iso", &dt.to_rfc3339_opts(SecondsFormat::Micros, true))?;
                map.end()
            }
            Value::Date(d) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(ENVELOPE_TAG_KEY, ENVELOPE_TAG_DATE)?;
                map.serialize_entry("iso", &d.format("%Y-%m-%d").to_string())?;
                map.end()
            }
            Value::NdArray(arr) => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry(ENVELOPE_TAG_KEY, ENVELOPE_TAG_NDARRAY)?;
                map.serialize_entry("dtype", arr.dtype.as_str())?;
                map.serialize_entry("shape", &arr.shape)?;
                if human_readable {
                    map.serialize_entry(
                        "data",
                        &base64::Engine::encode(
                            &base64::engine::general_purpose::STANDARD,
                            &arr.data,
                        ),
                    )?;
                } else {
                    map.serialize_entry("data", serde_bytes::Bytes::new(&arr.data))?;
                }
                map.end()
            }
            Value::Proxy(p) => {
                let mut map = serializer.serialize_map(Some(6))?;
                map.serialize_entry(ENVELOPE_TAG_KEY, ENVELOPE_TAG_PROXY)?;
                map.serialize_entry("peer_address", &p.peer_address)?;
                map.serialize_entry("object_id", &p.object_id)?;
                map.serialize_entry("ref_id", &p.ref_id)?;
                map.serialize_entry("type_string", &p.type_string)?;
                map.serialize_entry("attribute_path", &p.attribute_path)?;
                map.end()
            }
            Value::Object(obj) => Err(serde::ser::Error::custom(format!(
                "Value::Object({}) must be resolved to a Proxy by encode_with_context before wire serialization",
                obj.type_name()
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a value in the transferable set")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::None)
    }
    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::None)
    }
    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }
    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }
    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Int(v as i64))
    }
    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }
    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }
    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }
    fn visit_bytes<E>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }
    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(v) = seq.next_element::<Value>()? {
            items.push(v);
        }
        Ok(Value::Seq(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries: Vec<(String, Value)> = Vec::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            entries.push((k, v));
        }
        decode_envelope(entries).map_err(de::Error::custom)
    }
}

fn decode_envelope(mut entries: Vec<(String, Value)>) -> Result<Value, String> {
    let tag_idx = entries.iter().position(|(k, _)| k == ENVELOPE_TAG_KEY);
    let Some(idx) = tag_idx else {
        return Ok(Value::Map(entries));
    };
    let (_, tag_value) = entries.remove(idx);
    let Value::Str(tag) = tag_value else {
        return Err("envelope tag must be a string".to_string());
    };
    let field = |entries: &mut Vec<(String, Value)>, name: &str| -> Option<Value> {
        entries
            .iter()
            .position(|(k, _)| k == name)
            .map(|i| entries.remove(i).1)
    };
    match tag.as_str() {
        ENVELOPE_TAG_BYTES => {
            let data = field(&mut entries, "data").ok_or("bytes envelope missing data")?;
            let Value::Str(b64) = data else {
                return Err("bytes envelope data must be a string".to_string());
            };
            use base64::Engine;
            let raw = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| e.to_string())?;
            Ok(Value::Bytes(raw))
        }
        "tuple" => {
            let items = field(&mut entries, "items").ok_or("tuple envelope missing items")?;
            let Value::Seq(items) = items else {
                return Err("tuple envelope items must be a sequence".to_string());
            };
            Ok(Value::Tuple(items))
        }
        "datetime" => {
            let iso = field(&mut entries, "iso").ok_or("datetime envelope missing iso")?;
            let Value::Str(iso) = iso else {
                return Err("datetime iso must be a string".to_string());
            };
            let dt = DateTime::parse_from_rfc3339(&iso)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc);
            Ok(Value::DateTime(dt))
        }
        "date" => {
            let iso = field(&mut entries, "iso").ok_or("date envelope missing iso")?;
            let Value::Str(iso) = iso else {
                return Err("date iso must be a string".to_string());
            };
            let d = NaiveDate::parse_from_str(&iso, "%Y-%m-%d").map_err(|e| e.to_string())?;
            Ok(Value::Date(d))
        }
        "ndarray" => {
            let dtype = field(&mut entries, "dtype").ok_or("ndarray envelope missing dtype")?;
            let Value::Str(dtype) = dtype else {
                return Err("ndarray dtype must be a string".to_string());
            };
            let dtype = DType::from_str(&dtype).ok_or("unknown ndarray dtype")?;
            let shape = field(&mut entries, "shape").ok_or("ndarray envelope missing shape")?;
            let Value::Seq(shape) = shape else {
                return Err("ndarray shape must be a sequence".to_string());
            };
            let shape = shape
                .into_iter()
                .map(|v| match v {
                    Value::Int(i) => Ok(i as usize),
                    _ => Err("ndarray shape entries must be integers".to_string()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let data = field(&mut entries, "data").ok_or("ndarray envelope missing data")?;
            let data = match data {
                Value::Bytes(b) => b,
                Value::Str(b64) => {
                    use base64::Engine;
                    base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| e.to_string())?
                }
                _ => return Err("ndarray data must be bytes or base64 string".to_string()),
            };
            Ok(Value::NdArray(NdArray { dtype, shape, data }))
        }
        "proxy" => {
            let get_str = |entries: &mut Vec<(String, Value)>, name: &str| -> Result<String, String> {
                match field(entries, name) {
                    Some(Value::Str(s)) => Ok(s),
                    _ => Err(format!("proxy envelope missing/invalid {name}")),
                }
            };
            let get_int = |entries: &mut Vec<(String, Value)>, name: &str| -> Result<i64, String> {
                match field(entries, name) {
                    Some(Value::Int(i)) => Ok(i),
                    _ => Err(format!("proxy envelope missing/invalid {name}")),
                }
            };
            let peer_address = get_str(&mut entries, "peer_address")?;
            let object_id = get_int(&mut entries, "object_id")? as u64;
            let ref_id = get_int(&mut entries, "ref_id")? as u64;
            let type_string = get_str(&mut entries, "type_string")?;
            let attribute_path = match field(&mut entries, "attribute_path") {
                Some(Value::Seq(items)) => items
                    .into_iter()
                    .map(|v| match v {
                        Value::Str(s) => Ok(s),
                        _ => Err("attribute_path entries must be strings".to_string()),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => Vec::new(),
            };
            Ok(Value::Proxy(ProxyHandle::from_wire(
                peer_address,
                object_id,
                ref_id,
                type_string,
                attribute_path,
            )))
        }
        other => Err(format!("unknown envelope tag {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{json, msgpack};

    #[test]
    fn round_trips_primitives_through_both_formats() {
        let values = vec![
            Value::None,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(3.5),
            Value::Str("hi".to_string()),
            Value::Bytes(vec![1, 2, 3]),
            Value::Seq(vec![Value::Int(1), Value::Int(2)]),
            Value::Tuple(vec![Value::Int(1), Value::Str("a".to_string())]),
        ];
        for v in values {
            let encoded = msgpack::encode(&v).unwrap();
            let decoded = msgpack::decode(&encoded).unwrap();
            assert_eq!(v, decoded);

            let encoded = json::encode(&v).unwrap();
            let decoded = json::decode(&encoded).unwrap();
            assert_eq!(v, decoded);
        }
    }

    #[test]
    fn ndarray_round_trips() {
        let arr = NdArray::from_f64(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let v = Value::NdArray(arr.clone());
        let encoded = msgpack::encode(&v).unwrap();
        let Value::NdArray(back) = msgpack::decode(&encoded).unwrap() else {
            panic!("expected ndarray");
        };
        assert_eq!(back.to_f64_vec().unwrap(), arr.to_f64_vec().unwrap());
        assert_eq!(back.shape, arr.shape);
    }

    #[test]
    fn map_round_trips_and_is_distinct_from_tuple() {
        let v = Value::Map(vec![("a".to_string(), Value::Int(1))]);
        let encoded = json::encode(&v).unwrap();
        let decoded = json::decode(&encoded).unwrap();
        assert_eq!(v, decoded);
    }
}
