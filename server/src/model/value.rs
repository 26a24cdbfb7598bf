//! Dynamic attribute values.
//!
//! OTLP attributes are heterogeneous dictionaries. Internally they are
//! normalized to a sorted `BTreeMap<String, Value>` with a tagged value
//! variant, which gives us a deterministic canonical byte form (the
//! fingerprint input) and a stable JSON encoding (the JSONB storage form).

use std::collections::BTreeMap;

use opentelemetry_proto::tonic::common::v1::any_value::Value as OtlpValueKind;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};

/// A normalized attribute map. `BTreeMap` keeps keys in byte order, which is
/// the order the canonical serializer relies on.
pub type AttrMap = BTreeMap<String, Value>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    KvList(BTreeMap<String, Value>),
}

// Canonical form tag bytes. The canonical encoding is length-prefixed so that
// no value can be a prefix of another; changing these invalidates every
// stored fingerprint.
const TAG_STRING: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_KVLIST: u8 = 7;

impl Value {
    /// Append this value's canonical byte form to `out`.
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Self::String(s) => {
                out.push(TAG_STRING);
                write_len_prefixed(out, s.as_bytes());
            }
            Self::Int64(i) => {
                out.push(TAG_INT64);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Self::Double(d) => {
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&d.to_bits().to_le_bytes());
            }
            Self::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Self::Bytes(b) => {
                out.push(TAG_BYTES);
                write_len_prefixed(out, b);
            }
            Self::Array(items) => {
                out.push(TAG_ARRAY);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.write_canonical(out);
                }
            }
            Self::KvList(map) => {
                out.push(TAG_KVLIST);
                write_canonical_map(map, out);
            }
        }
    }

    /// Storage encoding: plain JSON where the type is unambiguous, with
    /// byte arrays wrapped so they cannot be mistaken for strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int64(i) => serde_json::Value::from(*i),
            Self::Double(d) => serde_json::Number::from_f64(*d)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Bytes(b) => serde_json::json!({ "__bytes": hex::encode(b) }),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::KvList(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Truncate oversized payloads in place. Strings are cut at a char
    /// boundary at or below `max_bytes`; byte arrays are cut exactly.
    /// Containers recurse. Scalars other than strings/bytes are unaffected.
    pub fn truncate(&mut self, max_bytes: usize) {
        match self {
            Self::String(s) => {
                if s.len() > max_bytes {
                    let mut cut = max_bytes;
                    while cut > 0 && !s.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    s.truncate(cut);
                }
            }
            Self::Bytes(b) => b.truncate(max_bytes),
            Self::Array(items) => {
                for item in items {
                    item.truncate(max_bytes);
                }
            }
            Self::KvList(map) => {
                for v in map.values_mut() {
                    v.truncate(max_bytes);
                }
            }
            Self::Int64(_) | Self::Double(_) | Self::Bool(_) => {}
        }
    }

    /// The value as a display string, for promotion into typed columns
    /// (service name extraction and the like).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&AnyValue> for Value {
    fn from(v: &AnyValue) -> Self {
        match &v.value {
            Some(OtlpValueKind::StringValue(s)) => Self::String(s.clone()),
            Some(OtlpValueKind::IntValue(i)) => Self::Int64(*i),
            Some(OtlpValueKind::DoubleValue(d)) => Self::Double(*d),
            Some(OtlpValueKind::BoolValue(b)) => Self::Bool(*b),
            Some(OtlpValueKind::BytesValue(b)) => Self::Bytes(b.clone()),
            Some(OtlpValueKind::ArrayValue(arr)) => {
                Self::Array(arr.values.iter().map(Self::from).collect())
            }
            Some(OtlpValueKind::KvlistValue(kvs)) => Self::KvList(attrs_from_otlp(&kvs.values)),
            None => Self::String(String::new()),
        }
    }
}

/// Convert an OTLP key-value list into a normalized attribute map.
///
/// Later duplicates win, matching collector semantics. Entries with a
/// missing value become empty strings rather than being dropped, so the
/// key's presence survives normalization.
pub fn attrs_from_otlp(kvs: &[KeyValue]) -> AttrMap {
    let mut map = AttrMap::new();
    for kv in kvs {
        let value = kv
            .value
            .as_ref()
            .map_or_else(|| Value::String(String::new()), Value::from);
        map.insert(kv.key.clone(), value);
    }
    map
}

/// Append the canonical byte form of a whole attribute map to `out`.
pub fn write_canonical_map(map: &BTreeMap<String, Value>, out: &mut Vec<u8>) {
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (k, v) in map {
        write_len_prefixed(out, k.as_bytes());
        v.write_canonical(out);
    }
}

/// The canonical byte form of an attribute map, as a fresh buffer.
pub fn canonical_bytes(map: &AttrMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(map.len() * 24);
    write_canonical_map(map, &mut out);
    out
}

/// JSONB storage form of an attribute map.
pub fn attrs_to_json(map: &AttrMap) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> AttrMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn canonical_bytes_ignore_insertion_order() {
        let mut a = AttrMap::new();
        a.insert("zebra".into(), Value::Int64(1));
        a.insert("alpha".into(), Value::String("x".into()));

        let mut b = AttrMap::new();
        b.insert("alpha".into(), Value::String("x".into()));
        b.insert("zebra".into(), Value::Int64(1));

        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn canonical_bytes_distinguish_int_and_double() {
        let a = map(&[("v", Value::Int64(1))]);
        let b = map(&[("v", Value::Double(1.0))]);
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn canonical_bytes_distinguish_string_and_bytes() {
        let a = map(&[("v", Value::String("ab".into()))]);
        let b = map(&[("v", Value::Bytes(b"ab".to_vec()))]);
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn canonical_bytes_length_prefix_prevents_key_splicing() {
        // {"ab": "c"} vs {"a": "bc"} must not collide
        let a = map(&[("ab", Value::String("c".into()))]);
        let b = map(&[("a", Value::String("bc".into()))]);
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn truncate_string_respects_char_boundary() {
        let mut v = Value::String("héllo".into());
        // 'é' is two bytes starting at index 1; cutting at 2 must back off to 1
        v.truncate(2);
        assert_eq!(v, Value::String("h".into()));
    }

    #[test]
    fn truncate_recurses_into_containers() {
        let mut v = Value::Array(vec![
            Value::String("abcdef".into()),
            Value::KvList(map(&[("k", Value::Bytes(vec![0u8; 10]))])),
        ]);
        v.truncate(3);
        let Value::Array(items) = &v else { panic!() };
        assert_eq!(items[0], Value::String("abc".into()));
        let Value::KvList(inner) = &items[1] else {
            panic!()
        };
        assert_eq!(inner["k"], Value::Bytes(vec![0u8; 3]));
    }

    #[test]
    fn json_encoding_wraps_bytes() {
        let v = Value::Bytes(vec![0xde, 0xad]);
        assert_eq!(v.to_json(), serde_json::json!({ "__bytes": "dead" }));
    }

    #[test]
    fn attrs_from_otlp_dedupes_keys_last_wins() {
        let kvs = vec![
            KeyValue {
                key: "k".into(),
                value: Some(AnyValue {
                    value: Some(OtlpValueKind::IntValue(1)),
                }),
            },
            KeyValue {
                key: "k".into(),
                value: Some(AnyValue {
                    value: Some(OtlpValueKind::IntValue(2)),
                }),
            },
        ];
        let map = attrs_from_otlp(&kvs);
        assert_eq!(map.len(), 1);
        assert_eq!(map["k"], Value::Int64(2));
    }
}
