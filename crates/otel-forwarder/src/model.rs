// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry records emitted by the decoder.
//!
//! These types are plain data. They are converted to their OTLP protobuf
//! counterparts only at the export boundary (see [`crate::otlp`]).

use std::collections::HashSet;

/// An attribute value. Closed over the kinds OTLP can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    Array(Vec<AnyValue>),
    KvList(Vec<KeyValue>),
}

impl AnyValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON value. `null` has no attribute representation: it yields
    /// `None`, and null members of arrays and objects are dropped. Object keys
    /// are sorted.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(AnyValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(AnyValue::Int(i))
                } else {
                    n.as_f64().map(AnyValue::Double)
                }
            }
            serde_json::Value::String(s) => Some(AnyValue::String(s.clone())),
            serde_json::Value::Array(items) => Some(AnyValue::Array(
                items.iter().filter_map(AnyValue::from_json).collect(),
            )),
            serde_json::Value::Object(map) => {
                let mut entries: Vec<KeyValue> = map
                    .iter()
                    .filter_map(|(k, v)| AnyValue::from_json(v).map(|v| KeyValue::new(k, v)))
                    .collect();
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Some(AnyValue::KvList(entries))
            }
        }
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::String(value.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        AnyValue::String(value)
    }
}

impl From<i64> for AnyValue {
    fn from(value: i64) -> Self {
        AnyValue::Int(value)
    }
}

impl From<bool> for AnyValue {
    fn from(value: bool) -> Self {
        AnyValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Keeps the first attribute for every key, preserving order.
#[must_use]
pub fn dedup_attributes(attributes: Vec<KeyValue>) -> Vec<KeyValue> {
    let mut seen = HashSet::with_capacity(attributes.len());
    attributes
        .into_iter()
        .filter(|kv| seen.insert(kv.key.clone()))
        .collect()
}

/// Looks up an attribute by key.
#[must_use]
pub fn find_attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a AnyValue> {
    attributes.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    /// Maps the numeric OTLP status code; unknown values are treated as unset.
    #[must_use]
    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => StatusCode::Ok,
            2 => StatusCode::Error,
            _ => StatusCode::Unset,
        }
    }

    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SpanKind::Unspecified => "UNSPECIFIED",
            SpanKind::Internal => "INTERNAL",
            SpanKind::Server => "SERVER",
            SpanKind::Client => "CLIENT",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
        }
    }

    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            SpanKind::Unspecified => 0,
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpanLink {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub trace_state: String,
    pub attributes: Vec<KeyValue>,
}

/// A finished span. Identifiers are raw bytes decoded from hex.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Span {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub parent_span_id: Vec<u8>,
    pub trace_state: String,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: Vec<KeyValue>,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    pub status: Option<Status>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogEntry {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: Option<AnyValue>,
    pub attributes: Vec<KeyValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let attrs = vec![
            KeyValue::new("a", "first"),
            KeyValue::new("b", 1_i64),
            KeyValue::new("a", "second"),
        ];
        let deduped = dedup_attributes(attrs);
        assert_eq!(deduped.len(), 2);
        assert_eq!(find_attribute(&deduped, "a"), Some(&AnyValue::from("first")));
    }

    #[test]
    fn test_from_json_number_kinds() {
        assert_eq!(AnyValue::from_json(&json!(3)), Some(AnyValue::Int(3)));
        assert_eq!(AnyValue::from_json(&json!(1.5)), Some(AnyValue::Double(1.5)));
        assert_eq!(AnyValue::from_json(&json!(null)), None);
    }

    #[test]
    fn test_from_json_nested_object_sorted() {
        let value = AnyValue::from_json(&json!({"z": 1, "a": {"b": true}, "n": null}));
        assert_eq!(
            value,
            Some(AnyValue::KvList(vec![
                KeyValue::new("a", AnyValue::KvList(vec![KeyValue::new("b", true)])),
                KeyValue::new("z", 1_i64),
            ]))
        );
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(StatusCode::from_i32(2), StatusCode::Error);
        assert_eq!(StatusCode::from_i32(7), StatusCode::Unset);
        assert_eq!(StatusCode::Ok.as_i32(), 1);
    }
}
