// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::model::{AnyValue, KeyValue};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null_type",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Equality with numeric values compared across int, uint and double.
    #[must_use]
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.equals(other)))
            }
            _ => match numeric_cmp(self, other) {
                Some(ordering) => ordering == Ordering::Equal,
                None => self == other,
            },
        }
    }

    /// Ordering for `<`, `<=`, `>` and `>=`. `None` when the operands are not comparable.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => numeric_cmp(self, other),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Uint(x), Value::Uint(y)) => Some(x.cmp(y)),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Uint(y)) => Some(i128::from(*x).cmp(&i128::from(*y))),
        (Value::Uint(x), Value::Int(y)) => Some(i128::from(*x).cmp(&i128::from(*y))),
        (Value::Int(x), Value::Double(y)) => (*x as f64).partial_cmp(y),
        (Value::Double(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Uint(x), Value::Double(y)) => (*x as f64).partial_cmp(y),
        (Value::Double(x), Value::Uint(y)) => x.partial_cmp(&(*y as f64)),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<&AnyValue> for Value {
    fn from(value: &AnyValue) -> Self {
        match value {
            AnyValue::String(s) => Value::String(s.clone()),
            AnyValue::Bool(b) => Value::Bool(*b),
            AnyValue::Int(i) => Value::Int(*i),
            AnyValue::Double(d) => Value::Double(*d),
            AnyValue::Array(items) => Value::List(items.iter().map(Value::from).collect()),
            AnyValue::KvList(entries) => Value::Map(attributes_to_map(entries)),
        }
    }
}

/// Attribute list as an expression map. Later duplicates do not override earlier keys.
#[must_use]
pub fn attributes_to_map(attributes: &[KeyValue]) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for kv in attributes {
        map.entry(kv.key.clone())
            .or_insert_with(|| Value::from(&kv.value));
    }
    map
}

/// Converts an expression result into an attribute value. `None` for `null`
/// and for unsigned values outside the signed 64-bit range.
#[must_use]
pub fn to_attribute_value(value: Value) -> Option<AnyValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(AnyValue::Bool(b)),
        Value::Int(i) => Some(AnyValue::Int(i)),
        Value::Uint(u) => i64::try_from(u).ok().map(AnyValue::Int),
        Value::Double(d) => Some(AnyValue::Double(d)),
        Value::String(s) => Some(AnyValue::String(s)),
        Value::List(items) => Some(AnyValue::Array(
            items.into_iter().filter_map(to_attribute_value).collect(),
        )),
        Value::Map(entries) => Some(AnyValue::KvList(
            entries
                .into_iter()
                .filter_map(|(k, v)| to_attribute_value(v).map(|v| KeyValue { key: k, value: v }))
                .collect(),
        )),
    }
}
