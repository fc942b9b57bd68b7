// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sandboxed expression language for attribute rules.
//!
//! A subset of CEL: literals, member access and indexing, arithmetic,
//! comparison, `in`, `&&`/`||`, the ternary operator, `has()` and a small
//! library of string and conversion functions. Expressions are compiled once
//! against a [`Schema`] that declares the variables a record exposes, then
//! evaluated many times against an [`Activation`] holding their values.
//!
//! Evaluation has no side effects and no access to anything outside the
//! activation.

mod eval;
mod parser;
mod value;

pub use value::{attributes_to_map, to_attribute_value, Value};

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Parse(String),
    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),
    #[error("no such overload: {0}")]
    NoSuchOverload(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
}

/// Variables declared for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    pub name: &'static str,
    pub variables: &'static [&'static str],
}

impl Schema {
    #[must_use]
    pub fn declares(&self, name: &str) -> bool {
        self.variables.contains(&name)
    }
}

pub const SPAN_SCHEMA: Schema = Schema {
    name: "span",
    variables: &[
        "traceId",
        "spanId",
        "parentSpanId",
        "traceState",
        "name",
        "kind",
        "startTimeUnixNano",
        "endTimeUnixNano",
        "attributes",
        "status",
        "events",
        "links",
    ],
};

pub const LOG_SCHEMA: Schema = Schema {
    name: "log",
    variables: &[
        "traceId",
        "spanId",
        "timeUnixNano",
        "observedTimeUnixNano",
        "severityNumber",
        "severityText",
        "body",
        "attributes",
    ],
};

/// Variable bindings for one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Activation {
    variables: BTreeMap<String, Value>,
}

impl Activation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// A compiled expression.
#[derive(Clone)]
pub struct Program {
    source: String,
    expr: parser::Expr,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source", &self.source)
            .finish()
    }
}

impl Program {
    /// Parses `source` and rejects references to variables `schema` does not declare.
    pub fn compile(source: &str, schema: &Schema) -> Result<Self, ExprError> {
        let expr = parser::parse(source)?;
        let mut undeclared = None;
        expr.for_each_ident(&mut |name| {
            if undeclared.is_none() && !schema.declares(name) {
                undeclared = Some(name.to_string());
            }
        });
        if let Some(name) = undeclared {
            return Err(ExprError::UndeclaredReference(name));
        }
        Ok(Program {
            source: source.to_string(),
            expr,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, activation: &Activation) -> Result<Value, ExprError> {
        eval::evaluate(&self.expr, activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_activation() -> Activation {
        let attributes = BTreeMap::from([
            ("dbt.materialized".to_string(), Value::from("table")),
            ("dbt.rows".to_string(), Value::Int(12)),
        ]);
        Activation::new()
            .with("name", Value::from("model.jaffle.orders"))
            .with("startTimeUnixNano", Value::Uint(100))
            .with("attributes", Value::Map(attributes))
            .with(
                "status",
                Value::Map(BTreeMap::from([
                    ("code".to_string(), Value::from("ERROR")),
                    ("message".to_string(), Value::from("boom")),
                ])),
            )
            .with("events", Value::List(vec![Value::Map(BTreeMap::new())]))
    }

    fn eval(source: &str) -> Result<Value, ExprError> {
        Program::compile(source, &SPAN_SCHEMA)?.eval(&span_activation())
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            eval(r#""prefix_" + name"#),
            Ok(Value::from("prefix_model.jaffle.orders"))
        );
    }

    #[test]
    fn test_attribute_access() {
        assert_eq!(
            eval(r#"attributes["dbt.materialized"] == "table""#),
            Ok(Value::Bool(true))
        );
        assert_eq!(eval(r#"attributes["dbt.rows"] * 2"#), Ok(Value::Int(24)));
        assert_eq!(eval("status.code"), Ok(Value::from("ERROR")));
        assert_eq!(
            eval(r#"attributes["missing"]"#),
            Err(ExprError::NoSuchKey("missing".to_string()))
        );
    }

    #[test]
    fn test_presence_and_membership() {
        assert_eq!(eval("has(status.message)"), Ok(Value::Bool(true)));
        assert_eq!(eval("has(attributes.missing)"), Ok(Value::Bool(false)));
        assert_eq!(eval(r#""dbt.rows" in attributes"#), Ok(Value::Bool(true)));
        assert_eq!(eval(r#"status.code in ["OK", "ERROR"]"#), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval(r#"name.startsWith("model.")"#), Ok(Value::Bool(true)));
        assert_eq!(eval(r#"name.endsWith("orders")"#), Ok(Value::Bool(true)));
        assert_eq!(eval(r#"name.contains("jaffle")"#), Ok(Value::Bool(true)));
        assert_eq!(eval(r#"name.matches("^model\\.[a-z]+")"#), Ok(Value::Bool(true)));
        assert_eq!(eval(r#"name.upperAscii()"#), Ok(Value::from("MODEL.JAFFLE.ORDERS")));
        assert_eq!(eval("size(name)"), Ok(Value::Int(19)));
        assert_eq!(eval("events.size()"), Ok(Value::Int(1)));
    }

    #[test]
    fn test_numeric_semantics() {
        assert_eq!(eval("startTimeUnixNano > 0"), Ok(Value::Bool(true)));
        assert_eq!(eval("startTimeUnixNano + 1u"), Ok(Value::Uint(101)));
        assert!(matches!(
            eval("startTimeUnixNano + 1"),
            Err(ExprError::NoSuchOverload(_))
        ));
        assert_eq!(eval("7 / 0"), Err(ExprError::DivisionByZero));
        assert_eq!(eval("9223372036854775807 + 1"), Err(ExprError::Overflow));
        assert_eq!(eval("string(startTimeUnixNano)"), Ok(Value::from("100")));
        assert_eq!(eval(r#"int("42") + 1"#), Ok(Value::Int(43)));
    }

    #[test]
    fn test_logical_operators_absorb_errors() {
        assert_eq!(eval(r#"false && attributes["missing"] == 1"#), Ok(Value::Bool(false)));
        assert_eq!(eval(r#"attributes["missing"] == 1 && false"#), Ok(Value::Bool(false)));
        assert_eq!(eval(r#"attributes["missing"] == 1 || true"#), Ok(Value::Bool(true)));
        assert!(eval(r#"attributes["missing"] == 1 && true"#).is_err());
    }

    #[test]
    fn test_ternary() {
        assert_eq!(
            eval(r#"status.code == "ERROR" ? "failed" : "ok""#),
            Ok(Value::from("failed"))
        );
    }

    #[test]
    fn test_undeclared_reference_rejected_at_compile() {
        let err = Program::compile("severityNumber > 3", &SPAN_SCHEMA).unwrap_err();
        assert_eq!(err, ExprError::UndeclaredReference("severityNumber".to_string()));
        assert!(Program::compile("severityNumber > 3", &LOG_SCHEMA).is_ok());
    }
}
