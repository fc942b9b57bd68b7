// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conditional attribute rewrites applied by a forwarder.
//!
//! A rule is compiled once against the schema of the signal it applies to.
//! At upload time each record is projected into an [`Activation`] and every
//! rule runs against that projection in configured order.

use crate::config::{AttributeRule, RuleAction};
use crate::expr::{
    attributes_to_map, to_attribute_value, Activation, ExprError, Program, Schema, Value,
};
use crate::model::{AnyValue, KeyValue, LogEntry, Span, StatusCode};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ModifierError {
    #[error("invalid rule for '{key}': {message}")]
    InvalidRule { key: String, message: String },
    #[error("failed to compile expression for '{key}': {source}")]
    Compile { key: String, source: ExprError },
    #[error("failed to evaluate condition for '{key}': {source}")]
    Condition { key: String, source: ExprError },
    #[error("failed to evaluate value for '{key}': {source}")]
    ValueExpr { key: String, source: ExprError },
    #[error("value expression for '{key}' produced {type_name}, which is not an attribute value")]
    UnsupportedValue { key: String, type_name: &'static str },
}

#[derive(Debug, Clone)]
enum RuleValue {
    Literal(AnyValue),
    Expression(Program),
}

/// One compiled `set`/`remove` rule.
#[derive(Debug, Clone)]
pub struct AttributeModifier {
    action: RuleAction,
    key: String,
    condition: Option<Program>,
    value: Option<RuleValue>,
}

impl AttributeModifier {
    pub fn compile(rule: &AttributeRule, schema: &Schema) -> Result<Self, ModifierError> {
        rule.validate().map_err(|e| ModifierError::InvalidRule {
            key: rule.key.clone(),
            message: e.to_string(),
        })?;

        let compile = |source: &str| {
            Program::compile(source, schema).map_err(|source| ModifierError::Compile {
                key: rule.key.clone(),
                source,
            })
        };

        let condition = rule.when.as_deref().map(&compile).transpose()?;
        let value = match rule.action {
            RuleAction::Remove => None,
            RuleAction::Set => match (&rule.value, rule.value_expr.as_deref()) {
                (_, Some(expr)) => Some(RuleValue::Expression(compile(expr)?)),
                (Some(literal), None) => AnyValue::from_json(literal).map(RuleValue::Literal),
                (None, None) => None,
            },
        };
        if rule.action == RuleAction::Set && value.is_none() {
            return Err(ModifierError::InvalidRule {
                key: rule.key.clone(),
                message: "literal value is null".to_string(),
            });
        }

        Ok(AttributeModifier {
            action: rule.action,
            key: rule.key.clone(),
            condition,
            value,
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Applies the rule to `attributes`. On error the attributes are left as they were.
    pub fn apply(
        &self,
        activation: &Activation,
        attributes: &mut Vec<KeyValue>,
    ) -> Result<(), ModifierError> {
        if let Some(condition) = &self.condition {
            let matched = condition
                .eval(activation)
                .map_err(|source| ModifierError::Condition {
                    key: self.key.clone(),
                    source,
                })?;
            // Non-boolean conditions never match.
            if matched != Value::Bool(true) {
                return Ok(());
            }
        }

        match (&self.action, &self.value) {
            (RuleAction::Remove, _) => attributes.retain(|kv| kv.key != self.key),
            (RuleAction::Set, Some(RuleValue::Literal(value))) => {
                set_attribute(attributes, &self.key, value.clone());
            }
            (RuleAction::Set, Some(RuleValue::Expression(program))) => {
                let result = program
                    .eval(activation)
                    .map_err(|source| ModifierError::ValueExpr {
                        key: self.key.clone(),
                        source,
                    })?;
                let type_name = result.type_name();
                let value =
                    to_attribute_value(result).ok_or_else(|| ModifierError::UnsupportedValue {
                        key: self.key.clone(),
                        type_name,
                    })?;
                set_attribute(attributes, &self.key, value);
            }
            (RuleAction::Set, None) => {}
        }
        Ok(())
    }
}

fn set_attribute(attributes: &mut Vec<KeyValue>, key: &str, value: AnyValue) {
    match attributes.iter_mut().find(|kv| kv.key == key) {
        Some(existing) => existing.value = value,
        None => attributes.push(KeyValue::new(key, value)),
    }
}

/// Compiles every rule, returning the modifiers that compiled and the errors
/// of those that did not.
pub fn compile_rules(
    rules: &[AttributeRule],
    schema: &Schema,
) -> (Vec<AttributeModifier>, Vec<ModifierError>) {
    let mut modifiers = Vec::with_capacity(rules.len());
    let mut errors = Vec::new();
    for rule in rules {
        match AttributeModifier::compile(rule, schema) {
            Ok(modifier) => modifiers.push(modifier),
            Err(e) => errors.push(e),
        }
    }
    (modifiers, errors)
}

fn status_code_value(code: StatusCode) -> Value {
    match code {
        StatusCode::Unset => Value::Null,
        StatusCode::Ok => Value::from("OK"),
        StatusCode::Error => Value::from("ERROR"),
    }
}

/// Read-only projection of a span for rule evaluation.
#[must_use]
pub fn span_activation(span: &Span) -> Activation {
    let (code, message) = span
        .status
        .as_ref()
        .map_or((StatusCode::Unset, String::new()), |s| {
            (s.code, s.message.clone())
        });
    let status = BTreeMap::from([
        ("code".to_string(), status_code_value(code)),
        ("message".to_string(), Value::String(message)),
    ]);
    let events = span
        .events
        .iter()
        .map(|event| {
            Value::Map(BTreeMap::from([
                ("name".to_string(), Value::from(event.name.as_str())),
                ("timeUnixNano".to_string(), Value::Uint(event.time_unix_nano)),
                (
                    "attributes".to_string(),
                    Value::Map(attributes_to_map(&event.attributes)),
                ),
            ]))
        })
        .collect();
    let links = span
        .links
        .iter()
        .map(|link| {
            Value::Map(BTreeMap::from([
                ("traceId".to_string(), Value::String(hex::encode(&link.trace_id))),
                ("spanId".to_string(), Value::String(hex::encode(&link.span_id))),
                ("traceState".to_string(), Value::from(link.trace_state.as_str())),
                (
                    "attributes".to_string(),
                    Value::Map(attributes_to_map(&link.attributes)),
                ),
            ]))
        })
        .collect();

    Activation::new()
        .with("traceId", Value::String(hex::encode(&span.trace_id)))
        .with("spanId", Value::String(hex::encode(&span.span_id)))
        .with("parentSpanId", Value::String(hex::encode(&span.parent_span_id)))
        .with("traceState", Value::from(span.trace_state.as_str()))
        .with("name", Value::from(span.name.as_str()))
        .with("kind", Value::from(span.kind.as_str()))
        .with("startTimeUnixNano", Value::Uint(span.start_time_unix_nano))
        .with("endTimeUnixNano", Value::Uint(span.end_time_unix_nano))
        .with("attributes", Value::Map(attributes_to_map(&span.attributes)))
        .with("status", Value::Map(status))
        .with("events", Value::List(events))
        .with("links", Value::List(links))
}

/// Read-only projection of a log record for rule evaluation.
#[must_use]
pub fn log_activation(log: &LogEntry) -> Activation {
    Activation::new()
        .with("traceId", Value::String(hex::encode(&log.trace_id)))
        .with("spanId", Value::String(hex::encode(&log.span_id)))
        .with("timeUnixNano", Value::Uint(log.time_unix_nano))
        .with(
            "observedTimeUnixNano",
            Value::Uint(log.observed_time_unix_nano),
        )
        .with("severityNumber", Value::Int(i64::from(log.severity_number)))
        .with("severityText", Value::from(log.severity_text.as_str()))
        .with("body", log.body.as_ref().map_or(Value::Null, Value::from))
        .with("attributes", Value::Map(attributes_to_map(&log.attributes)))
}
