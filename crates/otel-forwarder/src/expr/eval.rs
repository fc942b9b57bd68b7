// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::value::Value;
use super::{Activation, ExprError};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub(crate) fn evaluate(expr: &Expr, activation: &Activation) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => activation
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UndeclaredReference(name.clone())),
        Expr::Select { operand, field } => match evaluate(operand, activation)? {
            Value::Map(mut entries) => entries
                .remove(field)
                .ok_or_else(|| ExprError::NoSuchKey(field.clone())),
            other => Err(ExprError::NoSuchOverload(format!(
                "field selection .{field} on {}",
                other.type_name()
            ))),
        },
        Expr::Has { operand, field } => match evaluate(operand, activation)? {
            Value::Map(entries) => Ok(Value::Bool(entries.contains_key(field))),
            other => Err(ExprError::NoSuchOverload(format!(
                "has() on {}",
                other.type_name()
            ))),
        },
        Expr::Index { operand, index } => {
            let operand = evaluate(operand, activation)?;
            let index = evaluate(index, activation)?;
            index_value(operand, &index)
        }
        Expr::Call {
            target,
            function,
            args,
        } => {
            let target = match target {
                Some(target) => Some(evaluate(target, activation)?),
                None => None,
            };
            let args = args
                .iter()
                .map(|arg| evaluate(arg, activation))
                .collect::<Result<Vec<_>, _>>()?;
            call(function, target, args)
        }
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, activation)?;
            match (op, value) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(i)) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or(ExprError::Overflow),
                (UnaryOp::Neg, Value::Double(d)) => Ok(Value::Double(-d)),
                (op, value) => Err(ExprError::NoSuchOverload(format!(
                    "{op:?} on {}",
                    value.type_name()
                ))),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, activation)?;
            let rhs = evaluate(rhs, activation)?;
            binary(*op, lhs, rhs)
        }
        Expr::And(lhs, rhs) => logical(lhs, rhs, activation, false),
        Expr::Or(lhs, rhs) => logical(lhs, rhs, activation, true),
        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => match evaluate(condition, activation)? {
            Value::Bool(true) => evaluate(then, activation),
            Value::Bool(false) => evaluate(otherwise, activation),
            other => Err(ExprError::NoSuchOverload(format!(
                "conditional on {}",
                other.type_name()
            ))),
        },
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, activation))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let Value::String(key) = evaluate(key, activation)? else {
                    return Err(ExprError::NoSuchOverload(
                        "map literal keys must be strings".to_string(),
                    ));
                };
                map.insert(key, evaluate(value, activation)?);
            }
            Ok(Value::Map(map))
        }
    }
}

/// `&&` and `||` with error absorption: `false && <error>` is `false` and
/// `true || <error>` is `true`, whichever side the error is on.
fn logical(
    lhs: &Expr,
    rhs: &Expr,
    activation: &Activation,
    short_circuit_on: bool,
) -> Result<Value, ExprError> {
    let left = evaluate(lhs, activation).and_then(expect_bool);
    if let Ok(b) = left {
        if b == short_circuit_on {
            return Ok(Value::Bool(b));
        }
    }
    let right = evaluate(rhs, activation).and_then(expect_bool);
    match (left, right) {
        (_, Ok(b)) if b == short_circuit_on => Ok(Value::Bool(b)),
        (Ok(_), Ok(b)) => Ok(Value::Bool(b)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

fn expect_bool(value: Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::NoSuchOverload(format!(
            "logical operator on {}",
            other.type_name()
        ))),
    }
}

fn index_value(operand: Value, index: &Value) -> Result<Value, ExprError> {
    match (operand, index) {
        (Value::Map(mut entries), Value::String(key)) => entries
            .remove(key)
            .ok_or_else(|| ExprError::NoSuchKey(key.clone())),
        (Value::List(mut items), Value::Int(_) | Value::Uint(_)) => {
            let position = match index {
                Value::Int(i) => usize::try_from(*i).ok(),
                Value::Uint(u) => usize::try_from(*u).ok(),
                _ => None,
            };
            match position {
                Some(p) if p < items.len() => Ok(items.swap_remove(p)),
                _ => Err(ExprError::IndexOutOfRange(index.to_string())),
            }
        }
        (operand, index) => Err(ExprError::NoSuchOverload(format!(
            "{}[{}]",
            operand.type_name(),
            index.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    let overload = |lhs: &Value, rhs: &Value| {
        ExprError::NoSuchOverload(format!(
            "{} {op:?} {}",
            lhs.type_name(),
            rhs.type_name()
        ))
    };
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs.equals(&rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!lhs.equals(&rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = lhs.compare(&rhs).ok_or_else(|| overload(&lhs, &rhs))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => match &rhs {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|item| item.equals(&lhs)))),
            Value::Map(entries) => match &lhs {
                Value::String(key) => Ok(Value::Bool(entries.contains_key(key))),
                _ => Err(overload(&lhs, &rhs)),
            },
            _ => Err(overload(&lhs, &rhs)),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or(ExprError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => {
                a.checked_add(b).map(Value::Uint).ok_or(ExprError::Overflow)
            }
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (lhs, rhs) => Err(overload(&lhs, &rhs)),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or(ExprError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => {
                a.checked_sub(b).map(Value::Uint).ok_or(ExprError::Overflow)
            }
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a - b)),
            (lhs, rhs) => Err(overload(&lhs, &rhs)),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or(ExprError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => {
                a.checked_mul(b).map(Value::Uint).ok_or(ExprError::Overflow)
            }
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a * b)),
            (lhs, rhs) => Err(overload(&lhs, &rhs)),
        },
        BinaryOp::Div => match (lhs, rhs) {
            (Value::Int(_) | Value::Uint(_), Value::Int(0) | Value::Uint(0)) => {
                Err(ExprError::DivisionByZero)
            }
            (Value::Int(a), Value::Int(b)) => a.checked_div(b).map(Value::Int).ok_or(ExprError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => Ok(Value::Uint(a / b)),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a / b)),
            (lhs, rhs) => Err(overload(&lhs, &rhs)),
        },
        BinaryOp::Rem => match (lhs, rhs) {
            (Value::Int(_) | Value::Uint(_), Value::Int(0) | Value::Uint(0)) => {
                Err(ExprError::DivisionByZero)
            }
            (Value::Int(a), Value::Int(b)) => a.checked_rem(b).map(Value::Int).ok_or(ExprError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => Ok(Value::Uint(a % b)),
            (lhs, rhs) => Err(overload(&lhs, &rhs)),
        },
    }
}

fn call(function: &str, target: Option<Value>, args: Vec<Value>) -> Result<Value, ExprError> {
    // Receiver-style and global-style calls share one argument list.
    let mut all = Vec::with_capacity(args.len() + 1);
    all.extend(target);
    all.extend(args);

    match (function, all.as_slice()) {
        ("size", [value]) => size(value),
        ("startsWith", [Value::String(s), Value::String(p)]) => Ok(Value::Bool(s.starts_with(p.as_str()))),
        ("endsWith", [Value::String(s), Value::String(p)]) => Ok(Value::Bool(s.ends_with(p.as_str()))),
        ("contains", [Value::String(s), Value::String(p)]) => Ok(Value::Bool(s.contains(p.as_str()))),
        ("matches", [Value::String(s), Value::String(pattern)]) => {
            let re = regex::Regex::new(pattern)
                .map_err(|e| ExprError::InvalidArgument(format!("matches: {e}")))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        ("lowerAscii", [Value::String(s)]) => Ok(Value::String(s.to_ascii_lowercase())),
        ("upperAscii", [Value::String(s)]) => Ok(Value::String(s.to_ascii_uppercase())),
        ("trim", [Value::String(s)]) => Ok(Value::String(s.trim().to_string())),
        ("string", [value]) => match value {
            Value::List(_) | Value::Map(_) => Err(ExprError::NoSuchOverload(format!(
                "string({})",
                value.type_name()
            ))),
            other => Ok(Value::String(other.to_string())),
        },
        ("int", [value]) => to_int(value),
        ("uint", [value]) => to_uint(value),
        ("double", [value]) => to_double(value),
        (function, args) => Err(ExprError::NoSuchOverload(format!(
            "{function}({})",
            args.iter()
                .map(Value::type_name)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn size(value: &Value) -> Result<Value, ExprError> {
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => {
            return Err(ExprError::NoSuchOverload(format!(
                "size({})",
                other.type_name()
            )))
        }
    };
    i64::try_from(len).map(Value::Int).map_err(|_| ExprError::Overflow)
}

#[allow(clippy::cast_possible_truncation)]
fn to_int(value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Uint(u) => i64::try_from(*u).map(Value::Int).map_err(|_| ExprError::Overflow),
        Value::Double(d) if d.is_finite() && *d >= i64::MIN as f64 && *d < i64::MAX as f64 => {
            Ok(Value::Int(d.trunc() as i64))
        }
        Value::Double(_) => Err(ExprError::Overflow),
        Value::String(s) => s
            .parse()
            .map(Value::Int)
            .map_err(|_| ExprError::InvalidArgument(format!("int({s:?})"))),
        other => Err(ExprError::NoSuchOverload(format!("int({})", other.type_name()))),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_uint(value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::Uint(u) => Ok(Value::Uint(*u)),
        Value::Int(i) => u64::try_from(*i).map(Value::Uint).map_err(|_| ExprError::Overflow),
        Value::Double(d) if d.is_finite() && *d >= 0.0 && *d < u64::MAX as f64 => {
            Ok(Value::Uint(d.trunc() as u64))
        }
        Value::Double(_) => Err(ExprError::Overflow),
        Value::String(s) => s
            .parse()
            .map(Value::Uint)
            .map_err(|_| ExprError::InvalidArgument(format!("uint({s:?})"))),
        other => Err(ExprError::NoSuchOverload(format!("uint({})", other.type_name()))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_double(value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::Double(d) => Ok(Value::Double(*d)),
        Value::Int(i) => Ok(Value::Double(*i as f64)),
        Value::Uint(u) => Ok(Value::Double(*u as f64)),
        Value::String(s) => s
            .parse()
            .map(Value::Double)
            .map_err(|_| ExprError::InvalidArgument(format!("double({s:?})"))),
        other => Err(ExprError::NoSuchOverload(format!(
            "double({})",
            other.type_name()
        ))),
    }
}
