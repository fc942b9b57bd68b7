// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::value::Value;
use super::ExprError;
use pest::iterators::Pair;
use pest::Parser as _;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "expr/cel.pest"]
pub(crate) struct CelPestParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Ident(String),
    Select {
        operand: Box<Expr>,
        field: String,
    },
    Index {
        operand: Box<Expr>,
        index: Box<Expr>,
    },
    /// `has(operand.field)`
    Has {
        operand: Box<Expr>,
        field: String,
    },
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
}

impl Expr {
    /// Calls `visit` with every variable name the expression reads.
    pub(crate) fn for_each_ident(&self, visit: &mut impl FnMut(&str)) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => visit(name),
            Expr::Select { operand, .. } | Expr::Has { operand, .. } => {
                operand.for_each_ident(visit);
            }
            Expr::Index { operand, index } => {
                operand.for_each_ident(visit);
                index.for_each_ident(visit);
            }
            Expr::Call { target, args, .. } => {
                if let Some(target) = target {
                    target.for_each_ident(visit);
                }
                for arg in args {
                    arg.for_each_ident(visit);
                }
            }
            Expr::Unary { operand, .. } => operand.for_each_ident(visit),
            Expr::Binary { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.for_each_ident(visit);
                rhs.for_each_ident(visit);
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.for_each_ident(visit);
                then.for_each_ident(visit);
                otherwise.for_each_ident(visit);
            }
            Expr::List(items) => {
                for item in items {
                    item.for_each_ident(visit);
                }
            }
            Expr::Map(entries) => {
                for (k, v) in entries {
                    k.for_each_ident(visit);
                    v.for_each_ident(visit);
                }
            }
        }
    }
}

pub(crate) fn parse(source: &str) -> Result<Expr, ExprError> {
    let mut pairs = CelPestParser::parse(Rule::expression, source)
        .map_err(|e| ExprError::Parse(e.to_string()))?;
    let expr = pairs
        .next()
        .and_then(|expression| expression.into_inner().next())
        .ok_or_else(|| ExprError::Parse("empty expression".to_string()))?;
    build(expr)
}

fn syntax(message: impl Into<String>) -> ExprError {
    ExprError::Parse(message.into())
}

fn next_child<'a>(
    inner: &mut pest::iterators::Pairs<'a, Rule>,
    context: &str,
) -> Result<Pair<'a, Rule>, ExprError> {
    inner
        .next()
        .ok_or_else(|| syntax(format!("incomplete {context}")))
}

fn build(pair: Pair<'_, Rule>) -> Result<Expr, ExprError> {
    match pair.as_rule() {
        Rule::expr => {
            let mut inner = pair.into_inner();
            let first = build(next_child(&mut inner, "expression")?)?;
            match (inner.next(), inner.next()) {
                (Some(then), Some(otherwise)) => Ok(Expr::Conditional {
                    condition: Box::new(first),
                    then: Box::new(build(then)?),
                    otherwise: Box::new(build(otherwise)?),
                }),
                _ => Ok(first),
            }
        }
        Rule::conditional_or => fold_logical(pair, Expr::Or),
        Rule::conditional_and => fold_logical(pair, Expr::And),
        Rule::relation | Rule::addition | Rule::multiplication => fold_binary(pair),
        Rule::unary => {
            let mut ops = Vec::new();
            let mut operand = None;
            for child in pair.into_inner() {
                if child.as_rule() == Rule::unary_op {
                    ops.push(if child.as_str() == "!" {
                        UnaryOp::Not
                    } else {
                        UnaryOp::Neg
                    });
                } else if ops.last() == Some(&UnaryOp::Neg) && is_min_int_magnitude(child.as_str()) {
                    ops.pop();
                    operand = Some(Expr::Literal(Value::Int(i64::MIN)));
                } else {
                    operand = Some(build(child)?);
                }
            }
            let mut expr = operand.ok_or_else(|| syntax("missing unary operand"))?;
            for op in ops.into_iter().rev() {
                expr = negate_literal(op, expr);
            }
            Ok(expr)
        }
        Rule::member => build_member(pair),
        Rule::global_call => {
            let mut inner = pair.into_inner();
            let function = next_child(&mut inner, "call")?.as_str().to_string();
            let args = match inner.next() {
                Some(list) => build_args(list)?,
                None => Vec::new(),
            };
            if function == "has" {
                return build_has(args);
            }
            Ok(Expr::Call {
                target: None,
                function,
                args,
            })
        }
        Rule::ident => Ok(Expr::Ident(pair.as_str().to_string())),
        Rule::list_lit => Ok(Expr::List(
            pair.into_inner().map(build).collect::<Result<_, _>>()?,
        )),
        Rule::map_lit => {
            let mut entries = Vec::new();
            for entry in pair.into_inner() {
                let mut kv = entry.into_inner();
                let key = build(next_child(&mut kv, "map entry")?)?;
                let value = build(next_child(&mut kv, "map entry")?)?;
                entries.push((key, value));
            }
            Ok(Expr::Map(entries))
        }
        Rule::double_lit => pair
            .as_str()
            .parse::<f64>()
            .map(|d| Expr::Literal(Value::Double(d)))
            .map_err(|e| syntax(format!("invalid double literal: {e}"))),
        Rule::uint_lit => {
            let text = pair.as_str();
            parse_integer(&text[..text.len() - 1])
                .map(|u| Expr::Literal(Value::Uint(u)))
                .ok_or_else(|| syntax(format!("invalid uint literal: {text}")))
        }
        Rule::int_lit => {
            let text = pair.as_str();
            parse_integer(text)
                .and_then(|u| i64::try_from(u).ok())
                .map(|i| Expr::Literal(Value::Int(i)))
                .ok_or_else(|| syntax(format!("invalid int literal: {text}")))
        }
        Rule::string_lit => {
            let inner = pair
                .into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or_default();
            Ok(Expr::Literal(Value::String(unescape(inner)?)))
        }
        Rule::bool_lit => Ok(Expr::Literal(Value::Bool(pair.as_str() == "true"))),
        Rule::null_lit => Ok(Expr::Literal(Value::Null)),
        other => Err(syntax(format!("unexpected {other:?}"))),
    }
}

/// `9223372036854775808` only fits an int once negated.
fn is_min_int_magnitude(text: &str) -> bool {
    parse_integer(text.trim()) == Some(i64::MIN.unsigned_abs())
}

/// Folds `-` into numeric literals.
fn negate_literal(op: UnaryOp, expr: Expr) -> Expr {
    match (op, expr) {
        (UnaryOp::Neg, Expr::Literal(Value::Int(i))) if i != i64::MIN => {
            Expr::Literal(Value::Int(-i))
        }
        (UnaryOp::Neg, Expr::Literal(Value::Double(d))) => Expr::Literal(Value::Double(-d)),
        (op, expr) => Expr::Unary {
            op,
            operand: Box::new(expr),
        },
    }
}

fn parse_integer(text: &str) -> Option<u64> {
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn fold_logical(
    pair: Pair<'_, Rule>,
    combine: fn(Box<Expr>, Box<Expr>) -> Expr,
) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let mut expr = build(next_child(&mut inner, "logical expression")?)?;
    for rhs in inner {
        expr = combine(Box::new(expr), Box::new(build(rhs)?));
    }
    Ok(expr)
}

fn fold_binary(pair: Pair<'_, Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let mut expr = build(next_child(&mut inner, "operand")?)?;
    while let Some(op) = inner.next() {
        let op = match op.as_str() {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "in" => BinaryOp::In,
            other => return Err(syntax(format!("unknown operator {other}"))),
        };
        let rhs = build(next_child(&mut inner, "operand")?)?;
        expr = Expr::Binary {
            op,
            lhs: Box::new(expr),
            rhs: Box::new(rhs),
        };
    }
    Ok(expr)
}

fn build_member(pair: Pair<'_, Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let mut expr = build(next_child(&mut inner, "member")?)?;
    for postfix in inner {
        expr = match postfix.as_rule() {
            Rule::select => {
                let field = postfix.into_inner().as_str().to_string();
                Expr::Select {
                    operand: Box::new(expr),
                    field,
                }
            }
            Rule::select_call => {
                let mut parts = postfix.into_inner();
                let function = next_child(&mut parts, "method call")?.as_str().to_string();
                let args = match parts.next() {
                    Some(list) => build_args(list)?,
                    None => Vec::new(),
                };
                Expr::Call {
                    target: Some(Box::new(expr)),
                    function,
                    args,
                }
            }
            Rule::index => {
                let index = build(next_child(&mut postfix.into_inner(), "index")?)?;
                Expr::Index {
                    operand: Box::new(expr),
                    index: Box::new(index),
                }
            }
            other => return Err(syntax(format!("unexpected {other:?}"))),
        };
    }
    Ok(expr)
}

fn build_args(list: Pair<'_, Rule>) -> Result<Vec<Expr>, ExprError> {
    list.into_inner().map(build).collect()
}

fn build_has(mut args: Vec<Expr>) -> Result<Expr, ExprError> {
    match (args.pop(), args.is_empty()) {
        (Some(Expr::Select { operand, field }), true) => Ok(Expr::Has { operand, field }),
        _ => Err(syntax("has() requires a single field selection argument")),
    }
}

fn unescape(raw: &str) -> Result<String, ExprError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                let decoded = u32::from_str_radix(&code, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| syntax(format!("invalid unicode escape \\u{code}")))?;
                out.push(decoded);
            }
            Some(other) => out.push(other),
            None => return Err(syntax("dangling escape")),
        }
    }
    Ok(out)
}
