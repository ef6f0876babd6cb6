//! Constant evaluation of identifier-free sub-expressions.
//!
//! The emitters call [`evaluate`] on any subtree without identifiers and
//! inline the resulting [`Value`] as a literal, so `now() - duration("1h")`
//! reaches the backends as a timestamp string.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::fmt;

use super::ast::{BinaryOp, Node, UnaryOp};
use super::ExprError;

/// Result of evaluating a constant expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Time(DateTime<Utc>),
    Duration(Duration),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Array(_) => "array",
        }
    }

    /// JSON form used by the search backend. Times become RFC3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Time(t) => serde_json::Value::String(format_time(t)),
            Value::Duration(_) => serde_json::Value::String(self.to_string()),
            Value::Array(items) => items.iter().map(Value::to_json).collect(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn truthy(&self, context: &str) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ExprError::ConstantEval(format!(
                "{context}: expected bool, got {}",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Time(t) => f.write_str(&format_time(t)),
            Value::Duration(d) => f.write_str(&format_duration(d)),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_duration(d: &Duration) -> String {
    let total = d.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.unsigned_abs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{sign}{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{sign}{m}m{s}s")
    } else {
        format!("{sign}{s}s")
    }
}

/// Evaluate a constant expression.
pub fn evaluate(node: &Node) -> Result<Value, ExprError> {
    Evaluator { pointer: None }.eval(node)
}

struct Evaluator<'a> {
    /// Element bound to `#` inside a list predicate.
    pointer: Option<&'a Value>,
}

impl Evaluator<'_> {
    fn eval(&self, node: &Node) -> Result<Value, ExprError> {
        match node {
            Node::Nil => Ok(Value::Nil),
            Node::Bool(b) => Ok(Value::Bool(*b)),
            Node::Integer(i) => Ok(Value::Int(*i)),
            Node::Float(f) => Ok(Value::Float(*f)),
            Node::String(s) => Ok(Value::String(s.clone())),
            Node::Identifier(name) => Err(ExprError::ConstantEval(format!(
                "unknown name {name}"
            ))),
            Node::Pointer => self
                .pointer
                .cloned()
                .ok_or_else(|| ExprError::ConstantEval("# used outside of a predicate".into())),
            Node::Member { property, .. } => Err(ExprError::ConstantEval(format!(
                "cannot fetch {property} from a constant"
            ))),
            Node::Index { node, index } => self.index(node, index),
            Node::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Node::Unary { op, node } => self.unary(*op, node),
            Node::Binary { op, left, right } => self.binary(*op, left, right),
            Node::Call { name, args } => self.call(name, args),
        }
    }

    fn index(&self, node: &Node, index: &Node) -> Result<Value, ExprError> {
        let target = self.eval(node)?;
        let index = self.eval(index)?;
        match (target, index) {
            (Value::Array(items), Value::Int(i)) => {
                let len = items.len() as i64;
                let idx = if i < 0 { len + i } else { i };
                if idx < 0 || idx >= len {
                    return Err(ExprError::ConstantEval(format!(
                        "index out of range: {i} (array length is {len})"
                    )));
                }
                Ok(items[idx as usize].clone())
            }
            (target, index) => Err(ExprError::ConstantEval(format!(
                "cannot index {} with {}",
                target.type_name(),
                index.type_name()
            ))),
        }
    }

    fn unary(&self, op: UnaryOp, node: &Node) -> Result<Value, ExprError> {
        let value = self.eval(node)?;
        match (op, value) {
            (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy("operator !")?)),
            (UnaryOp::Negate, Value::Int(i)) => Ok(Value::Int(-i)),
            (UnaryOp::Negate, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Negate, Value::Duration(d)) => Ok(Value::Duration(-d)),
            (UnaryOp::Plus, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
            (_, v) => Err(ExprError::ConstantEval(format!(
                "invalid operation on {}",
                v.type_name()
            ))),
        }
    }

    fn binary(&self, op: BinaryOp, left: &Node, right: &Node) -> Result<Value, ExprError> {
        match op {
            BinaryOp::And => {
                if !self.eval(left)?.truthy("operator &&")? {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(right)?.truthy("operator &&")?));
            }
            BinaryOp::Or => {
                if self.eval(left)?.truthy("operator ||")? {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(right)?.truthy("operator ||")?));
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        let mismatch = || {
            ExprError::ConstantEval(format!(
                "invalid operation: {} {} {}",
                l.type_name(),
                op,
                r.type_name()
            ))
        };

        match op {
            BinaryOp::Eq => Ok(Value::Bool(equal(&l, &r))),
            BinaryOp::Ne => Ok(Value::Bool(!equal(&l, &r))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = compare(&l, &r).ok_or_else(mismatch)?;
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering == Ordering::Less,
                    BinaryOp::Le => ordering != Ordering::Greater,
                    BinaryOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }))
            }
            BinaryOp::In | BinaryOp::NotIn => match &r {
                Value::Array(items) => {
                    let found = items.iter().any(|item| equal(&l, item));
                    Ok(Value::Bool(found == (op == BinaryOp::In)))
                }
                _ => Err(mismatch()),
            },
            BinaryOp::Contains | BinaryOp::StartsWith | BinaryOp::EndsWith => match (&l, &r) {
                (Value::String(a), Value::String(b)) => Ok(Value::Bool(match op {
                    BinaryOp::Contains => a.contains(b.as_str()),
                    BinaryOp::StartsWith => a.starts_with(b.as_str()),
                    _ => a.ends_with(b.as_str()),
                })),
                _ => Err(mismatch()),
            },
            BinaryOp::Add => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int).ok_or_else(overflow),
                (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
                (Value::Time(t), Value::Duration(d)) | (Value::Duration(d), Value::Time(t)) => {
                    Ok(Value::Time(*t + *d))
                }
                (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(*a + *b)),
                (Value::Array(a), Value::Array(b)) => {
                    Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
                }
                _ => float_op(&l, &r, |a, b| a + b).ok_or_else(mismatch),
            },
            BinaryOp::Sub => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => a.checked_sub(*b).map(Value::Int).ok_or_else(overflow),
                (Value::Time(t), Value::Duration(d)) => Ok(Value::Time(*t - *d)),
                (Value::Time(a), Value::Time(b)) => Ok(Value::Duration(*a - *b)),
                (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(*a - *b)),
                _ => float_op(&l, &r, |a, b| a - b).ok_or_else(mismatch),
            },
            BinaryOp::Mul => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int).ok_or_else(overflow),
                _ => float_op(&l, &r, |a, b| a * b).ok_or_else(mismatch),
            },
            BinaryOp::Div => {
                let (a, b) = (l.as_f64(), r.as_f64());
                match (a, b) {
                    (Some(_), Some(b)) if b == 0.0 => {
                        Err(ExprError::ConstantEval("division by zero".into()))
                    }
                    (Some(a), Some(b)) => Ok(Value::Float(a / b)),
                    _ => Err(mismatch()),
                }
            }
            BinaryOp::Mod => match (&l, &r) {
                (Value::Int(_), Value::Int(0)) => {
                    Err(ExprError::ConstantEval("integer divide by zero".into()))
                }
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
                _ => Err(mismatch()),
            },
            BinaryOp::And | BinaryOp::Or => Err(mismatch()),
        }
    }

    fn call(&self, name: &str, args: &[Node]) -> Result<Value, ExprError> {
        match name {
            "now" => {
                arity(name, args, 0)?;
                Ok(Value::Time(Utc::now()))
            }
            "date" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(arity_error(name, "1 or 2", args.len()));
                }
                let text = self.string_arg(name, &args[0])?;
                let layout = match args.get(1) {
                    Some(arg) => Some(self.string_arg(name, arg)?),
                    None => None,
                };
                parse_date(&text, layout.as_deref()).map(Value::Time)
            }
            "duration" => {
                arity(name, args, 1)?;
                let text = self.string_arg(name, &args[0])?;
                parse_duration(&text).map(Value::Duration)
            }
            "len" => {
                arity(name, args, 1)?;
                match self.eval(&args[0])? {
                    Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                    Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                    other => Err(invalid_argument(name, &other)),
                }
            }
            "abs" => {
                arity(name, args, 1)?;
                match self.eval(&args[0])? {
                    Value::Int(i) => Ok(Value::Int(i.abs())),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(invalid_argument(name, &other)),
                }
            }
            "upper" | "lower" | "trim" => {
                arity(name, args, 1)?;
                let s = self.string_arg(name, &args[0])?;
                Ok(Value::String(match name {
                    "upper" => s.to_uppercase(),
                    "lower" => s.to_lowercase(),
                    _ => s.trim().to_string(),
                }))
            }
            "first" | "last" => {
                arity(name, args, 1)?;
                let items = self.array_arg(name, &args[0])?;
                let item = if name == "first" {
                    items.first()
                } else {
                    items.last()
                };
                Ok(item.cloned().unwrap_or(Value::Nil))
            }
            "sum" => {
                arity(name, args, 1)?;
                let items = self.array_arg(name, &args[0])?;
                items.iter().try_fold(Value::Int(0), |acc, item| match (&acc, item) {
                    (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int).ok_or_else(overflow),
                    _ => float_op(&acc, item, |a, b| a + b)
                        .ok_or_else(|| invalid_argument(name, item)),
                })
            }
            "min" | "max" => {
                let items = if args.len() == 1 {
                    self.array_arg(name, &args[0])?
                } else {
                    args.iter()
                        .map(|arg| self.eval(arg))
                        .collect::<Result<Vec<_>, _>>()?
                };
                let want = if name == "min" {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let mut best: Option<Value> = None;
                for item in items {
                    best = match best {
                        None => Some(item),
                        Some(current) => match compare(&item, &current) {
                            Some(ordering) if ordering == want => Some(item),
                            Some(_) => Some(current),
                            None => return Err(invalid_argument(name, &item)),
                        },
                    };
                }
                best.ok_or_else(|| ExprError::ConstantEval(format!("{name}: empty input")))
            }
            "all" | "any" | "none" | "one" | "filter" | "map" | "count" | "find"
            | "findIndex" | "findLast" | "findLastIndex" => self.predicate_call(name, args),
            other => Err(ExprError::ConstantEval(format!("unknown function {other}"))),
        }
    }

    fn predicate_call(&self, name: &str, args: &[Node]) -> Result<Value, ExprError> {
        arity(name, args, 2)?;
        let items = self.array_arg(name, &args[0])?;
        let predicate = &args[1];

        let apply = |item: &Value| -> Result<Value, ExprError> {
            Evaluator {
                pointer: Some(item),
            }
            .eval(predicate)
        };
        let test = |item: &Value| -> Result<bool, ExprError> { apply(item)?.truthy(name) };

        match name {
            "all" => {
                for item in &items {
                    if !test(item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "any" | "none" => {
                let mut found = false;
                for item in &items {
                    if test(item)? {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(if name == "any" { found } else { !found }))
            }
            "one" | "count" => {
                let mut count = 0i64;
                for item in &items {
                    if test(item)? {
                        count += 1;
                    }
                }
                Ok(if name == "one" {
                    Value::Bool(count == 1)
                } else {
                    Value::Int(count)
                })
            }
            "filter" => {
                let mut out = Vec::new();
                for item in items {
                    if test(&item)? {
                        out.push(item);
                    }
                }
                Ok(Value::Array(out))
            }
            "map" => items
                .iter()
                .map(&apply)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            "find" | "findIndex" => {
                for (i, item) in items.iter().enumerate() {
                    if test(item)? {
                        return Ok(if name == "find" {
                            item.clone()
                        } else {
                            Value::Int(i as i64)
                        });
                    }
                }
                Ok(if name == "find" { Value::Nil } else { Value::Int(-1) })
            }
            _ => {
                for (i, item) in items.iter().enumerate().rev() {
                    if test(item)? {
                        return Ok(if name == "findLast" {
                            item.clone()
                        } else {
                            Value::Int(i as i64)
                        });
                    }
                }
                Ok(if name == "findLast" {
                    Value::Nil
                } else {
                    Value::Int(-1)
                })
            }
        }
    }

    fn string_arg(&self, name: &str, arg: &Node) -> Result<String, ExprError> {
        match self.eval(arg)? {
            Value::String(s) => Ok(s),
            other => Err(invalid_argument(name, &other)),
        }
    }

    fn array_arg(&self, name: &str, arg: &Node) -> Result<Vec<Value>, ExprError> {
        match self.eval(arg)? {
            Value::Array(items) => Ok(items),
            other => Err(invalid_argument(name, &other)),
        }
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            a.as_f64() == b.as_f64()
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        (Value::Duration(x), Value::Duration(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn float_op(a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> Option<Value> {
    Some(Value::Float(f(a.as_f64()?, b.as_f64()?)))
}

fn overflow() -> ExprError {
    ExprError::ConstantEval("integer overflow".into())
}

fn arity(name: &str, args: &[Node], want: usize) -> Result<(), ExprError> {
    if args.len() == want {
        Ok(())
    } else {
        Err(arity_error(name, &want.to_string(), args.len()))
    }
}

fn arity_error(name: &str, want: &str, got: usize) -> ExprError {
    ExprError::ConstantEval(format!(
        "{name}: expected {want} arguments, got {got}"
    ))
}

fn invalid_argument(name: &str, value: &Value) -> ExprError {
    ExprError::ConstantEval(format!(
        "invalid argument for {name} (type {})",
        value.type_name()
    ))
}

/// Parse a timestamp. Without a layout, RFC3339 and the common
/// `YYYY-MM-DD[ HH:MM:SS]` forms are accepted; a layout is a strftime pattern.
pub fn parse_date(text: &str, layout: Option<&str>) -> Result<DateTime<Utc>, ExprError> {
    let fail = || ExprError::ConstantEval(format!("cannot parse date {text:?}"));

    if let Some(layout) = layout {
        if let Ok(dt) = DateTime::parse_from_str(text, layout) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
            return Ok(naive.and_utc());
        }
        return NaiveDate::parse_from_str(text, layout)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .ok_or_else(fail);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for layout in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(fail)
}

/// Parse a duration such as `1h`, `1h30m`, `1.5h`, `-90s` or `300ms`.
pub fn parse_duration(text: &str) -> Result<Duration, ExprError> {
    let fail = || ExprError::ConstantEval(format!("invalid duration {text:?}"));

    let (negative, mut rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(fail());
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(fail)?;
        if number_len == 0 {
            return Err(fail());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| fail())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(fail()),
        };
        rest = &rest[unit_len..];
        total_nanos += number * nanos_per_unit;
    }

    if total_nanos > i64::MAX as f64 {
        return Err(fail());
    }
    let nanos = total_nanos.round() as i64;
    Ok(Duration::nanoseconds(if negative { -nanos } else { nanos }))
}
