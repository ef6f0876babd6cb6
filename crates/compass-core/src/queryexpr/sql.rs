//! Relational back-end: renders an expression as a SQL `WHERE` fragment.

use chrono::{DateTime, SecondsFormat, Utc};

use super::ast::{BinaryOp, Node, UnaryOp};
use super::eval::{evaluate, format_time, parse_date, Value};
use super::ExprError;

/// Columns stored as fixed-width RFC3339 text with microseconds.
const TIMESTAMP_COLUMNS: &[&str] = &["created_at", "updated_at", "refreshed_at"];

/// Render `node` as a parenthesised SQL predicate.
pub fn to_sql(node: &Node) -> Result<String, ExprError> {
    let mut out = String::new();
    write_node(node, &mut out)?;
    Ok(out)
}

fn write_node(node: &Node, out: &mut String) -> Result<(), ExprError> {
    if !node.has_identifier() {
        let value = evaluate(node)?;
        return write_value(&value, out);
    }

    match node {
        Node::Identifier(name) => {
            out.push_str(name);
            Ok(())
        }
        Node::Member { .. } | Node::Index { .. } => {
            let path = node.field_path().ok_or_else(|| unsupported(node))?;
            write_json_path(&path, out);
            Ok(())
        }
        Node::Binary { op, left, right } => write_binary(node, *op, left, right, out),
        Node::Unary {
            op: UnaryOp::Not,
            node: inner,
        } => {
            out.push_str("(NOT ");
            write_node(inner, out)?;
            out.push(')');
            Ok(())
        }
        Node::Array(items) => write_list(items, out),
        _ => Err(unsupported(node)),
    }
}

fn write_binary(
    node: &Node,
    op: BinaryOp,
    left: &Node,
    right: &Node,
    out: &mut String,
) -> Result<(), ExprError> {
    let right_is_nil = matches!(right, Node::Nil);
    let operator = match op {
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Eq if right_is_nil => "IS",
        BinaryOp::Eq => "=",
        BinaryOp::Ne if right_is_nil => "IS NOT",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::In => "IN",
        BinaryOp::NotIn => "NOT IN",
        _ => return Err(unsupported(node)),
    };

    let compares_time = matches!(
        op,
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
    ) && !right_is_nil;

    out.push('(');
    write_operand(left, compares_time && is_timestamp_column(right), out)?;
    out.push(' ');
    out.push_str(operator);
    out.push(' ');
    write_operand(right, compares_time && is_timestamp_column(left), out)?;
    out.push(')');
    Ok(())
}

fn is_timestamp_column(node: &Node) -> bool {
    matches!(node, Node::Identifier(name) if TIMESTAMP_COLUMNS.contains(&name.as_str()))
}

/// A constant compared against a timestamp column is rendered in the column
/// encoding so that text comparison orders by instant.
fn write_operand(node: &Node, as_timestamp: bool, out: &mut String) -> Result<(), ExprError> {
    if !as_timestamp || node.has_identifier() {
        return write_node(node, out);
    }
    match evaluate(node)? {
        Value::Time(t) => out.push_str(&quote(&format_column_time(&t))),
        Value::String(raw) => {
            let t = parse_date(&raw, None)?;
            out.push_str(&quote(&format_column_time(&t)));
        }
        other => write_value(&other, out)?,
    }
    Ok(())
}

fn format_column_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `data.a.b` becomes `data->'a'->>'b'`.
fn write_json_path(path: &[String], out: &mut String) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    out.push_str(first);
    let Some((last, middle)) = rest.split_last() else {
        return;
    };
    for segment in middle {
        out.push_str("->");
        out.push_str(&quote(segment));
    }
    out.push_str("->>");
    out.push_str(&quote(last));
}

fn write_list(items: &[Node], out: &mut String) -> Result<(), ExprError> {
    if items.is_empty() {
        return Err(ExprError::UnsupportedNode(
            "empty list cannot be converted to SQL".to_string(),
        ));
    }
    out.push('(');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_node(item, out)?;
    }
    out.push(')');
    Ok(())
}

fn write_value(value: &Value, out: &mut String) -> Result<(), ExprError> {
    match value {
        Value::Nil => out.push_str("NULL"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&f.to_string()),
        Value::String(s) => out.push_str(&quote(s)),
        Value::Time(t) => out.push_str(&quote(&format_time(t))),
        Value::Duration(_) => {
            return Err(ExprError::UnsupportedNode(format!(
                "duration {value} cannot be converted to SQL"
            )))
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ExprError::UnsupportedNode(
                    "empty list cannot be converted to SQL".to_string(),
                ));
            }
            out.push('(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out)?;
            }
            out.push(')');
        }
    }
    Ok(())
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn unsupported(node: &Node) -> ExprError {
    ExprError::UnsupportedNode(format!("unsupported query expr: {node} to SQL query"))
}
