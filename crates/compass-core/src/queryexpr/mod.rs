//! Query-expression language used for bulk predicates.
//!
//! An expression such as
//! `refreshed_at <= now() - duration("720h") && service in ["bq", "kafka"]`
//! compiles to both a SQL `WHERE` fragment ([`QueryExpr::to_sql`]) and an
//! Elasticsearch query document ([`QueryExpr::to_search_query`]). Sub-expressions
//! without identifiers are evaluated at compile time and inlined as literals.
//!
//! # Example
//!
//! ```
//! use compass_core::queryexpr::QueryExpr;
//!
//! let expr = QueryExpr::parse(r#"service in ["a", "b"]"#).unwrap();
//! assert_eq!(expr.to_sql().unwrap(), "(service IN ('a', 'b'))");
//! ```

mod ast;
mod eval;
mod lexer;
mod parser;
mod search;
mod sql;

pub use ast::{BinaryOp, Node, UnaryOp};
pub use eval::{evaluate, parse_duration, Value};
pub use search::KEYWORD_IDENTIFIERS;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while compiling an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("error parsing expression at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("{0}")]
    UnsupportedNode(String),

    #[error("failed to evaluate constant expression: {0}")]
    ConstantEval(String),
}

impl ExprError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        ExprError::Parse {
            position,
            message: message.into(),
        }
    }
}

/// Parse an expression into its syntax tree.
pub fn parse(input: &str) -> Result<Node, ExprError> {
    parser::parse_expression(input)
}

/// Compile an expression into a SQL `WHERE` fragment.
pub fn to_sql(input: &str) -> Result<String, ExprError> {
    sql::to_sql(&parse(input)?)
}

/// Compile an expression into an Elasticsearch query document.
pub fn to_search_query(input: &str) -> Result<serde_json::Value, ExprError> {
    search::to_search_query(&parse(input)?)
}

/// Map each identifier to the operator it is used with.
///
/// Only identifiers that are direct operands of a binary operator are
/// recorded; a member path is recorded under its root identifier. When an
/// identifier appears more than once the last use in evaluation order wins.
pub fn identifiers_with_operator(input: &str) -> Result<BTreeMap<String, String>, ExprError> {
    let node = parse(input)?;
    let mut identifiers = BTreeMap::new();
    collect_identifiers(&node, &mut identifiers);
    Ok(identifiers)
}

fn collect_identifiers(node: &Node, out: &mut BTreeMap<String, String>) {
    match node {
        Node::Binary { op, left, right } => {
            collect_identifiers(left, out);
            collect_identifiers(right, out);
            for operand in [left.as_ref(), right.as_ref()] {
                if let Some(root) = operand.field_path().and_then(|p| p.into_iter().next()) {
                    out.insert(root, op.as_str().to_string());
                }
            }
        }
        Node::Member { node, .. } | Node::Unary { node, .. } => collect_identifiers(node, out),
        Node::Index { node, index } => {
            collect_identifiers(node, out);
            collect_identifiers(index, out);
        }
        Node::Array(items) | Node::Call { args: items, .. } => {
            for item in items {
                collect_identifiers(item, out);
            }
        }
        _ => {}
    }
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExpr {
    source: String,
    ast: Node,
}

impl QueryExpr {
    pub fn parse(source: impl Into<String>) -> Result<Self, ExprError> {
        let source = source.into();
        let ast = parse(&source)?;
        Ok(Self { source, ast })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Node {
        &self.ast
    }

    pub fn to_sql(&self) -> Result<String, ExprError> {
        sql::to_sql(&self.ast)
    }

    pub fn to_search_query(&self) -> Result<serde_json::Value, ExprError> {
        search::to_search_query(&self.ast)
    }

    pub fn identifiers_with_operator(&self) -> BTreeMap<String, String> {
        let mut identifiers = BTreeMap::new();
        collect_identifiers(&self.ast, &mut identifiers);
        identifiers
    }
}

impl fmt::Display for QueryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for QueryExpr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for QueryExpr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        QueryExpr::parse(source).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_with_operator() {
        let identifiers = identifiers_with_operator(
            r#"(identifier1 == !(findLast([1, 2, 3, 4], # > 2) == 4)) && identifier2 != 'John' || identifier3 == "hallo""#,
        )
        .unwrap();
        let want: BTreeMap<String, String> = [
            ("identifier1", "=="),
            ("identifier2", "!="),
            ("identifier3", "=="),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(identifiers, want);
    }

    #[test]
    fn test_identifiers_member_root_and_not_in() {
        let identifiers =
            identifiers_with_operator(r#"data.team == 'x' && service not in ["a"]"#).unwrap();
        assert_eq!(identifiers.get("data").map(String::as_str), Some("=="));
        assert_eq!(identifiers.get("service").map(String::as_str), Some("not in"));
        assert!(!identifiers.contains_key("team"));
    }

    #[test]
    fn test_query_expr_serde() {
        let expr: QueryExpr = serde_json::from_str(r#""name == 'x'""#).unwrap();
        assert_eq!(expr.as_str(), "name == 'x'");
        assert_eq!(serde_json::to_string(&expr).unwrap(), r#""name == 'x'""#);
        assert!(serde_json::from_str::<QueryExpr>(r#""name ==""#).is_err());
    }

    /// Predicates in a SQL fragment: every one opens with `(` and an identifier.
    fn sql_leaves(sql: &str) -> usize {
        sql.as_bytes()
            .windows(2)
            .filter(|w| w[0] == b'(' && w[1].is_ascii_lowercase())
            .count()
    }

    fn search_leaves(doc: &serde_json::Value) -> usize {
        match doc {
            serde_json::Value::Object(map)
                if ["term", "terms", "range", "exists"].iter().any(|k| map.contains_key(*k)) =>
            {
                1
            }
            serde_json::Value::Object(map) => map.values().map(search_leaves).sum(),
            serde_json::Value::Array(items) => items.iter().map(search_leaves).sum(),
            _ => 0,
        }
    }

    #[test]
    fn test_both_outputs_have_one_leaf_per_identifier_reference() {
        let cases = [
            (r#"name == "John""#, 1),
            (r#"service in ["a", "b"] && refreshed_at < "2024-01-01""#, 2),
            (r#"!(type == "table") || data.owner.name != "x""#, 2),
            (
                r#"name == "a" && (service not in ["x"] || updated_at >= date("2024-01-01") - duration("24h"))"#,
                3,
            ),
            (r#"url == nil && labels.team == "core" && version > 1"#, 3),
        ];
        for (source, references) in cases {
            let expr = QueryExpr::parse(source).unwrap();
            let sql = expr.to_sql().unwrap();
            let doc = expr.to_search_query().unwrap();
            assert_eq!(sql_leaves(&sql), references, "{source} -> {sql}");
            assert_eq!(search_leaves(&doc), references, "{source} -> {doc}");
        }
    }

    #[test]
    fn test_parse_error_reports_position() {
        let err = parse("name == == 'x'").unwrap_err();
        assert!(matches!(err, ExprError::Parse { position: 8, .. }));
        assert!(err.to_string().starts_with("error parsing expression"));
    }
}
