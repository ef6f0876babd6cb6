//! Search back-end: renders an expression as an Elasticsearch query document.

use serde_json::{json, Value as Json};

use super::ast::{BinaryOp, Node, UnaryOp};
use super::eval::evaluate;
use super::ExprError;

/// Identifiers matched against their `.keyword` sub-field.
pub const KEYWORD_IDENTIFIERS: &[&str] = &["service"];

/// Render `node` as `{"query": ...}`.
pub fn to_search_query(node: &Node) -> Result<Json, ExprError> {
    match translate(node)? {
        Fragment::Query(query) => Ok(json!({ "query": query })),
        Fragment::Field(field) => Ok(json!({ "query": { "term": { field: true } } })),
        Fragment::Literal(_) => Err(ExprError::UnsupportedNode(
            "failed to generate Elasticsearch query".to_string(),
        )),
    }
}

enum Fragment {
    /// Field reference, already mapped to its indexed name.
    Field(String),
    Literal(Json),
    Query(Json),
}

impl Fragment {
    /// Coerce into a query clause for a boolean context.
    fn into_query(self, node: &Node) -> Result<Json, ExprError> {
        match self {
            Fragment::Query(query) => Ok(query),
            Fragment::Field(field) => Ok(json!({ "term": { field: true } })),
            Fragment::Literal(Json::Bool(true)) => Ok(json!({ "match_all": {} })),
            Fragment::Literal(Json::Bool(false)) => Ok(json!({ "match_none": {} })),
            Fragment::Literal(_) => Err(unsupported(node)),
        }
    }
}

fn translate(node: &Node) -> Result<Fragment, ExprError> {
    if !node.has_identifier() {
        return Ok(Fragment::Literal(evaluate(node)?.to_json()));
    }

    match node {
        Node::Identifier(name) => Ok(Fragment::Field(field_name(name))),
        Node::Member { .. } | Node::Index { .. } => node
            .field_path()
            .map(|path| Fragment::Field(path.join(".")))
            .ok_or_else(|| unsupported(node)),
        Node::Binary { op, left, right } => translate_binary(node, *op, left, right),
        Node::Unary {
            op: UnaryOp::Not,
            node: inner,
        } => {
            let query = translate(inner)?.into_query(inner)?;
            Ok(Fragment::Query(must_not(query)))
        }
        _ => Err(unsupported(node)),
    }
}

fn translate_binary(
    node: &Node,
    op: BinaryOp,
    left: &Node,
    right: &Node,
) -> Result<Fragment, ExprError> {
    let l = translate(left)?;
    let r = translate(right)?;

    if op.is_logical() {
        let condition = if op == BinaryOp::And { "must" } else { "should" };
        let clauses = vec![l.into_query(left)?, r.into_query(right)?];
        return Ok(Fragment::Query(json!({ "bool": { condition: clauses } })));
    }

    // Normalise to (field, literal), mirroring range operators when swapped.
    let (field, value, op) = match (l, r) {
        (Fragment::Field(field), Fragment::Literal(value)) => (field, value, op),
        (Fragment::Literal(value), Fragment::Field(field)) if !op.is_membership() => {
            (field, value, op.flipped())
        }
        _ => return Err(unsupported(node)),
    };

    let query = match op {
        BinaryOp::Eq if value.is_null() => must_not(json!({ "exists": { "field": field } })),
        BinaryOp::Eq => json!({ "term": { field: value } }),
        BinaryOp::Ne if value.is_null() => json!({ "exists": { "field": field } }),
        BinaryOp::Ne => must_not(json!({ "term": { field: value } })),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            json!({ "range": { field: { range_operator(op): value } } })
        }
        BinaryOp::In | BinaryOp::NotIn => {
            if !value.is_array() {
                return Err(unsupported(node));
            }
            let terms = json!({ "terms": { field: value } });
            if op == BinaryOp::In {
                terms
            } else {
                must_not(terms)
            }
        }
        _ => return Err(unsupported(node)),
    };
    Ok(Fragment::Query(query))
}

fn field_name(identifier: &str) -> String {
    if KEYWORD_IDENTIFIERS.contains(&identifier) {
        format!("{identifier}.keyword")
    } else {
        identifier.to_string()
    }
}

fn range_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Gt => "gt",
        BinaryOp::Ge => "gte",
        BinaryOp::Lt => "lt",
        _ => "lte",
    }
}

fn must_not(query: Json) -> Json {
    json!({ "bool": { "must_not": [query] } })
}

fn unsupported(node: &Node) -> ExprError {
    ExprError::UnsupportedNode(format!(
        "unsupported query expr: {node} to Elasticsearch query"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queryexpr::parser::parse_expression;

    fn query(input: &str) -> Result<Json, ExprError> {
        to_search_query(&parse_expression(input)?)
    }

    #[test]
    fn test_range_queries() {
        assert_eq!(
            query("updated_at < '2024-04-05 23:59:59'").unwrap(),
            json!({"query": {"range": {"updated_at": {"lt": "2024-04-05 23:59:59"}}}})
        );
        assert_eq!(
            query(r#"updated_at > "2024-04-05 23:59:59""#).unwrap(),
            json!({"query": {"range": {"updated_at": {"gt": "2024-04-05 23:59:59"}}}})
        );
    }

    #[test]
    fn test_literal_on_left_flips_range() {
        assert_eq!(
            query("5 < version").unwrap(),
            json!({"query": {"range": {"version": {"gt": 5}}}})
        );
    }

    #[test]
    fn test_keyword_identifier_terms() {
        assert_eq!(
            query(r#"service in ["test1","test2","test3"]"#).unwrap(),
            json!({"query": {"terms": {"service.keyword": ["test1", "test2", "test3"]}}})
        );
    }

    #[test]
    fn test_or_with_not_in() {
        assert_eq!(
            query(r#"name == "John" || service not in ["test1","test2","test3"]"#).unwrap(),
            json!({"query": {"bool": {"should": [
                {"term": {"name": "John"}},
                {"bool": {"must_not": [{"terms": {"service.keyword": ["test1", "test2", "test3"]}}]}}
            ]}}})
        );
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(
            query("bool_identifier == !(findLast([1, 2, 3, 4], # > 2) == 4)").unwrap(),
            json!({"query": {"term": {"bool_identifier": false}}})
        );
        assert_eq!(
            query(r#"refreshed_at <= (date("2024-08-21T01:00:00Z") - duration('1h'))"#).unwrap(),
            json!({"query": {"range": {"refreshed_at": {"lte": "2024-08-21T00:00:00Z"}}}})
        );
    }

    #[test]
    fn test_and_not_equal() {
        assert_eq!(
            query("type == 'table' && name != 'x'").unwrap(),
            json!({"query": {"bool": {"must": [
                {"term": {"type": "table"}},
                {"bool": {"must_not": [{"term": {"name": "x"}}]}}
            ]}}})
        );
    }

    #[test]
    fn test_member_path_and_bare_identifier() {
        assert_eq!(
            query("data.team == 'core'").unwrap(),
            json!({"query": {"term": {"data.team": "core"}}})
        );
        assert_eq!(
            query("!is_deleted").unwrap(),
            json!({"query": {"bool": {"must_not": [{"term": {"is_deleted": true}}]}}})
        );
    }

    #[test]
    fn test_unsupported() {
        assert!(query("true").is_err());
        assert!(query("upper(name) == 'X'").is_err());
        assert!(query("name == other").is_err());
        assert!(query(r#"service in filter(assets, .Service startsWith "T")"#).is_err());
    }
}
