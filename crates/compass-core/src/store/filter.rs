//! Translation of listing filters into SQL.

use rusqlite::types::Value as SqlValue;

use super::placeholders;
use crate::asset::{Filter, NON_EMPTY_VALUE};
use crate::error::{InvalidError, Result};

/// Columns that may be sorted on or matched with a free-text query.
const TEXT_COLUMNS: &[&str] = &["urn", "type", "service", "name", "description", "url", "version"];
const SORT_COLUMNS: &[&str] = &[
    "urn",
    "type",
    "service",
    "name",
    "version",
    "created_at",
    "updated_at",
    "refreshed_at",
];
const DEFAULT_SORT: &str = "name";

/// A `WHERE` clause with its bound parameters.
#[derive(Debug, Default)]
pub(crate) struct SqlFilter {
    conditions: Vec<String>,
    pub params: Vec<SqlValue>,
}

impl SqlFilter {
    pub fn push(&mut self, condition: impl Into<String>, params: impl IntoIterator<Item = SqlValue>) {
        self.conditions.push(condition.into());
        self.params.extend(params);
    }

    /// `WHERE a AND b`, or an empty string without conditions.
    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }
}

/// Conditions of `filter` without paging or ordering.
pub(crate) fn build_conditions(filter: &Filter) -> Result<SqlFilter> {
    filter.validate()?;
    let mut sql = SqlFilter::default();

    sql.push("is_deleted = ?", [SqlValue::Integer(filter.is_deleted as i64)]);

    if !filter.types.is_empty() {
        sql.push(
            format!("type IN ({})", placeholders(filter.types.len())),
            filter.types.iter().map(|t| SqlValue::Text(t.to_string())),
        );
    }

    if !filter.services.is_empty() {
        sql.push(
            format!("service IN ({})", placeholders(filter.services.len())),
            filter.services.iter().cloned().map(SqlValue::Text),
        );
    }

    if !filter.query.is_empty() && !filter.query_fields.is_empty() {
        let pattern = format!("%{}%", escape_like(&filter.query));
        let mut matches = Vec::with_capacity(filter.query_fields.len());
        let mut params = Vec::with_capacity(filter.query_fields.len() * 2);
        for field in &filter.query_fields {
            let (expr, path) = field_expr(field)?;
            matches.push(format!("{expr} LIKE ? ESCAPE '\\'"));
            params.extend(path);
            params.push(SqlValue::Text(pattern.clone()));
        }
        sql.push(format!("({})", matches.join(" OR ")), params);
    }

    for (path, values) in &filter.data {
        let json_path = SqlValue::Text(json_path(path));
        if values.iter().any(|v| v == NON_EMPTY_VALUE) {
            sql.push(
                "(json_type(data, ?) IS NOT NULL AND json_type(data, ?) != 'null' \
                 AND NOT (json_type(data, ?) = 'text' AND data ->> ? = '') \
                 AND NOT (json_type(data, ?) = 'array' AND json_array_length(data, ?) = 0) \
                 AND NOT (json_type(data, ?) = 'object' AND data -> ? = '{}'))",
                std::iter::repeat_n(json_path, 8),
            );
        } else if !values.is_empty() {
            let mut params = vec![json_path];
            params.extend(values.iter().cloned().map(SqlValue::Text));
            sql.push(
                format!("CAST(data ->> ? AS TEXT) IN ({})", placeholders(values.len())),
                params,
            );
        }
    }

    Ok(sql)
}

/// `ORDER BY … LIMIT … OFFSET …` for `filter`.
pub(crate) fn build_paging(filter: &Filter) -> Result<String> {
    let column = if filter.sort_by.is_empty() {
        DEFAULT_SORT
    } else {
        SORT_COLUMNS
            .iter()
            .copied()
            .find(|c| *c == filter.sort_by)
            .ok_or_else(|| InvalidError::Field {
                field: "sort_by".to_string(),
                message: format!("cannot sort by {:?}", filter.sort_by),
            })?
    };
    let limit = if filter.size == 0 { -1 } else { filter.size };
    Ok(format!(
        "ORDER BY {} {}, id ASC LIMIT {} OFFSET {}",
        column,
        filter.sort_direction.as_sql(),
        limit,
        filter.offset
    ))
}

/// SQL expression for a queryable field. `data.x.y` reads the JSON payload.
fn field_expr(field: &str) -> Result<(String, Option<SqlValue>)> {
    if let Some(path) = field.strip_prefix("data.") {
        return Ok(("data ->> ?".to_string(), Some(SqlValue::Text(json_path(path)))));
    }
    TEXT_COLUMNS
        .iter()
        .find(|c| **c == field)
        .map(|c| (c.to_string(), None))
        .ok_or_else(|| {
            InvalidError::Field {
                field: "query_fields".to_string(),
                message: format!("{field:?} cannot be queried"),
            }
            .into()
        })
}

/// `a.b` becomes the SQLite JSON path `$."a"."b"`.
pub(crate) fn json_path(dotted: &str) -> String {
    let mut path = String::from("$");
    for segment in dotted.split('.') {
        path.push_str(".\"");
        path.push_str(&segment.replace('"', "\\\""));
        path.push('"');
    }
    path
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_default_filter_only_checks_deleted() {
        let sql = build_conditions(&Filter::default()).unwrap();
        assert_eq!(sql.where_clause(), "WHERE is_deleted = ?");
        assert_eq!(sql.params, vec![SqlValue::Integer(0)]);
    }

    #[test]
    fn test_types_services_and_query() {
        let filter = Filter {
            types: vec!["table".into(), "topic".into()],
            services: vec!["bq".to_string()],
            query: "ord_".to_string(),
            query_fields: vec!["name".to_string(), "data.owner.team".to_string()],
            ..Default::default()
        };
        let sql = build_conditions(&filter).unwrap();
        assert_eq!(
            sql.where_clause(),
            "WHERE is_deleted = ? AND type IN (?, ?) AND service IN (?) \
             AND (name LIKE ? ESCAPE '\\' OR data ->> ? LIKE ? ESCAPE '\\')"
        );
        assert_eq!(sql.params[4], SqlValue::Text("%ord\\_%".to_string()));
        assert_eq!(sql.params[5], SqlValue::Text("$.\"owner\".\"team\"".to_string()));
        assert_eq!(sql.params[6], sql.params[4]);
    }

    #[test]
    fn test_unknown_query_field_is_rejected() {
        let filter = Filter {
            query: "x".to_string(),
            query_fields: vec!["password".to_string()],
            ..Default::default()
        };
        assert!(build_conditions(&filter).is_err());
    }

    #[test]
    fn test_data_filters() {
        let mut data = BTreeMap::new();
        data.insert("country".to_string(), vec!["id".to_string(), "sg".to_string()]);
        data.insert("owner".to_string(), vec![NON_EMPTY_VALUE.to_string()]);
        let filter = Filter {
            data,
            ..Default::default()
        };
        let sql = build_conditions(&filter).unwrap();
        let clause = sql.where_clause();
        assert!(clause.contains("CAST(data ->> ? AS TEXT) IN (?, ?)"));
        assert!(clause.contains("json_array_length(data, ?) = 0"));
        assert_eq!(sql.params.len(), 1 + 3 + 8);
    }

    #[test]
    fn test_paging() {
        let filter = Filter {
            size: 10,
            offset: 20,
            sort_by: "updated_at".to_string(),
            sort_direction: crate::asset::SortDirection::Desc,
            ..Default::default()
        };
        assert_eq!(
            build_paging(&filter).unwrap(),
            "ORDER BY updated_at DESC, id ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            build_paging(&Filter::default()).unwrap(),
            "ORDER BY name ASC, id ASC LIMIT -1 OFFSET 0"
        );
        let bad = Filter {
            sort_by: "data; DROP TABLE assets".to_string(),
            ..Default::default()
        };
        assert!(build_paging(&bad).is_err());
    }

    #[test]
    fn test_negative_range_is_invalid() {
        let filter = Filter {
            size: -1,
            ..Default::default()
        };
        assert!(build_conditions(&filter).is_err());
    }
}
