//! Validation of expressions that select assets for bulk deletion.

use std::collections::BTreeMap;

use crate::error::{CompassError, Result};
use crate::queryexpr::QueryExpr;

/// Field names of an asset document usable as identifiers.
pub const ASSET_FIELDS: &[&str] = &[
    "id",
    "urn",
    "type",
    "service",
    "name",
    "description",
    "data",
    "url",
    "labels",
    "owners",
    "created_at",
    "updated_at",
    "refreshed_at",
    "version",
    "updated_by",
    "is_deleted",
    "changelog",
    "probes",
];

const REQUIRED_IDENTIFIERS: [&str; 3] = ["refreshed_at", "type", "service"];

/// A parsed expression that passed the bulk-delete constraints.
///
/// The expression must reference `refreshed_at`, `type` and `service`, may
/// only compare `type` and `service` with `==` or `in`, and may only
/// reference asset fields.
#[derive(Debug, Clone)]
pub struct DeleteAssetExpr {
    expr: QueryExpr,
}

impl DeleteAssetExpr {
    pub fn new(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Err(CompassError::EmptyQuery);
        }
        let expr = QueryExpr::parse(source)?;
        validate(&expr.identifiers_with_operator())?;
        Ok(Self { expr })
    }

    pub fn expr(&self) -> &QueryExpr {
        &self.expr
    }

    pub fn into_expr(self) -> QueryExpr {
        self.expr
    }
}

fn validate(identifiers: &BTreeMap<String, String>) -> Result<()> {
    if !REQUIRED_IDENTIFIERS
        .iter()
        .all(|name| identifiers.get(*name).is_some_and(|op| !op.is_empty()))
    {
        return Err(CompassError::MissRequiredIdentifier);
    }

    let is_equals_or_in = |name: &str| {
        identifiers
            .get(name)
            .is_some_and(|op| op == "==" || op.eq_ignore_ascii_case("in"))
    };
    if !is_equals_or_in("type") || !is_equals_or_in("service") {
        return Err(CompassError::TypeOrServiceHasWrongOperator);
    }

    if let Some(unknown) = identifiers
        .keys()
        .find(|name| !ASSET_FIELDS.contains(&name.as_str()))
    {
        return Err(CompassError::InvalidIdentifier(unknown.clone()));
    }
    Ok(())
}
