//! In-process counters of asset service operations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

/// How a caller identified an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum IdentifierKind {
    #[serde(rename = "ID")]
    Id,
    #[serde(rename = "URN")]
    Urn,
}

impl IdentifierKind {
    /// `Id` when `identifier` parses as a UUID, `Urn` otherwise.
    pub fn of(identifier: &str) -> Self {
        if uuid::Uuid::parse_str(identifier).is_ok() {
            IdentifierKind::Id
        } else {
            IdentifierKind::Urn
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierKind::Id => "ID",
            IdentifierKind::Urn => "URN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OperationKey {
    operation: &'static str,
    kind: IdentifierKind,
    success: bool,
}

/// One row of a counter snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationCount {
    pub operation: &'static str,
    pub identifier: IdentifierKind,
    pub success: bool,
    pub count: u64,
}

/// Counts operations by name, identifier kind and outcome.
#[derive(Debug, Default)]
pub struct OperationCounter {
    counts: Mutex<BTreeMap<OperationKey, u64>>,
}

impl OperationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &'static str, kind: IdentifierKind, success: bool) {
        debug!(
            operation,
            identifier = kind.as_str(),
            success,
            "compass.asset.operation"
        );
        // a poisoned counter only loses metrics
        if let Ok(mut counts) = self.counts.lock() {
            *counts
                .entry(OperationKey {
                    operation,
                    kind,
                    success,
                })
                .or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<OperationCount> {
        let Ok(counts) = self.counts.lock() else {
            return Vec::new();
        };
        counts
            .iter()
            .map(|(key, count)| OperationCount {
                operation: key.operation,
                identifier: key.kind,
                success: key.success,
                count: *count,
            })
            .collect()
    }
}
