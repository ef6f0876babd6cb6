//! Lineage adjacency storage and traversal.
//!
//! Edges do not carry deletion state. Whether an endpoint is soft-deleted
//! is read from `assets` when a graph is fetched, so soft deletes and
//! revivals of an asset need no lineage writes.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::debug;

use super::{parse_json, placeholders, Database};
use crate::asset::{
    LineageDirection, LineageEdge, LineageGraph, LineageQuery, LineageRepository, ROOT_PROP,
    SOURCE_IS_DELETED_PROP, TARGET_IS_DELETED_PROP,
};
use crate::error::{CompassError, Result};

/// SQLite implementation of [`LineageRepository`].
pub struct SqliteLineageRepository {
    db: Database,
}

impl SqliteLineageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Recursive traversal from one node.
///
/// `near` is the endpoint shared with the previous step and `far` the one
/// the walk continues from: `target`/`source` going upstream. Visited nodes
/// are kept in a `char(31)` delimited path to stop on cycles.
fn traversal_sql(direction: LineageDirection) -> String {
    let (near, far) = match direction {
        LineageDirection::Upstream => ("target", "source"),
        LineageDirection::Downstream => ("source", "target"),
    };
    format!(
        "WITH RECURSIVE walk (source, target, prop, depth, path) AS (
             SELECT lg.source, lg.target, lg.prop, 1, char(31) || lg.{near} || char(31)
             FROM lineage_graph lg
             WHERE lg.{near} = ?1
               AND (?3 = 1 OR NOT EXISTS (
                   SELECT 1 FROM assets a
                   WHERE a.urn IN (lg.source, lg.target) AND a.is_deleted = 1))
             UNION ALL
             SELECT lg.source, lg.target, lg.prop, walk.depth + 1,
                    walk.path || lg.{near} || char(31)
             FROM lineage_graph lg
             JOIN walk ON lg.{near} = walk.{far}
             WHERE instr(walk.path, char(31) || lg.{near} || char(31)) = 0
               AND (?2 = 0 OR walk.depth < ?2)
               AND (?3 = 1 OR NOT EXISTS (
                   SELECT 1 FROM assets a
                   WHERE a.urn IN (lg.source, lg.target) AND a.is_deleted = 1))
         )
         SELECT walk.source, walk.target, walk.prop,
                COALESCE(s.is_deleted, 0), COALESCE(t.is_deleted, 0)
         FROM walk
         LEFT JOIN assets s ON s.urn = walk.source
         LEFT JOIN assets t ON t.urn = walk.target
         ORDER BY walk.depth, walk.source, walk.target"
    )
}

fn traverse(
    conn: &Connection,
    urn: &str,
    direction: LineageDirection,
    query: &LineageQuery,
) -> Result<Vec<LineageEdge>> {
    let mut stmt = conn.prepare_cached(&traversal_sql(direction))?;
    let rows = stmt.query_map(
        params![urn, query.level, query.include_deleted],
        |row| {
            let prop: String = row.get(2)?;
            let mut prop: Map<String, Value> = parse_json(&prop)?;
            prop.insert(
                SOURCE_IS_DELETED_PROP.to_string(),
                Value::Bool(row.get(3)?),
            );
            prop.insert(
                TARGET_IS_DELETED_PROP.to_string(),
                Value::Bool(row.get(4)?),
            );
            Ok(LineageEdge {
                source: row.get(0)?,
                target: row.get(1)?,
                prop,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn direct_lineage(conn: &Connection, urn: &str) -> Result<Vec<LineageEdge>> {
    let mut stmt = conn.prepare_cached(
        "SELECT source, target, prop FROM lineage_graph WHERE source = ?1 OR target = ?1",
    )?;
    let edges = stmt
        .query_map(params![urn], |row| {
            Ok(LineageEdge {
                source: row.get(0)?,
                target: row.get(1)?,
                prop: parse_json(&row.get::<_, String>(2)?)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(edges)
}

/// Edges of `urn` as described by its own upstreams and downstreams.
fn build_graph(urn: &str, upstreams: &[String], downstreams: &[String]) -> Vec<LineageEdge> {
    upstreams
        .iter()
        .map(|up| LineageEdge::new(up.as_str(), urn, urn))
        .chain(
            downstreams
                .iter()
                .map(|down| LineageEdge::new(urn, down.as_str(), urn)),
        )
        .collect()
}

/// Split `current` and `desired` into edges to insert and edges to remove,
/// compared by `(source, target)`.
fn compare_graph(
    current: Vec<LineageEdge>,
    desired: Vec<LineageEdge>,
) -> (Vec<LineageEdge>, Vec<LineageEdge>) {
    let mut remaining: BTreeMap<(String, String), LineageEdge> = current
        .into_iter()
        .map(|e| ((e.source.clone(), e.target.clone()), e))
        .collect();
    let mut to_insert = Vec::new();
    for edge in desired {
        let key = (edge.source.clone(), edge.target.clone());
        if remaining.remove(&key).is_none() {
            to_insert.push(edge);
        }
    }
    (to_insert, remaining.into_values().collect())
}

/// Keep only edges that `urn` may remove: those it installed, or those
/// without a recorded root.
fn filter_self_delete_only(urn: &str, to_remove: Vec<LineageEdge>) -> Vec<LineageEdge> {
    to_remove
        .into_iter()
        .filter(|edge| edge.prop.get(ROOT_PROP).is_none() || edge.root() == Some(urn))
        .collect()
}

#[async_trait]
impl LineageRepository for SqliteLineageRepository {
    async fn get_graph(&self, urn: &str, query: &LineageQuery) -> Result<LineageGraph> {
        let urn = urn.to_string();
        let query = query.clone();
        self.db
            .run(move |conn| {
                let mut graph = LineageGraph::new();
                let mut seen = HashSet::new();
                for direction in [LineageDirection::Upstream, LineageDirection::Downstream] {
                    if !query.includes(direction) {
                        continue;
                    }
                    for edge in traverse(conn, &urn, direction, &query)? {
                        if seen.insert((edge.source.clone(), edge.target.clone())) {
                            graph.push(edge);
                        }
                    }
                }
                Ok(graph)
            })
            .await
    }

    async fn upsert(&self, urn: &str, upstreams: &[String], downstreams: &[String]) -> Result<()> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        let urn = urn.to_string();
        let desired = build_graph(&urn, upstreams, downstreams);
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = direct_lineage(&tx, &urn)?;
                let (to_insert, to_remove) = compare_graph(current, desired);
                let to_remove = filter_self_delete_only(&urn, to_remove);

                for edge in &to_insert {
                    tx.execute(
                        "INSERT INTO lineage_graph (source, target, prop) VALUES (?1, ?2, ?3)
                         ON CONFLICT (source, target) DO NOTHING",
                        params![edge.source, edge.target, serde_json::to_string(&edge.prop)?],
                    )?;
                }
                for edge in &to_remove {
                    tx.execute(
                        "DELETE FROM lineage_graph WHERE source = ?1 AND target = ?2",
                        params![edge.source, edge.target],
                    )?;
                }
                tx.commit()?;

                debug!(
                    urn = %urn,
                    inserted = to_insert.len(),
                    removed = to_remove.len(),
                    "Reconciled lineage"
                );
                Ok(())
            })
            .await
    }

    async fn delete_by_urn(&self, urn: &str) -> Result<()> {
        self.delete_by_urns(&[urn.to_string()]).await
    }

    async fn delete_by_urns(&self, urns: &[String]) -> Result<()> {
        if urns.is_empty() {
            return Ok(());
        }
        let list = placeholders(urns.len());
        let values: Vec<SqlValue> = urns
            .iter()
            .chain(urns.iter())
            .cloned()
            .map(SqlValue::Text)
            .collect();
        self.db
            .run(move |conn| {
                let removed = conn.execute(
                    &format!("DELETE FROM lineage_graph WHERE source IN ({list}) OR target IN ({list})"),
                    params_from_iter(values.iter()),
                )?;
                debug!(removed, "Deleted lineage edges");
                Ok(())
            })
            .await
    }

    async fn soft_delete_by_urn(&self, _urn: &str) -> Result<()> {
        Ok(())
    }

    async fn soft_delete_by_urns(&self, _urns: &[String]) -> Result<()> {
        Ok(())
    }
}
