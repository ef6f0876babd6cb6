//! Asset storage: rows, owners, version history and probes.
//!
//! Writes run inside `BEGIN IMMEDIATE` transactions. The write lock is
//! taken before the pre-image is read, so concurrent upserts of one urn
//! are serialised and every version row observes a consistent pre-image.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::debug;

use super::filter::{build_conditions, build_paging};
use super::user_repo::{get_or_insert, user_from_row, USER_COLUMNS};
use super::{
    format_ts, is_foreign_key_violation, is_unique_violation, parse_json, parse_opt_ts, parse_ts,
    placeholders, Database,
};
use crate::asset::{
    increase_minor_version, parse_version, soft_delete_changelog, ArrayMergeRules, Asset,
    AssetRepository, Change, Filter, Probe, ProbesFilter, TypeRegistry, BASE_VERSION,
};
use crate::config::{ServiceDefaults, StoreConfig};
use crate::error::{CompassError, InvalidError, NotFoundError, Result};
use crate::queryexpr::QueryExpr;
use crate::user::User;

const ASSET_SELECT: &str = "SELECT id, urn, type, service, name, description, data, url, labels, \
     version, updated_by, created_at, updated_at, refreshed_at, is_deleted, \
     (SELECT u.email FROM users u WHERE u.id = assets.updated_by), \
     (SELECT u.provider FROM users u WHERE u.id = assets.updated_by) \
     FROM assets";

const VERSION_SELECT: &str = "SELECT asset_id, urn, type, service, name, description, data, url, labels, \
     version, updated_by, created_at, updated_at, refreshed_at, is_deleted, \
     (SELECT u.email FROM users u WHERE u.id = assets_versions.updated_by), \
     (SELECT u.provider FROM users u WHERE u.id = assets_versions.updated_by), \
     owners, changelog \
     FROM assets_versions";

const VERSION_ORDER: &str = "ORDER BY CAST(substr(version, 1, instr(version, '.') - 1) AS INTEGER) DESC, \
     CAST(substr(version, instr(version, '.') + 1) AS INTEGER) DESC";

const PROBE_COLUMNS: &str = "id, asset_urn, status, status_reason, metadata, timestamp, created_at";

/// Settings shared by every write.
#[derive(Clone)]
struct WriteContext {
    registry: Arc<TypeRegistry>,
    provider: String,
    merge_rules: Arc<ArrayMergeRules>,
}

/// SQLite implementation of [`AssetRepository`].
pub struct SqliteAssetRepository {
    db: Database,
    ctx: WriteContext,
}

impl SqliteAssetRepository {
    pub fn new(db: Database, registry: Arc<TypeRegistry>) -> Self {
        Self {
            db,
            ctx: WriteContext {
                registry,
                provider: ServiceDefaults::USER_PROVIDER.to_string(),
                merge_rules: Arc::new(ArrayMergeRules::new()),
            },
        }
    }

    /// Provider stamped on users created while resolving owners.
    pub fn with_default_provider(mut self, provider: impl Into<String>) -> Self {
        self.ctx.provider = provider.into();
        self
    }

    pub fn with_array_merge_rules(mut self, rules: ArrayMergeRules) -> Self {
        self.ctx.merge_rules = Arc::new(rules);
        self
    }
}

// ========================================
// Row mapping
// ========================================

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let data: String = row.get(6)?;
    let labels: String = row.get(8)?;
    Ok(Asset {
        id: row.get(0)?,
        urn: row.get(1)?,
        asset_type: row.get::<_, String>(2)?.into(),
        service: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        data: Some(parse_json(&data)?),
        url: row.get(7)?,
        labels: parse_json(&labels)?,
        version: row.get(9)?,
        updated_by: User {
            id: row.get(10)?,
            email: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
            provider: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
            ..Default::default()
        },
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
        updated_at: parse_ts(&row.get::<_, String>(12)?)?,
        refreshed_at: parse_opt_ts(row.get(13)?)?,
        is_deleted: row.get(14)?,
        ..Default::default()
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let mut asset = asset_from_row(row)?;
    asset.owners = parse_json(&row.get::<_, String>(17)?)?;
    asset.changelog = parse_json(&row.get::<_, String>(18)?)?;
    Ok(asset)
}

fn probe_from_row(row: &Row<'_>) -> rusqlite::Result<Probe> {
    let metadata: Option<String> = row.get(4)?;
    Ok(Probe {
        id: row.get(0)?,
        asset_urn: row.get(1)?,
        status: row.get(2)?,
        status_reason: row.get(3)?,
        metadata: metadata.as_deref().map(parse_json).transpose()?,
        timestamp: Some(parse_ts(&row.get::<_, String>(5)?)?),
        created_at: Some(parse_ts(&row.get::<_, String>(6)?)?),
    })
}

fn ensure_uuid(id: &str) -> Result<()> {
    if uuid::Uuid::parse_str(id).is_err() {
        return Err(InvalidError::AssetId(id.to_string()).into());
    }
    Ok(())
}

fn select_asset(conn: &Connection, condition: &str, key: &str) -> Result<Option<Asset>> {
    Ok(conn
        .query_row(
            &format!("{ASSET_SELECT} WHERE {condition}"),
            params![key],
            asset_from_row,
        )
        .optional()?)
}

fn load_owners(conn: &Connection, asset_id: &str) -> Result<Vec<User>> {
    let columns = USER_COLUMNS
        .split(", ")
        .map(|c| format!("u.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {columns} FROM asset_owners o JOIN users u ON u.id = o.user_id
         WHERE o.asset_id = ?1 ORDER BY o.created_at, u.email"
    ))?;
    let owners = stmt
        .query_map(params![asset_id], user_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(owners)
}

fn get_with_owners(conn: &Connection, condition: &str, key: &str) -> Result<Option<Asset>> {
    let Some(mut asset) = select_asset(conn, condition, key)? else {
        return Ok(None);
    };
    asset.owners = load_owners(conn, &asset.id)?;
    Ok(Some(asset))
}

// ========================================
// Owners
// ========================================

/// Resolve owners into stored users, creating users for unknown emails.
/// The result is deduplicated by id and keeps the input order.
fn resolve_owners(conn: &Connection, owners: &[User], provider: &str) -> Result<Vec<User>> {
    let mut seen = BTreeSet::new();
    let mut resolved = Vec::with_capacity(owners.len());
    for owner in owners {
        let id = if !owner.id.is_empty() {
            let known: Option<String> = conn
                .query_row("SELECT id FROM users WHERE id = ?1", params![owner.id], |row| {
                    row.get(0)
                })
                .optional()?;
            match known {
                Some(id) => id,
                None if !owner.email.is_empty() => get_or_insert(conn, &owner.email, provider)?,
                None => return Err(NotFoundError::UserId(owner.id.clone()).into()),
            }
        } else if !owner.email.is_empty() {
            get_or_insert(conn, &owner.email, provider)?
        } else {
            continue;
        };
        if seen.insert(id.clone()) {
            let user = conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )?;
            resolved.push(user);
        }
    }
    Ok(resolved)
}

fn resolve_author(conn: &Connection, user: &User, provider: &str) -> Result<User> {
    if !user.id.is_empty() {
        return Ok(user.clone());
    }
    if user.email.is_empty() {
        return Ok(User::default());
    }
    let id = get_or_insert(conn, &user.email, provider)?;
    Ok(User {
        id,
        ..user.clone()
    })
}

/// Make the owner links of `asset_id` equal to `owners`.
fn reconcile_owners(conn: &Connection, asset_id: &str, current: &[User], owners: &[User]) -> Result<()> {
    let current_ids: BTreeSet<&str> = current.iter().map(|u| u.id.as_str()).collect();
    let new_ids: BTreeSet<&str> = owners.iter().map(|u| u.id.as_str()).collect();
    let now = format_ts(&Utc::now());

    for id in current_ids.difference(&new_ids) {
        conn.execute(
            "DELETE FROM asset_owners WHERE asset_id = ?1 AND user_id = ?2",
            params![asset_id, id],
        )?;
    }
    for id in new_ids.difference(&current_ids) {
        conn.execute(
            "INSERT INTO asset_owners (asset_id, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![asset_id, id, now],
        )?;
    }
    Ok(())
}

// ========================================
// Writes
// ========================================

fn insert_version(conn: &Connection, asset: &Asset, changelog: &[Change]) -> Result<()> {
    conn.execute(
        "INSERT INTO assets_versions (asset_id, urn, type, service, name, description, data, url,
             labels, owners, version, updated_by, created_at, updated_at, refreshed_at, is_deleted,
             changelog)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            asset.id,
            asset.urn,
            asset.asset_type.as_str(),
            asset.service,
            asset.name,
            asset.description,
            serde_json::to_string(&asset.data_or_empty())?,
            asset.url,
            serde_json::to_string(&asset.labels)?,
            serde_json::to_string(&asset.owners)?,
            asset.version,
            asset.updated_by.id,
            format_ts(&asset.created_at),
            format_ts(&asset.updated_at),
            asset.refreshed_at.as_ref().map(format_ts),
            asset.is_deleted,
            serde_json::to_string(changelog)?,
        ],
    )?;
    Ok(())
}

fn insert_asset(conn: &Connection, ctx: &WriteContext, mut asset: Asset, now: DateTime<Utc>) -> Result<Asset> {
    asset.validate(&ctx.registry)?;
    asset.owners = resolve_owners(conn, &asset.owners, &ctx.provider)?;
    asset.updated_by = resolve_author(conn, &asset.updated_by, &ctx.provider)?;
    asset.id = uuid::Uuid::new_v4().to_string();
    asset.version = BASE_VERSION.to_string();
    asset.created_at = now;
    asset.updated_at = now;
    asset.refreshed_at = Some(asset.refreshed_at.unwrap_or(now));
    asset.is_deleted = false;
    asset.changelog.clear();
    asset.probes.clear();

    conn.execute(
        "INSERT INTO assets (id, urn, type, service, name, description, data, url, labels,
             version, updated_by, created_at, updated_at, refreshed_at, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?13, 0)",
        params![
            asset.id,
            asset.urn,
            asset.asset_type.as_str(),
            asset.service,
            asset.name,
            asset.description,
            serde_json::to_string(&asset.data_or_empty())?,
            asset.url,
            serde_json::to_string(&asset.labels)?,
            asset.version,
            asset.updated_by.id,
            format_ts(&now),
            asset.refreshed_at.as_ref().map(format_ts),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            CompassError::UrnExists {
                urn: asset.urn.clone(),
            }
        } else {
            e.into()
        }
    })?;

    reconcile_owners(conn, &asset.id, &[], &asset.owners)?;
    insert_version(conn, &asset, &[])?;
    debug!(urn = %asset.urn, id = %asset.id, "Inserted asset");
    Ok(asset)
}

fn upsert_in_tx(
    conn: &Connection,
    ctx: &WriteContext,
    asset: &Asset,
    patch: Option<&Map<String, Value>>,
    is_update_only: bool,
) -> Result<Asset> {
    if asset.urn.is_empty() {
        return Err(CompassError::EmptyUrn);
    }
    let now = Utc::now();

    let Some(existing) = get_with_owners(conn, "urn = ?1", &asset.urn)? else {
        if is_update_only {
            return Err(NotFoundError::Urn(asset.urn.clone()).into());
        }
        let mut created = asset.clone();
        if let Some(patch) = patch {
            created.patch(patch, &ctx.merge_rules)?;
            created.urn = asset.urn.clone();
        }
        return insert_asset(conn, ctx, created, now);
    };

    let mut next = match patch {
        Some(patch) => {
            let mut merged = existing.clone();
            merged.patch(patch, &ctx.merge_rules)?;
            merged.updated_by = asset.updated_by.clone();
            merged.refreshed_at = asset.refreshed_at;
            merged
        }
        None => asset.clone(),
    };
    next.validate(&ctx.registry)?;
    next.is_deleted = false;

    let changelog = existing.diff(&next);
    let refreshed_at = next.refreshed_at.unwrap_or(now);

    if changelog.is_empty() {
        if existing
            .refreshed_at
            .is_some_and(|t| format_ts(&t) == format_ts(&refreshed_at))
        {
            return Ok(existing);
        }
        conn.execute(
            "UPDATE assets SET refreshed_at = ?1 WHERE id = ?2",
            params![format_ts(&refreshed_at), existing.id],
        )?;
        debug!(urn = %existing.urn, "Refreshed asset without changes");
        return Ok(Asset {
            refreshed_at: Some(refreshed_at),
            ..existing
        });
    }

    let owners = resolve_owners(conn, &next.owners, &ctx.provider)?;
    reconcile_owners(conn, &existing.id, &existing.owners, &owners)?;

    let stored = Asset {
        id: existing.id.clone(),
        urn: existing.urn.clone(),
        asset_type: existing.asset_type.clone(),
        service: existing.service.clone(),
        name: next.name,
        description: next.description,
        data: Some(next.data.unwrap_or_default()),
        url: next.url,
        labels: next.labels,
        owners,
        created_at: existing.created_at,
        updated_at: now,
        refreshed_at: Some(refreshed_at),
        version: increase_minor_version(&existing.version)?,
        updated_by: resolve_author(conn, &next.updated_by, &ctx.provider)?,
        is_deleted: false,
        changelog: Vec::new(),
        probes: Vec::new(),
    };

    conn.execute(
        "UPDATE assets SET name = ?1, description = ?2, data = ?3, url = ?4, labels = ?5,
             version = ?6, updated_by = ?7, updated_at = ?8, refreshed_at = ?9, is_deleted = 0
         WHERE id = ?10",
        params![
            stored.name,
            stored.description,
            serde_json::to_string(&stored.data_or_empty())?,
            stored.url,
            serde_json::to_string(&stored.labels)?,
            stored.version,
            stored.updated_by.id,
            format_ts(&now),
            format_ts(&refreshed_at),
            stored.id,
        ],
    )?;
    insert_version(conn, &stored, &changelog)?;
    debug!(
        urn = %stored.urn,
        version = %stored.version,
        changes = changelog.len(),
        "Updated asset"
    );
    Ok(stored)
}

fn soft_delete_in_tx(
    conn: &Connection,
    mut asset: Asset,
    executed_at: DateTime<Utc>,
    updated_by: &str,
) -> Result<Asset> {
    if asset.is_deleted {
        return Err(CompassError::AlreadyDeleted { identifier: asset.urn });
    }
    asset.version = increase_minor_version(&asset.version)?;
    asset.is_deleted = true;
    asset.updated_at = executed_at;
    asset.refreshed_at = Some(executed_at);
    asset.updated_by = User::with_id(updated_by);
    if asset.owners.is_empty() {
        asset.owners = load_owners(conn, &asset.id)?;
    }

    conn.execute(
        "UPDATE assets SET is_deleted = 1, version = ?1, updated_at = ?2, refreshed_at = ?2,
             updated_by = ?3
         WHERE id = ?4",
        params![asset.version, format_ts(&executed_at), updated_by, asset.id],
    )?;
    insert_version(conn, &asset, &soft_delete_changelog())?;
    Ok(asset)
}

/// `is_deleted = ? AND updated_at < ? [AND service IN (…)]`; `*` matches any service.
fn stale_conditions(
    is_deleted: bool,
    services: &[String],
    threshold: DateTime<Utc>,
) -> Result<(String, Vec<SqlValue>)> {
    if services.is_empty() {
        return Err(CompassError::EmptyServices);
    }
    let mut condition = "is_deleted = ? AND updated_at < ?".to_string();
    let mut values = vec![
        SqlValue::Integer(is_deleted as i64),
        SqlValue::Text(format_ts(&threshold)),
    ];
    if !services.iter().any(|s| s == "*") {
        condition.push_str(&format!(" AND service IN ({})", placeholders(services.len())));
        values.extend(services.iter().cloned().map(SqlValue::Text));
    }
    Ok((condition, values))
}

fn get_by_version(
    conn: &Connection,
    condition: &str,
    identifier: &str,
    version: &str,
) -> Result<Asset> {
    parse_version(version)?;
    let latest = get_with_owners(conn, condition, identifier)?.ok_or_else(|| {
        if condition.starts_with("id") {
            CompassError::from(NotFoundError::AssetId(identifier.to_string()))
        } else {
            CompassError::from(NotFoundError::Urn(identifier.to_string()))
        }
    })?;
    if latest.version == version {
        return Ok(latest);
    }

    let snapshot = conn
        .query_row(
            &format!("{VERSION_SELECT} WHERE asset_id = ?1 AND version = ?2"),
            params![latest.id, version],
            version_from_row,
        )
        .optional()?
        .ok_or_else(|| NotFoundError::Version {
            identifier: identifier.to_string(),
            version: version.to_string(),
        })?;
    Ok(Asset {
        id: latest.id,
        urn: latest.urn,
        asset_type: latest.asset_type,
        service: latest.service,
        ..snapshot
    })
}

#[async_trait]
impl AssetRepository for SqliteAssetRepository {
    async fn get_all(&self, filter: &Filter) -> Result<Vec<Asset>> {
        let conditions = build_conditions(filter)?;
        let paging = build_paging(filter)?;
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{ASSET_SELECT} {} {paging}",
                    conditions.where_clause()
                ))?;
                let assets = stmt
                    .query_map(params_from_iter(conditions.params.iter()), asset_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(assets)
            })
            .await
    }

    async fn get_count(&self, filter: &Filter) -> Result<u64> {
        let conditions = build_conditions(filter)?;
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM assets {}", conditions.where_clause()),
                    params_from_iter(conditions.params.iter()),
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn get_count_by_query_expr(&self, expr: &QueryExpr) -> Result<u64> {
        let sql = expr.to_sql()?;
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM assets WHERE {sql}"),
                    [],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn get_count_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<u64> {
        let (condition, values) = stale_conditions(is_deleted, services, threshold)?;
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM assets WHERE {condition}"),
                    params_from_iter(values.iter()),
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn get_by_id(&self, id: &str) -> Result<Asset> {
        ensure_uuid(id)?;
        let id = id.to_string();
        self.db
            .run(move |conn| {
                get_with_owners(conn, "id = ?1", &id)?
                    .ok_or_else(|| NotFoundError::AssetId(id.clone()).into())
            })
            .await
    }

    async fn get_by_urn(&self, urn: &str) -> Result<Asset> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        let urn = urn.to_string();
        self.db
            .run(move |conn| {
                get_with_owners(conn, "urn = ?1", &urn)?
                    .ok_or_else(|| NotFoundError::Urn(urn.clone()).into())
            })
            .await
    }

    async fn get_version_history(&self, filter: &Filter, id: &str) -> Result<Vec<Asset>> {
        filter.validate()?;
        ensure_uuid(id)?;
        let id = id.to_string();
        let size = if filter.size == 0 {
            StoreConfig::DEFAULT_MAX_RESULT_SIZE
        } else {
            filter.size
        };
        let offset = filter.offset;
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{VERSION_SELECT} WHERE asset_id = ?1 {VERSION_ORDER} LIMIT ?2 OFFSET ?3"
                ))?;
                let versions = stmt
                    .query_map(params![id, size, offset], version_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(versions)
            })
            .await
    }

    async fn get_by_version_with_id(&self, id: &str, version: &str) -> Result<Asset> {
        ensure_uuid(id)?;
        let (id, version) = (id.to_string(), version.to_string());
        self.db
            .run(move |conn| get_by_version(conn, "id = ?1", &id, &version))
            .await
    }

    async fn get_by_version_with_urn(&self, urn: &str, version: &str) -> Result<Asset> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        let (urn, version) = (urn.to_string(), version.to_string());
        self.db
            .run(move |conn| get_by_version(conn, "urn = ?1", &urn, &version))
            .await
    }

    async fn get_types(&self, filter: &Filter) -> Result<BTreeMap<String, u64>> {
        let live = Filter {
            is_deleted: false,
            ..filter.clone()
        };
        let conditions = build_conditions(&live)?;
        let registry = Arc::clone(&self.ctx.registry);
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT type, COUNT(*) FROM assets {} GROUP BY type",
                    conditions.where_clause()
                ))?;
                let rows = stmt
                    .query_map(params_from_iter(conditions.params.iter()), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows
                    .into_iter()
                    .filter(|(name, _)| registry.is_valid(&name.as_str().into()))
                    .map(|(name, count)| (name, count as u64))
                    .collect())
            })
            .await
    }

    async fn upsert(&self, asset: &Asset, is_update_only: bool) -> Result<Asset> {
        let asset = asset.clone();
        let ctx = self.ctx.clone();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let stored = upsert_in_tx(&tx, &ctx, &asset, None, is_update_only)?;
                tx.commit()?;
                Ok(stored)
            })
            .await
    }

    async fn upsert_patch(
        &self,
        asset: &Asset,
        patch: &Map<String, Value>,
        is_update_only: bool,
    ) -> Result<Asset> {
        let asset = asset.clone();
        let patch = patch.clone();
        let ctx = self.ctx.clone();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let stored = upsert_in_tx(&tx, &ctx, &asset, Some(&patch), is_update_only)?;
                tx.commit()?;
                Ok(stored)
            })
            .await
    }

    async fn delete_by_id(&self, id: &str) -> Result<String> {
        ensure_uuid(id)?;
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "DELETE FROM assets WHERE id = ?1 RETURNING urn",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .ok_or_else(|| NotFoundError::AssetId(id.clone()).into())
            })
            .await
    }

    async fn delete_by_urn(&self, urn: &str) -> Result<()> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        let urn = urn.to_string();
        self.db
            .run(move |conn| {
                let deleted = conn.execute("DELETE FROM assets WHERE urn = ?1", params![urn])?;
                if deleted == 0 {
                    return Err(NotFoundError::Urn(urn).into());
                }
                Ok(())
            })
            .await
    }

    async fn soft_delete_by_id(
        &self,
        executed_at: DateTime<Utc>,
        id: &str,
        updated_by: &str,
    ) -> Result<(String, String)> {
        ensure_uuid(id)?;
        let (id, updated_by) = (id.to_string(), updated_by.to_string());
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let asset = select_asset(&tx, "id = ?1", &id)?
                    .ok_or_else(|| NotFoundError::AssetId(id.clone()))?;
                let deleted = soft_delete_in_tx(&tx, asset, executed_at, &updated_by)?;
                tx.commit()?;
                Ok((deleted.urn, deleted.version))
            })
            .await
    }

    async fn soft_delete_by_urn(
        &self,
        executed_at: DateTime<Utc>,
        urn: &str,
        updated_by: &str,
    ) -> Result<String> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        let (urn, updated_by) = (urn.to_string(), updated_by.to_string());
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let asset = select_asset(&tx, "urn = ?1", &urn)?
                    .ok_or_else(|| NotFoundError::Urn(urn.clone()))?;
                let deleted = soft_delete_in_tx(&tx, asset, executed_at, &updated_by)?;
                tx.commit()?;
                Ok(deleted.version)
            })
            .await
    }

    async fn delete_by_query_expr(&self, expr: &QueryExpr) -> Result<Vec<String>> {
        let sql = expr.to_sql()?;
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let urns = {
                    let mut stmt = tx.prepare(&format!("DELETE FROM assets WHERE {sql} RETURNING urn"))?;
                    let urns = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    urns
                };
                tx.commit()?;
                Ok(urns)
            })
            .await
    }

    async fn soft_delete_by_query_expr(
        &self,
        executed_at: DateTime<Utc>,
        updated_by: &str,
        expr: &QueryExpr,
    ) -> Result<Vec<Asset>> {
        let sql = expr.to_sql()?;
        let updated_by = updated_by.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let matches = {
                    let mut stmt = tx.prepare(&format!(
                        "{ASSET_SELECT} WHERE ({sql}) AND is_deleted = 0"
                    ))?;
                    let assets = stmt
                        .query_map([], asset_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    assets
                };
                let mut deleted = Vec::with_capacity(matches.len());
                for asset in matches {
                    deleted.push(soft_delete_in_tx(&tx, asset, executed_at, &updated_by)?);
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    async fn delete_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let (condition, values) = stale_conditions(is_deleted, services, threshold)?;
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let urns = {
                    let mut stmt =
                        tx.prepare(&format!("DELETE FROM assets WHERE {condition} RETURNING urn"))?;
                    let urns = stmt
                        .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    urns
                };
                tx.commit()?;
                Ok(urns)
            })
            .await
    }

    async fn add_probe(&self, urn: &str, probe: &Probe) -> Result<Probe> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        let now = Utc::now();
        if !probe.id.is_empty() && uuid::Uuid::parse_str(&probe.id).is_err() {
            return Err(InvalidError::Field {
                field: "probe id".to_string(),
                message: format!("{:?} is not a valid UUID", probe.id),
            }
            .into());
        }
        let mut stored = probe.clone();
        stored.asset_urn = urn.to_string();
        if stored.id.is_empty() {
            stored.id = uuid::Uuid::new_v4().to_string();
        }
        stored.created_at = Some(now);
        stored.timestamp = Some(stored.timestamp.unwrap_or(now));

        self.db
            .run(move |conn| {
                let metadata = stored
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                conn.execute(
                    &format!("INSERT INTO asset_probes ({PROBE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                    params![
                        stored.id,
                        stored.asset_urn,
                        stored.status,
                        stored.status_reason,
                        metadata,
                        stored.timestamp.as_ref().map(format_ts),
                        format_ts(&now),
                    ],
                )
                .map_err(|e| {
                    if is_foreign_key_violation(&e) {
                        CompassError::from(NotFoundError::Urn(stored.asset_urn.clone()))
                    } else if is_unique_violation(&e) {
                        CompassError::ProbeExists {
                            id: stored.id.clone(),
                        }
                    } else {
                        e.into()
                    }
                })?;
                Ok(stored)
            })
            .await
    }

    async fn get_probes(&self, urn: &str) -> Result<Vec<Probe>> {
        let urn = urn.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {PROBE_COLUMNS} FROM asset_probes WHERE asset_urn = ?1
                     ORDER BY timestamp ASC, created_at ASC"
                ))?;
                let probes = stmt
                    .query_map(params![urn], probe_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(probes)
            })
            .await
    }

    async fn get_probes_with_filter(
        &self,
        filter: &ProbesFilter,
    ) -> Result<BTreeMap<String, Vec<Probe>>> {
        let mut conditions = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if !filter.asset_urns.is_empty() {
            conditions.push(format!("asset_urn IN ({})", placeholders(filter.asset_urns.len())));
            values.extend(filter.asset_urns.iter().cloned().map(SqlValue::Text));
        }
        if let Some(newer_than) = filter.newer_than {
            conditions.push("timestamp > ?".to_string());
            values.push(SqlValue::Text(format_ts(&newer_than)));
        }
        if let Some(older_than) = filter.older_than {
            conditions.push("timestamp < ?".to_string());
            values.push(SqlValue::Text(format_ts(&older_than)));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let max_rows = filter.max_rows as i64;
        values.push(SqlValue::Integer(max_rows));
        values.push(SqlValue::Integer(max_rows));

        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROBE_COLUMNS} FROM (
                         SELECT {PROBE_COLUMNS}, ROW_NUMBER() OVER (
                             PARTITION BY asset_urn ORDER BY timestamp DESC, created_at DESC
                         ) AS rank
                         FROM asset_probes {where_clause}
                     )
                     WHERE (? = 0 OR rank <= ?)
                     ORDER BY asset_urn, timestamp DESC, created_at DESC"
                ))?;
                let probes = stmt
                    .query_map(params_from_iter(values.iter()), probe_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let mut grouped: BTreeMap<String, Vec<Probe>> = BTreeMap::new();
                for probe in probes {
                    grouped.entry(probe.asset_urn.clone()).or_default().push(probe);
                }
                Ok(grouped)
            })
            .await
    }
}
