// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{Bundle, BundleSummary, CheckpointStore, OwnerFilter, ProcessFilter, check_version};
use crate::error::CoreError;
use crate::migrations;
use crate::process::ProcessId;

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    process_id: String,
    version: i64,
    process_type: String,
    state: String,
    owner: Option<String>,
    parent_id: Option<String>,
    saved_at: DateTime<Utc>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<BundleSummary, CoreError> {
        Ok(BundleSummary {
            process_id: self.process_id.parse()?,
            process_type: self.process_type,
            state: self.state.parse()?,
            version: u64::try_from(self.version)
                .map_err(|_| CoreError::database("list", "negative version"))?,
            owner: self.owner,
            parent: self.parent_id.as_deref().map(str::parse).transpose()?,
            saved_at: self.saved_at,
        })
    }
}

/// Append-only checkpoint log in SQLite.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and apply migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CoreError::database(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        Self::migrated(pool).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::database("connect", e))?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, CoreError> {
        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::database("migrate", format!("Failed to run migrations: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_i64(version: u64) -> Result<i64, CoreError> {
    i64::try_from(version).map_err(|_| CoreError::validation("version", "out of range"))
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(
        &self,
        process_id: &ProcessId,
        version: u64,
        bundle: &Bundle,
    ) -> Result<(), CoreError> {
        check_version(process_id, version, bundle)?;
        let id = process_id.to_string();
        let version_i = to_i64(version)?;
        let payload = serde_json::to_string(bundle)?;

        // Single statement: the existence check and the insert are atomic.
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints
                (process_id, version, process_type, state, owner, parent_id, bundle, saved_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM checkpoints WHERE process_id = ? AND version >= ?
            )
            "#,
        )
        .bind(&id)
        .bind(version_i)
        .bind(&bundle.process.process_type)
        .bind(bundle.process.state.as_str())
        .bind(bundle.owner.as_deref())
        .bind(bundle.process.parent.map(|p| p.to_string()))
        .bind(&payload)
        .bind(bundle.saved_at)
        .bind(&id)
        .bind(version_i)
        .execute(&self.pool)
        .await;

        let conflict = CoreError::VersionConflict {
            process_id: id,
            version,
        };
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(conflict),
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(conflict),
            Err(e) => Err(CoreError::database("save_checkpoint", e)),
        }
    }

    async fn load(&self, process_id: &ProcessId) -> Result<Bundle, CoreError> {
        let payload: Option<String> = sqlx::query_scalar(
            r#"
            SELECT bundle FROM checkpoints
            WHERE process_id = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(process_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::database("load_checkpoint", e))?;

        let payload = payload.ok_or_else(|| CoreError::not_found(process_id))?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn list(&self, filter: &ProcessFilter) -> Result<Vec<BundleSummary>, CoreError> {
        let owner = match &filter.owner {
            OwnerFilter::Any => None,
            OwnerFilter::OwnedByOrUnowned(runner) => Some(runner.as_str()),
        };
        let limit = match filter.limit {
            Some(l) => i64::try_from(l).unwrap_or(i64::MAX),
            None => -1,
        };

        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT c.process_id, c.version, c.process_type, c.state,
                   c.owner, c.parent_id, c.saved_at
            FROM checkpoints c
            JOIN (
                SELECT process_id, MAX(version) AS version
                FROM checkpoints
                GROUP BY process_id
            ) latest ON latest.process_id = c.process_id AND latest.version = c.version
            WHERE (? = 0 OR c.state NOT IN ('finished', 'excepted', 'killed'))
              AND (? IS NULL OR c.process_type = ?)
              AND (? IS NULL OR c.parent_id = ?)
              AND (? IS NULL OR c.owner IS NULL OR c.owner = ?)
            ORDER BY c.saved_at ASC, c.process_id ASC
            LIMIT ?
            "#,
        )
        .bind(filter.active_only)
        .bind(filter.process_type.as_deref())
        .bind(filter.process_type.as_deref())
        .bind(filter.parent.map(|p| p.to_string()))
        .bind(filter.parent.map(|p| p.to_string()))
        .bind(owner)
        .bind(owner)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::database("list_checkpoints", e))?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    async fn history(&self, process_id: &ProcessId) -> Result<Vec<u64>, CoreError> {
        let versions: Vec<i64> = sqlx::query_scalar(
            "SELECT version FROM checkpoints WHERE process_id = ? ORDER BY version ASC",
        )
        .bind(process_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::database("checkpoint_history", e))?;

        Ok(versions.into_iter().map(|v| v.max(0) as u64).collect())
    }

    async fn prune(&self, process_id: &ProcessId, keep: usize) -> Result<u64, CoreError> {
        let id = process_id.to_string();
        let keep = i64::try_from(keep.max(1)).unwrap_or(i64::MAX);
        let done = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE process_id = ?
              AND version NOT IN (
                  SELECT version FROM checkpoints
                  WHERE process_id = ?
                  ORDER BY version DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(&id)
        .bind(&id)
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("prune_checkpoints", e))?;

        Ok(done.rows_affected())
    }
}
