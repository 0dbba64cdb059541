//! # Database Migration System
//!
//! Schema migration management with version control, rollback support,
//! and a small set of built-in migrations for the documents and
//! operational-transform tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use sqlx::Row;

use super::{ConnectionPool, DatabaseError, Result};

/// Monotonically increasing migration identifier.
pub type MigrationVersion = i64;

/// A single reversible schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, ordered version number.
    fn version(&self) -> MigrationVersion;
    /// Short machine name.
    fn name(&self) -> &str;
    /// Human-readable description.
    fn description(&self) -> &str;
    /// Apply the migration.
    async fn up(&self, pool: &ConnectionPool) -> Result<()>;
    /// Reverse the migration.
    async fn down(&self, pool: &ConnectionPool) -> Result<()>;
    /// Whether `down` is implemented for this migration.
    fn is_reversible(&self) -> bool {
        true
    }
}

/// A `Migration` defined by a pair of plain SQL statements.
pub struct SqlMigration {
    version: MigrationVersion,
    name: String,
    description: String,
    up_sql: String,
    down_sql: Option<String>,
}

impl SqlMigration {
    /// Build a migration from raw up/down SQL.
    pub fn new(
        version: MigrationVersion,
        name: impl Into<String>,
        description: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            description: description.into(),
            up_sql: up_sql.into(),
            down_sql,
        }
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn version(&self) -> MigrationVersion {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn up(&self, pool: &ConnectionPool) -> Result<()> {
        pool.execute(sqlx::query(&self.up_sql))
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn down(&self, pool: &ConnectionPool) -> Result<()> {
        match &self.down_sql {
            Some(sql) => {
                pool.execute(sqlx::query(sql))
                    .await
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
                Ok(())
            }
            None => Err(DatabaseError::Migration(format!(
                "migration {} has no down script",
                self.version
            ))),
        }
    }

    fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }
}

#[derive(Debug, Clone)]
struct MigrationRecord {
    version: i64,
    name: String,
    description: String,
    applied_at: String,
    checksum: String,
}

/// Tracks and applies the registered set of migrations against a pool.
pub struct MigrationManager {
    pool: ConnectionPool,
    migrations: Arc<RwLock<HashMap<MigrationVersion, Box<dyn Migration>>>>,
    history: Arc<RwLock<Vec<MigrationRecord>>>,
}

impl MigrationManager {
    /// Build a manager bound to `pool`. Call `init` before use.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            migrations: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create the tracking table and load applied-migration history.
    pub async fn init(&self) -> Result<()> {
        self.pool
            .execute(sqlx::query(
                "CREATE TABLE IF NOT EXISTS _migrations (
                    version BIGINT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL,
                    applied_at TEXT NOT NULL,
                    checksum TEXT NOT NULL
                )",
            ))
            .await?;
        self.load_history().await
    }

    /// Register a migration definition. Does not apply it.
    pub fn register<M: Migration + 'static>(&mut self, migration: M) {
        self.migrations
            .write()
            .insert(migration.version(), Box::new(migration));
    }

    async fn load_history(&self) -> Result<()> {
        let rows = self
            .pool
            .fetch_all::<_, (i64, String, String, String, String)>(sqlx::query_as(
                "SELECT version, name, description, applied_at, checksum FROM _migrations ORDER BY version",
            ))
            .await?;

        let records = rows
            .into_iter()
            .map(
                |(version, name, description, applied_at, checksum)| MigrationRecord {
                    version,
                    name,
                    description,
                    applied_at,
                    checksum,
                },
            )
            .collect();

        *self.history.write() = records;
        Ok(())
    }

    /// Versions registered but not yet applied, in ascending order.
    pub fn pending_migrations(&self) -> Vec<MigrationVersion> {
        let applied: std::collections::HashSet<MigrationVersion> =
            self.history.read().iter().map(|r| r.version).collect();
        let mut pending: Vec<MigrationVersion> = self
            .migrations
            .read()
            .keys()
            .filter(|v| !applied.contains(v))
            .copied()
            .collect();
        pending.sort_unstable();
        pending
    }

    /// Apply every registered migration not yet recorded as applied, in order.
    pub async fn run_pending(&self) -> Result<()> {
        let pending = self.pending_migrations();
        if pending.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(());
        }
        tracing::info!("applying {} pending migration(s)", pending.len());
        for version in pending {
            self.migrate_up(version).await?;
        }
        Ok(())
    }

    /// Apply a single migration and record it in `_migrations`.
    pub async fn migrate_up(&self, version: MigrationVersion) -> Result<()> {
        let migration = {
            let migrations = self.migrations.read();
            let m = migrations
                .get(&version)
                .ok_or_else(|| DatabaseError::Migration(format!("unknown migration {version}")))?;
            (m.name().to_string(), m.description().to_string())
        };

        {
            let migrations = self.migrations.read();
            let m = migrations.get(&version).unwrap();
            m.up(&self.pool).await?;
        }

        let checksum = self.calculate_checksum(version);
        let applied_at = chrono::Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO _migrations (version, name, description, applied_at, checksum)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(version)
        .bind(&migration.0)
        .bind(&migration.1)
        .bind(&applied_at)
        .bind(&checksum)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        self.load_history().await?;
        tracing::info!(version, name = %migration.0, "applied migration");
        Ok(())
    }

    /// Reverse a single applied migration.
    pub async fn migrate_down(&self, version: MigrationVersion) -> Result<()> {
        let is_applied = self.history.read().iter().any(|r| r.version == version);
        if !is_applied {
            return Err(DatabaseError::Migration(format!(
                "migration {version} is not applied"
            )));
        }

        {
            let migrations = self.migrations.read();
            let migration = migrations
                .get(&version)
                .ok_or_else(|| DatabaseError::Migration(format!("unknown migration {version}")))?;
            if !migration.is_reversible() {
                return Err(DatabaseError::Migration(format!(
                    "migration {version} is not reversible"
                )));
            }
            migration.down(&self.pool).await?;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM _migrations WHERE version = $1")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        self.load_history().await?;
        tracing::warn!(version, "rolled back migration");
        Ok(())
    }

    /// Roll back the last `count` applied migrations, most recent first.
    pub async fn rollback(&self, count: usize) -> Result<()> {
        let mut versions: Vec<MigrationVersion> =
            self.history.read().iter().map(|r| r.version).collect();
        versions.sort_unstable();
        versions.reverse();
        for version in versions.into_iter().take(count) {
            self.migrate_down(version).await?;
        }
        Ok(())
    }

    /// Summary of applied and pending migrations.
    pub fn status(&self) -> MigrationStatus {
        let history = self.history.read();
        let applied = history.len();
        let pending_versions = self.pending_migrations();
        let pending = pending_versions.len();
        let migrations = self.migrations.read();

        let history_info = history
            .iter()
            .map(|r| MigrationInfo {
                version: r.version,
                name: r.name.clone(),
                description: r.description.clone(),
                applied_at: Some(r.applied_at.clone()),
                is_applied: true,
            })
            .collect();

        let pending_info = pending_versions
            .iter()
            .filter_map(|v| {
                migrations.get(v).map(|m| MigrationInfo {
                    version: *v,
                    name: m.name().to_string(),
                    description: m.description().to_string(),
                    applied_at: None,
                    is_applied: false,
                })
            })
            .collect();

        MigrationStatus {
            total: applied + pending,
            applied,
            pending,
            history: history_info,
            pending_migrations: pending_info,
        }
    }

    fn calculate_checksum(&self, version: MigrationVersion) -> String {
        let mut hasher = Sha256::new();
        hasher.update(version.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Roll back every applied migration. Destructive; intended for test setup.
    pub async fn reset(&self) -> Result<()> {
        tracing::warn!("resetting all migrations");
        let count = self.history.read().len();
        self.rollback(count).await
    }
}

/// Snapshot of applied/pending migration state.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Total registered migrations
    pub total: usize,
    /// Migrations applied so far
    pub applied: usize,
    /// Migrations still pending
    pub pending: usize,
    /// Applied migration history, oldest first
    pub history: Vec<MigrationInfo>,
    /// Pending migrations, ascending by version
    pub pending_migrations: Vec<MigrationInfo>,
}

/// Display-friendly view of one migration's state.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    /// Version number
    pub version: MigrationVersion,
    /// Short name
    pub name: String,
    /// Description
    pub description: String,
    /// Timestamp applied, if applied
    pub applied_at: Option<String>,
    /// Whether it has been applied
    pub is_applied: bool,
}

/// Register the built-in migrations defining the `documents` and
/// `operational_transforms` tables.
pub fn register_default_migrations(manager: &mut MigrationManager) {
    manager.register(SqlMigration::new(
        20260101000001,
        "create_documents_table",
        "Canonical per-document state owned by the Reconciliation Engine",
        "CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            data JSONB NOT NULL,
            version BIGINT NOT NULL DEFAULT 0,
            last_modified TIMESTAMPTZ NOT NULL DEFAULT now(),
            owner_id UUID NOT NULL,
            last_applied_stream_id TEXT
        )",
        Some("DROP TABLE IF EXISTS documents".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000002,
        "create_operational_transforms_table",
        "Append-only log of accepted operations, one row per accepted edit",
        "CREATE TABLE IF NOT EXISTS operational_transforms (
            id UUID PRIMARY KEY,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            user_id UUID NOT NULL,
            operation JSONB NOT NULL,
            version BIGINT NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        Some("DROP TABLE IF EXISTS operational_transforms".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000003,
        "create_operational_transforms_document_version_index",
        "Ordered lookup of a document's operation history by version",
        "CREATE INDEX IF NOT EXISTS idx_ot_document_version
         ON operational_transforms (document_id, version)",
        Some("DROP INDEX IF EXISTS idx_ot_document_version".to_string()),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_migration_not_reversible_without_down() {
        let m = SqlMigration::new(1, "test", "test migration", "SELECT 1", None);
        assert!(!m.is_reversible());
    }

    #[test]
    fn test_sql_migration_reversible_with_down() {
        let m = SqlMigration::new(
            1,
            "test",
            "test migration",
            "SELECT 1",
            Some("SELECT 1".to_string()),
        );
        assert!(m.is_reversible());
    }
}
