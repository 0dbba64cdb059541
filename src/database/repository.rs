//! Document and operational-transform row access, with an optimistic
//! version check on every write so a reconciler restart can never
//! silently clobber a newer version written by another instance.

use uuid::Uuid;

use crate::document::{Document, OperationalTransform};

use super::{ConnectionPool, DatabaseError, Result};

/// CRUD surface over the `documents` and `operational_transforms` tables.
pub struct DocumentRepository {
    pool: ConnectionPool,
}

impl DocumentRepository {
    /// Bind a repository to a connection pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Insert a brand-new document row.
    pub async fn create(&self, document: &Document) -> Result<()> {
        self.pool
            .execute(
                sqlx::query(
                    "INSERT INTO documents
                        (id, title, data, version, last_modified, owner_id, last_applied_stream_id)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(document.id)
                .bind(&document.title)
                .bind(&document.data)
                .bind(document.version)
                .bind(document.last_modified)
                .bind(document.owner_id)
                .bind(&document.last_applied_stream_id),
            )
            .await?;
        Ok(())
    }

    /// Fetch a document by id.
    pub async fn find(&self, id: Uuid) -> Result<Document> {
        self.pool
            .fetch_one(sqlx::query_as("SELECT * FROM documents WHERE id = $1").bind(id))
            .await
            .map_err(|_| DatabaseError::NotFound(id.to_string()))
    }

    /// Persist `document`'s current state, guarded by an optimistic
    /// check against `expected_version`: the write only lands if the
    /// row is still at that version, so a reconciler that crashed and
    /// was replaced mid-flush cannot overwrite work done by its
    /// successor.
    pub async fn save(&self, document: &Document, expected_version: i64) -> Result<()> {
        let result = self
            .pool
            .execute(
                sqlx::query(
                    "UPDATE documents
                     SET data = $1, version = $2, last_modified = $3, last_applied_stream_id = $4
                     WHERE id = $5 AND version = $6",
                )
                .bind(&document.data)
                .bind(document.version)
                .bind(document.last_modified)
                .bind(&document.last_applied_stream_id)
                .bind(document.id)
                .bind(expected_version),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::VersionConflict {
                expected: expected_version,
                actual: document.version,
            });
        }
        Ok(())
    }

    /// Append an audit row for one accepted operation.
    pub async fn record_operation(&self, op: &OperationalTransform) -> Result<()> {
        self.pool
            .execute(
                sqlx::query(
                    "INSERT INTO operational_transforms
                        (id, document_id, user_id, operation, version, timestamp)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(op.id)
                .bind(op.document_id)
                .bind(op.user_id)
                .bind(&op.operation)
                .bind(op.version)
                .bind(op.timestamp),
            )
            .await?;
        Ok(())
    }

    /// Append audit rows for a batch of accepted operations in one
    /// transaction, skipping any row whose id was already written (the
    /// Gateway's batch writer may retry a flush after a partial failure).
    pub async fn record_operations(&self, ops: &[OperationalTransform]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for op in ops {
            sqlx::query(
                "INSERT INTO operational_transforms
                    (id, document_id, user_id, operation, version, timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(op.id)
            .bind(op.document_id)
            .bind(op.user_id)
            .bind(&op.operation)
            .bind(op.version)
            .bind(op.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetch every operation recorded for `document_id` at or after
    /// `since_version`, ascending, used to replay history for a
    /// catch-up snapshot.
    pub async fn operations_since(
        &self,
        document_id: Uuid,
        since_version: i64,
    ) -> Result<Vec<OperationalTransform>> {
        self.pool
            .fetch_all(
                sqlx::query_as(
                    "SELECT * FROM operational_transforms
                     WHERE document_id = $1 AND version >= $2
                     ORDER BY version ASC",
                )
                .bind(document_id)
                .bind(since_version),
            )
            .await
    }
}
