//! Snapshot Archiver: consumes full-document snapshots off
//! `document-snapshots`, written by the Reconciliation Engine on every
//! dirty-buffer flush, and writes each one to the object store, so cold
//! documents can be restored without replaying the entire operation
//! history and the Relational Store isn't the system's only durability
//! layer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use bytes::Bytes;
use object_store::ObjectStore;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ArchiverConfig;
use crate::database::{ConnectionPool, DocumentRepository};
use crate::error::ArchiverError;
use crate::gateway::DocumentSnapshot;
use crate::object_store_client::SnapshotArchive;
use crate::shared_log::{SharedLog, TOPIC_DOCUMENT_SNAPSHOTS};

/// Shared state for the Archiver's background consumer and HTTP API.
#[derive(Clone)]
pub struct ArchiverState {
    archive: Arc<SnapshotArchive>,
    shared_log: SharedLog,
}

impl ArchiverState {
    /// Wire up dependencies for an Archiver instance.
    pub async fn new(
        config: &ArchiverConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ArchiverError> {
        // The HTTP surface is read-only against the object store; kept here
        // only to validate the database config is reachable at startup.
        let pool = ConnectionPool::new(config.database.pool_config.clone()).await?;
        let _documents = DocumentRepository::new(pool);
        let archive = Arc::new(SnapshotArchive::new(store, config.object_store.clone()));
        let shared_log = SharedLog::connect(
            &config.redis.url,
            &config.redis.consumer_group,
            format!("archiver-{}", Uuid::new_v4()),
        )
        .await?;

        Ok(Self { archive, shared_log })
    }

    /// Consume `document-snapshots` for `document_id`, writing each
    /// snapshot directly to the object store with no modulo-cadence
    /// decision and no re-fetch from the Relational Store: the payload
    /// already carries the full document state at that version.
    pub async fn watch_document(&self, document_id: Uuid) -> Result<(), ArchiverError> {
        self.shared_log
            .ensure_group(TOPIC_DOCUMENT_SNAPSHOTS, document_id, "0")
            .await?;

        loop {
            let entries = self
                .shared_log
                .read_group::<DocumentSnapshot>(TOPIC_DOCUMENT_SNAPSHOTS, document_id, 32, 1000)
                .await?;

            if entries.is_empty() {
                continue;
            }

            for entry in entries {
                if let Err(e) = self.write_blob(&entry.payload).await {
                    tracing::error!(
                        "snapshot write for {} at {} failed: {}",
                        document_id,
                        entry.payload.version,
                        e
                    );
                }
                self.shared_log.ack(TOPIC_DOCUMENT_SNAPSHOTS, document_id, &entry.id).await?;
            }
        }
    }

    async fn write_blob(&self, snapshot: &DocumentSnapshot) -> Result<(), ArchiverError> {
        let body = serde_json::to_vec(snapshot)?;
        self.archive
            .put_snapshot(snapshot.document_id, snapshot.version, Bytes::from(body))
            .await?;
        tracing::info!(document_id = %snapshot.document_id, version = snapshot.version, "wrote snapshot");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    version: i64,
}

/// Build the Archiver's axum router: list versions, and mint a signed
/// read URL for one.
pub fn router(state: ArchiverState) -> Router {
    Router::new()
        .route("/documents/:document_id/snapshots", get(list_snapshots))
        .route("/documents/:document_id/snapshots/url", get(sign_snapshot_url))
        .with_state(state)
}

async fn list_snapshots(
    Path(document_id): Path<Uuid>,
    State(state): State<ArchiverState>,
) -> impl IntoResponse {
    match state.archive.list_versions(document_id).await {
        Ok(versions) => Json(versions).into_response(),
        Err(e) => {
            tracing::error!("list_versions failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn sign_snapshot_url(
    Path(document_id): Path<Uuid>,
    Query(query): Query<SnapshotQuery>,
    State(state): State<ArchiverState>,
) -> impl IntoResponse {
    let url = state.archive.sign_read_url(document_id, query.version);
    Json(serde_json::json!({ "url": url, "expires_in_secs": 300 })).into_response()
}

/// Interval between archiver sweeps over documents with no recent
/// `document-snapshots` traffic, used to catch snapshot gaps left by a
/// restart between `watch_document` calls.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_interval_is_positive() {
        assert!(SWEEP_INTERVAL > Duration::ZERO);
    }
}
