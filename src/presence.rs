//! Presence Tracker: soft-state registry of who is active in which
//! document, backed by Redis key TTLs rather than in-process maps, so
//! presence survives a Gateway instance restart and is visible across
//! the whole fleet.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cursor position within a document, in character offsets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    /// Character offset from the start of the document
    pub offset: usize,
}

/// A selection range, `anchor` and `head` mirroring how most editors
/// track a drag-selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    /// Where the selection started
    pub anchor: usize,
    /// Where the selection currently ends
    pub head: usize,
}

/// A deterministic, user-stable display color, so a given user's
/// cursor renders the same color in every room they join.
fn color_for_user(user_id: Uuid) -> String {
    const PALETTE: [&str; 8] = [
        "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    ];
    let idx = (user_id.as_u128() % PALETTE.len() as u128) as usize;
    PALETTE[idx].to_string()
}

/// One user's live presence state within a single document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// The user this record describes
    pub user_id: Uuid,
    /// Document the user is present in
    pub document_id: Uuid,
    /// Display name, if known
    pub name: Option<String>,
    /// Stable per-user display color
    pub color: String,
    /// Last known cursor position
    pub cursor: Option<CursorPosition>,
    /// Last known selection range
    pub selection: Option<Selection>,
    /// When this record was last refreshed
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    /// Start a fresh record for `user_id` joining `document_id`.
    pub fn new(user_id: Uuid, document_id: Uuid, name: Option<String>) -> Self {
        Self {
            user_id,
            document_id,
            name,
            color: color_for_user(user_id),
            cursor: None,
            selection: None,
            last_seen: Utc::now(),
        }
    }
}

fn presence_key(document_id: Uuid, user_id: Uuid) -> String {
    format!("presence:{document_id}:{user_id}")
}

fn presence_index_key(document_id: Uuid) -> String {
    format!("presence-index:{document_id}")
}

/// TTL of the document's presence index sorted set, kept well above the
/// per-record TTL so the index itself never expires out from under a
/// room that is merely idle between cursor moves.
const PRESENCE_INDEX_TTL_SECS: i64 = 300;

/// Redis-backed presence registry with a fixed TTL per record.
#[derive(Clone)]
pub struct PresenceTracker {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl PresenceTracker {
    /// Connect to Redis at `url`, expiring presence records after `ttl_seconds`.
    pub async fn connect(url: &str, ttl_seconds: u64) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl_seconds })
    }

    /// Create or refresh `record`'s TTL, also touching the document's
    /// presence index so `list` can enumerate active users without a
    /// Redis `KEYS` scan.
    pub async fn upsert(&self, record: &PresenceRecord) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let key = presence_key(record.document_id, record.user_id);
        let body = serde_json::to_string(record).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string()))
        })?;

        conn.set_ex::<_, _, ()>(&key, body, self.ttl_seconds).await?;

        let index_key = presence_index_key(record.document_id);
        let score = Utc::now().timestamp() as f64;
        let _: i64 = conn
            .zadd(&index_key, record.user_id.to_string(), score)
            .await?;
        let _: bool = conn.expire(&index_key, PRESENCE_INDEX_TTL_SECS).await?;
        Ok(())
    }

    /// Remove a user's presence immediately, e.g. on a clean disconnect.
    pub async fn remove(&self, document_id: Uuid, user_id: Uuid) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(presence_key(document_id, user_id)).await?;
        let _: i64 = conn
            .zrem(presence_index_key(document_id), user_id.to_string())
            .await?;
        Ok(())
    }

    /// List every currently-live presence record for `document_id`. Index
    /// members older than the record TTL are evicted by score before the
    /// index is read, and any survivor whose underlying key has already
    /// expired anyway is pruned defensively.
    pub async fn list(&self, document_id: Uuid) -> redis::RedisResult<Vec<PresenceRecord>> {
        let mut conn = self.conn.clone();
        let index_key = presence_index_key(document_id);

        let cutoff = (Utc::now().timestamp() - self.ttl_seconds as i64) as f64;
        let _: i64 = conn.zrembyscore(&index_key, f64::NEG_INFINITY, cutoff).await?;

        let user_ids: Vec<String> = conn.zrange(&index_key, 0, -1).await?;

        let mut records = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let key = format!("presence:{document_id}:{user_id}");
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(body) => {
                    if let Ok(record) = serde_json::from_str(&body) {
                        records.push(record);
                    }
                }
                None => {
                    let _: i64 = conn.zrem(&index_key, &user_id).await?;
                }
            }
        }
        Ok(records)
    }
}

/// HTTP surface exposed to clients that prefer polling over the
/// websocket `cursor-move` event (e.g. a lightweight viewer integration).
pub mod http {
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Json;
    use axum::Router;
    use serde::Deserialize;
    use uuid::Uuid;

    use super::{PresenceRecord, PresenceTracker};

    /// Build the Presence Tracker's axum router.
    pub fn router(tracker: PresenceTracker) -> Router {
        Router::new()
            .route("/documents/:document_id/presence", get(list).post(upsert))
            .route("/documents/:document_id/presence/:user_id", axum::routing::delete(remove))
            .with_state(tracker)
    }

    async fn list(Path(document_id): Path<Uuid>, State(tracker): State<PresenceTracker>) -> impl IntoResponse {
        match tracker.list(document_id).await {
            Ok(records) => Json(records).into_response(),
            Err(e) => {
                tracing::error!("presence list failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    #[derive(Debug, Deserialize)]
    struct UpsertRequest {
        user_id: Uuid,
        name: Option<String>,
        cursor: Option<super::CursorPosition>,
        selection: Option<super::Selection>,
    }

    async fn upsert(
        Path(document_id): Path<Uuid>,
        State(tracker): State<PresenceTracker>,
        Json(body): Json<UpsertRequest>,
    ) -> impl IntoResponse {
        let mut record = PresenceRecord::new(body.user_id, document_id, body.name);
        record.cursor = body.cursor;
        record.selection = body.selection;
        match tracker.upsert(&record).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => {
                tracing::error!("presence upsert failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    async fn remove(
        Path((document_id, user_id)): Path<(Uuid, Uuid)>,
        State(tracker): State<PresenceTracker>,
    ) -> impl IntoResponse {
        match tracker.remove(document_id, user_id).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => {
                tracing::error!("presence remove failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_for_user_is_deterministic() {
        let user = Uuid::new_v4();
        assert_eq!(color_for_user(user), color_for_user(user));
    }

    #[test]
    fn test_presence_record_new_has_no_cursor_yet() {
        let record = PresenceRecord::new(Uuid::new_v4(), Uuid::new_v4(), Some("ada".into()));
        assert!(record.cursor.is_none());
        assert!(record.selection.is_none());
    }

    #[test]
    fn test_presence_key_scoped_per_document_and_user() {
        let doc = Uuid::nil();
        let user = Uuid::nil();
        assert_eq!(presence_key(doc, user), format!("presence:{doc}:{user}"));
    }
}
