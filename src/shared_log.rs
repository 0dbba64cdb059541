//! Shared Log: one Redis Stream per (topic, document) pair, read through
//! a consumer group so the Reconciliation Engine can resume exactly
//! where it left off after a restart.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Raw client edits, Gateway to Reconciliation Engine.
pub const TOPIC_DOCUMENT_CHANGES: &str = "document-changes";
/// Lightweight per-op reconciliation acknowledgments, Reconciliation
/// Engine back to Gateway.
pub const TOPIC_DOCUMENT_UPDATES: &str = "document-updates";
/// Full-document snapshots published on every dirty-buffer flush,
/// Reconciliation Engine to Snapshot Archiver.
pub const TOPIC_DOCUMENT_SNAPSHOTS: &str = "document-snapshots";
/// External document-service events (creation, deletion, collaborator
/// changes) — not reconciled edits.
pub const TOPIC_DOCUMENT_EVENTS: &str = "document-events";

const DLQ_KEY: &str = "stream:dlq";

/// A single message read back off a stream, with its entry id.
#[derive(Debug, Clone)]
pub struct StreamEntry<T> {
    /// Redis stream entry id, e.g. `"1627842323123-0"`
    pub id: String,
    /// Deserialized payload
    pub payload: T,
}

/// A stream entry that failed deserialization, recorded so the
/// original message is never silently lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the malformed entry was read from
    pub original_topic: String,
    /// The raw, undeserializable payload
    pub original_message: String,
    /// Deserialization error message
    pub error: String,
    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
    /// Consumer that observed the failure
    pub instance: String,
}

/// Append-only, consumer-group-backed log, partitioned by document id.
#[derive(Clone)]
pub struct SharedLog {
    conn: ConnectionManager,
    consumer_group: String,
    consumer_name: String,
}

fn stream_key(topic: &str, document_id: Uuid) -> String {
    format!("stream:{topic}:{document_id}")
}

impl SharedLog {
    /// Connect to Redis at `url`, identifying this consumer as `consumer_name`
    /// within `consumer_group`.
    pub async fn connect(
        url: &str,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            consumer_group: consumer_group.into(),
            consumer_name: consumer_name.into(),
        })
    }

    /// Append `payload` to `topic`'s stream for `document_id`.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        document_id: Uuid,
        payload: &T,
    ) -> redis::RedisResult<String> {
        let key = stream_key(topic, document_id);
        let body = serde_json::to_string(payload)
            .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string())))?;
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("*")
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    /// Append a `DeadLetter` onto the fixed, non-document-partitioned
    /// `dlq` stream.
    pub async fn publish_dead_letter(
        &self,
        original_topic: &str,
        original_message: &str,
        error: &str,
    ) -> redis::RedisResult<()> {
        let letter = DeadLetter {
            original_topic: original_topic.to_string(),
            original_message: original_message.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
            instance: self.consumer_name.clone(),
        };
        let body = serde_json::to_string(&letter)
            .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string())))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(DLQ_KEY)
            .arg("*")
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Ensure the consumer group exists for `topic`/`document_id`, creating
    /// the stream if necessary. `start_id` is `"0"` for a fresh group or the
    /// document's `last_applied_stream_id` to resume from after a restart.
    pub async fn ensure_group(
        &self,
        topic: &str,
        document_id: Uuid,
        start_id: &str,
    ) -> redis::RedisResult<()> {
        let key = stream_key(topic, document_id);
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&key)
            .arg(&self.consumer_group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block up to `block_ms` milliseconds for up to `count` new entries on
    /// `topic`/`document_id`, reading as this consumer within the group.
    /// Entries whose payload fails to deserialize as `T` are routed to the
    /// dead-letter stream and acked immediately, so a single malformed
    /// message can never wedge the consumer group's pending-entries list.
    pub async fn read_group<T: DeserializeOwned>(
        &self,
        topic: &str,
        document_id: Uuid,
        count: usize,
        block_ms: usize,
    ) -> redis::RedisResult<Vec<StreamEntry<T>>> {
        let key = stream_key(topic, document_id);
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&key)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let raw_entries = extract_raw_entries(reply)?;
        let mut out = Vec::with_capacity(raw_entries.len());
        for (id, raw) in raw_entries {
            match serde_json::from_str::<T>(&raw) {
                Ok(payload) => out.push(StreamEntry { id, payload }),
                Err(e) => {
                    tracing::warn!(topic, entry_id = %id, error = %e, "dropping malformed stream entry to dlq");
                    if let Err(dlq_err) = self.publish_dead_letter(topic, &raw, &e.to_string()).await {
                        tracing::error!(topic, entry_id = %id, error = %dlq_err, "failed to publish dead letter");
                    }
                    if let Err(ack_err) = self.ack(topic, document_id, &id).await {
                        tracing::error!(topic, entry_id = %id, error = %ack_err, "failed to ack malformed entry");
                    }
                }
            }
        }
        Ok(out)
    }

    /// Acknowledge `entry_id` on `topic`/`document_id` so it is not
    /// redelivered on the next `read_group`/XPENDING scan.
    pub async fn ack(&self, topic: &str, document_id: Uuid, entry_id: &str) -> redis::RedisResult<()> {
        let key = stream_key(topic, document_id);
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&key)
            .arg(&self.consumer_group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Mark `document_id` as having pending work, so the Reconciliation
    /// Engine's poll loop knows to read its stream. The Gateway calls
    /// this every time it publishes a `document-changes` entry.
    pub async fn mark_active(&self, document_id: Uuid) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd("active-documents", document_id.to_string()).await?;
        Ok(())
    }

    /// The current set of documents with at least one pending update
    /// since they were last marked inactive.
    pub async fn active_documents(&self) -> redis::RedisResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers("active-documents").await?;
        Ok(raw.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    /// Drop `document_id` from the active set once its actor has caught
    /// up and is about to idle out.
    pub async fn mark_inactive(&self, document_id: Uuid) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem("active-documents", document_id.to_string()).await?;
        Ok(())
    }
}

/// Pull `(entry_id, raw_payload_json)` pairs out of an `XREADGROUP`
/// reply, with no attempt at deserializing the payload.
fn extract_raw_entries(reply: redis::Value) -> redis::RedisResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    let streams: Vec<(String, Vec<(String, Vec<(String, String)>)>)> =
        redis::FromRedisValue::from_redis_value(&reply).unwrap_or_default();

    for (_stream_name, entries) in streams {
        for (id, fields) in entries {
            let payload_field = fields.into_iter().find(|(k, _)| k == "payload").map(|(_, v)| v);
            if let Some(raw) = payload_field {
                out.push((id, raw));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_partitions_by_topic_and_document() {
        let doc = Uuid::nil();
        assert_eq!(stream_key(TOPIC_DOCUMENT_CHANGES, doc), format!("stream:document-changes:{doc}"));
        assert_ne!(stream_key(TOPIC_DOCUMENT_CHANGES, doc), stream_key(TOPIC_DOCUMENT_UPDATES, doc));
        assert_ne!(stream_key(TOPIC_DOCUMENT_UPDATES, doc), stream_key(TOPIC_DOCUMENT_SNAPSHOTS, doc));
    }

    #[test]
    fn test_extract_raw_entries_pulls_payload_field() {
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            redis::Value::Data(b"stream:document-changes:doc".to_vec()),
            redis::Value::Bulk(vec![redis::Value::Bulk(vec![
                redis::Value::Data(b"1-0".to_vec()),
                redis::Value::Bulk(vec![
                    redis::Value::Data(b"payload".to_vec()),
                    redis::Value::Data(b"{}".to_vec()),
                ]),
            ])]),
        ])]);
        let entries = extract_raw_entries(reply).unwrap();
        assert_eq!(entries, vec![("1-0".to_string(), "{}".to_string())]);
    }
}
