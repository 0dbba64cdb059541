//! Reconciliation Engine: the OT authority. One `tokio::task` per
//! active document reads that document's `document-changes` stream,
//! transforms each incoming delta against everything already applied
//! since its `base_version`, applies it to the canonical text, and
//! publishes a lightweight per-op acknowledgment on `document-updates`
//! plus a full snapshot on `document-snapshots` whenever the buffer is
//! flushed. State lives entirely in the task, removing the locking a
//! shared-map design would need.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::database::{ConnectionPool, DocumentRepository};
use crate::delta::{Delta, Side};
use crate::document::Document;
use crate::error::ReconcilerError;
use crate::gateway::{DocumentSnapshot, PendingChange, ReconciliationAck};
use crate::shared_log::{SharedLog, TOPIC_DOCUMENT_CHANGES, TOPIC_DOCUMENT_SNAPSHOTS, TOPIC_DOCUMENT_UPDATES};

const STREAM_READ_COUNT: usize = 32;
const STREAM_BLOCK_MS: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Document state for one actor, plus whether it has unflushed changes.
struct ReconcilerBuffer {
    document: Document,
    dirty: bool,
    last_flush: Instant,
}

impl ReconcilerBuffer {
    fn new(document: Document) -> Self {
        Self { document, dirty: false, last_flush: Instant::now() }
    }

    fn should_flush(&self) -> bool {
        self.dirty && self.last_flush.elapsed() >= FLUSH_INTERVAL
    }
}

/// Commands a document actor accepts on its private channel.
enum ActorCommand {
    Process(PendingChange, String),
}

/// Routes document updates to a per-document actor task, spawning one
/// on first use and letting it exit after an idle period.
pub struct Reconciler {
    config: ReconcilerConfig,
    pool: ConnectionPool,
    shared_log: SharedLog,
    actors: DashMap<Uuid, mpsc::Sender<ActorCommand>>,
}

impl Reconciler {
    /// Connect to Postgres and Redis per `config`.
    pub async fn new(config: ReconcilerConfig) -> Result<Self, ReconcilerError> {
        let pool = ConnectionPool::new(config.database.pool_config.clone()).await?;
        let shared_log = SharedLog::connect(
            &config.redis.url,
            &config.redis.consumer_group,
            format!("reconciler-{}", Uuid::new_v4()),
        )
        .await?;

        Ok(Self {
            config,
            pool,
            shared_log,
            actors: DashMap::new(),
        })
    }

    /// Block forever: every tick, scan the Gateway-maintained active-document
    /// set, read each one's pending `document-changes` entries, and route
    /// them to that document's actor (spawning it on first use).
    pub async fn run(&self) -> Result<(), ReconcilerError> {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            ticker.tick().await;
            let active = self.shared_log.active_documents().await?;
            for document_id in active {
                if let Err(e) = self.poll_document(document_id).await {
                    tracing::error!("poll of {} failed: {}", document_id, e);
                }
            }
        }
    }

    async fn poll_document(&self, document_id: Uuid) -> Result<(), ReconcilerError> {
        let entries = self
            .shared_log
            .read_group::<PendingChange>(TOPIC_DOCUMENT_CHANGES, document_id, STREAM_READ_COUNT, STREAM_BLOCK_MS)
            .await?;

        if entries.is_empty() {
            self.shared_log.mark_inactive(document_id).await?;
            return Ok(());
        }

        for entry in entries {
            self.route(entry.payload, entry.id).await?;
        }
        Ok(())
    }

    /// Route one already-read change to its document's actor, spawning
    /// the actor on first use.
    pub async fn route(&self, change: PendingChange, entry_id: String) -> Result<(), ReconcilerError> {
        let sender = self.actor_for(change.document_id).await?;
        sender
            .send(ActorCommand::Process(change, entry_id))
            .await
            .map_err(|_| ReconcilerError::ActorShuttingDown(Uuid::nil()))
    }

    async fn actor_for(&self, document_id: Uuid) -> Result<mpsc::Sender<ActorCommand>, ReconcilerError> {
        if let Some(sender) = self.actors.get(&document_id) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let repository = DocumentRepository::new(self.pool.clone());
        let document = repository.find(document_id).await?;

        self.shared_log
            .ensure_group(
                TOPIC_DOCUMENT_CHANGES,
                document_id,
                document.last_applied_stream_id.as_deref().unwrap_or("0"),
            )
            .await?;

        let (tx, rx) = mpsc::channel(256);
        self.actors.insert(document_id, tx.clone());

        let shared_log = self.shared_log.clone();
        let idle_timeout = self.config.actor_idle_timeout;
        let actors = self.actors.clone();
        tokio::spawn(async move {
            run_document_actor(document, repository, shared_log, rx, idle_timeout).await;
            actors.remove(&document_id);
        });

        Ok(tx)
    }
}

async fn run_document_actor(
    document: Document,
    repository: DocumentRepository,
    shared_log: SharedLog,
    mut rx: mpsc::Receiver<ActorCommand>,
    idle_timeout: Duration,
) {
    let mut expected_version = document.version;
    let mut buffer = ReconcilerBuffer::new(document);
    let mut history: VecDeque<Delta> = VecDeque::new();
    let mut last_activity = Instant::now();
    let mut flush_ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                last_activity = Instant::now();

                let ActorCommand::Process(change, entry_id) = command;
                match apply_change(&mut buffer, &mut history, change.clone()) {
                    Ok(ack) => {
                        if let Err(e) = shared_log
                            .publish(TOPIC_DOCUMENT_UPDATES, change.document_id, &ack)
                            .await
                        {
                            tracing::error!("publish of reconciliation ack failed: {}", e);
                        }
                        if let Err(e) = shared_log
                            .ack(TOPIC_DOCUMENT_CHANGES, change.document_id, &entry_id)
                            .await
                        {
                            tracing::warn!("ack failed for {}: {}", entry_id, e);
                        }
                    }
                    Err(e) => {
                        // Per policy, a failed apply still advances the document
                        // version and acknowledges the stream entry so a single
                        // malformed edit cannot wedge the whole document.
                        tracing::warn!("apply failed for {}: {}", change.document_id, e);
                        buffer.document.version += 1;
                        buffer.dirty = true;
                        let _ = shared_log.ack(TOPIC_DOCUMENT_CHANGES, change.document_id, &entry_id).await;
                    }
                }
                buffer.document.last_applied_stream_id = Some(entry_id);
            }
            _ = flush_ticker.tick() => {
                if buffer.should_flush() {
                    if let Err(e) = flush(&repository, &mut buffer, &mut expected_version, &shared_log).await {
                        tracing::error!("flush failed for {}: {}", buffer.document.id, e);
                    }
                }
                if last_activity.elapsed() >= idle_timeout {
                    if buffer.dirty {
                        if let Err(e) = flush(&repository, &mut buffer, &mut expected_version, &shared_log).await {
                            tracing::error!("idle flush failed for {}: {}", buffer.document.id, e);
                        }
                    }
                    break;
                }
            }
        }
    }
}

fn apply_change(
    buffer: &mut ReconcilerBuffer,
    history: &mut VecDeque<Delta>,
    change: PendingChange,
) -> Result<ReconciliationAck, ReconcilerError> {
    let concurrent_count = (buffer.document.version - change.base_version).max(0) as usize;
    let mut delta = change.delta;
    for prior in history.iter().rev().take(concurrent_count) {
        delta = delta.transform(prior, Side::Right)?;
    }

    buffer.document.data = delta.apply(&buffer.document.data)?;
    buffer.document.version += 1;
    buffer.document.last_modified = chrono::Utc::now();
    buffer.dirty = true;

    history.push_back(delta.clone());
    if history.len() > 256 {
        history.pop_front();
    }

    Ok(ReconciliationAck {
        document_id: buffer.document.id,
        version: change.base_version,
        status: "synced".to_string(),
        user_id: change.user_id,
        server_version: buffer.document.version,
        timestamp: chrono::Utc::now(),
    })
}

async fn flush(
    repository: &DocumentRepository,
    buffer: &mut ReconcilerBuffer,
    expected_version: &mut i64,
    shared_log: &SharedLog,
) -> Result<(), ReconcilerError> {
    if !buffer.dirty {
        return Ok(());
    }

    repository.save(&buffer.document, *expected_version).await?;
    *expected_version = buffer.document.version;
    buffer.dirty = false;
    buffer.last_flush = Instant::now();

    let snapshot = DocumentSnapshot {
        document_id: buffer.document.id,
        data: buffer.document.data.clone(),
        version: buffer.document.version,
        timestamp: chrono::Utc::now(),
    };
    if let Err(e) = shared_log.publish(TOPIC_DOCUMENT_SNAPSHOTS, buffer.document.id, &snapshot).await {
        tracing::error!("publish of document snapshot failed: {}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_document() -> Document {
        let mut doc = Document::new("untitled", Uuid::new_v4());
        doc.data = "hello".to_string();
        doc
    }

    #[test]
    fn test_apply_change_bumps_version_and_marks_dirty() {
        let mut buffer = ReconcilerBuffer::new(fresh_document());
        let mut history = VecDeque::new();
        let change = PendingChange {
            document_id: buffer.document.id,
            user_id: Uuid::new_v4(),
            base_version: 0,
            delta: Delta::insert(5, " world"),
        };

        let ack = apply_change(&mut buffer, &mut history, change).unwrap();
        assert_eq!(ack.server_version, 1);
        assert_eq!(buffer.document.data, "hello world");
        assert!(buffer.dirty);
    }

    #[test]
    fn test_reconciler_buffer_flush_threshold() {
        let buffer = ReconcilerBuffer::new(fresh_document());
        assert!(!buffer.should_flush());
    }
}
