//! Collaboration Gateway: the stateful session/room layer clients
//! connect to over websocket. Accepts edits, optimistically echoes them
//! to the rest of the room, hands them to the Reconciliation Engine
//! (via the Shared Log) for durable ordering, and relays the
//! Reconciler's per-op acknowledgment back to the originating client.
//! Room fan-out crosses Gateway instances via the Pub/Sub Fabric.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::JwtManager;
use crate::config::GatewayConfig;
use crate::database::{ConnectionPool, DocumentRepository};
use crate::document::OperationalTransform;
use crate::error::GatewayError;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMessage, RoomEvent, ServerMessage};
use crate::pubsub::PubSubFabric;
use crate::room::{RoomRegistry, RoomSession};
use crate::shared_log::{
    SharedLog, TOPIC_DOCUMENT_CHANGES, TOPIC_DOCUMENT_UPDATES,
};

/// One edit submitted by a client, awaiting reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    /// Document being edited
    pub document_id: Uuid,
    /// Author of the edit
    pub user_id: Uuid,
    /// Version this delta was produced against
    pub base_version: i64,
    /// The edit itself
    pub delta: crate::delta::Delta,
}

/// Lightweight per-op acknowledgment published by the Reconciliation
/// Engine once it has durably applied an edit. Carries no delta: peers
/// already received the raw edit via the Gateway's optimistic echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationAck {
    /// Document that was reconciled
    pub document_id: Uuid,
    /// Base version the original edit was produced against
    pub version: i64,
    /// Always `"synced"`; reserved for future rejection states
    pub status: String,
    /// Author of the reconciled edit
    pub user_id: Uuid,
    /// Version the document reached after applying it
    pub server_version: i64,
    /// When the acknowledgment was produced
    pub timestamp: DateTime<Utc>,
}

/// Full-document snapshot published by the Reconciliation Engine on
/// every dirty-buffer flush, consumed by the Snapshot Archiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Document the snapshot is for
    pub document_id: Uuid,
    /// Full text content at `version`
    pub data: String,
    /// Version this snapshot was taken at
    pub version: i64,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

/// Buffers raw, pre-reconciliation operations accepted by this Gateway
/// instance and flushes them to the Relational Store in bulk, so a
/// busy document doesn't cost one round trip per keystroke. Never
/// gates the client's optimistic echo or its eventual `document-synced`.
pub struct OtBatchWriter {
    buffer: Mutex<VecDeque<OperationalTransform>>,
    repository: Arc<DocumentRepository>,
    batch_size: usize,
}

impl OtBatchWriter {
    fn new(repository: Arc<DocumentRepository>, batch_size: usize) -> Self {
        Self { buffer: Mutex::new(VecDeque::new()), repository, batch_size }
    }

    /// Enqueue `op`. Returns `true` once the buffer has crossed
    /// `batch_size`, a hint the caller should trigger an immediate flush.
    fn push(&self, op: OperationalTransform) -> bool {
        let mut buffer = self.buffer.lock();
        buffer.push_back(op);
        buffer.len() >= self.batch_size
    }

    /// Drain the buffer and bulk-insert it into the Relational Store.
    pub async fn flush(&self) {
        let ops: Vec<OperationalTransform> = {
            let mut buffer = self.buffer.lock();
            buffer.drain(..).collect()
        };
        if ops.is_empty() {
            return;
        }
        if let Err(e) = self.repository.record_operations(&ops).await {
            tracing::error!("ot batch flush failed: {}", e);
        }
    }

    /// Spawn a background task that flushes on a fixed cadence,
    /// independent of whether the batch-size threshold was crossed.
    fn spawn_flush_loop(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        });
    }
}

/// Shared state handed to every websocket connection handler.
#[derive(Clone)]
pub struct GatewayState {
    rooms: Arc<RoomRegistry>,
    shared_log: SharedLog,
    pubsub: PubSubFabric,
    jwt: Arc<JwtManager>,
    documents: Arc<DocumentRepository>,
    presence: Arc<PresenceTracker>,
    ot_batch: Arc<OtBatchWriter>,
    publish_retry: Arc<crate::retry::RetryPolicy>,
}

impl GatewayState {
    /// Wire up all dependencies for a Gateway instance.
    pub async fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let pool = ConnectionPool::new(config.database.pool_config.clone()).await?;
        let documents = Arc::new(DocumentRepository::new(pool));

        let shared_log = SharedLog::connect(
            &config.redis.url,
            &config.redis.consumer_group,
            format!("gateway-{}", Uuid::new_v4()),
        )
        .await?;
        let pubsub = PubSubFabric::connect(&config.redis.url).await?;
        let jwt = Arc::new(JwtManager::new(config.jwt.clone()));
        let presence = Arc::new(PresenceTracker::connect(&config.redis.url, config.presence_ttl.as_secs()).await?);

        let ot_batch = Arc::new(OtBatchWriter::new(documents.clone(), config.flush_batch_size));
        ot_batch.clone().spawn_flush_loop(config.flush_interval);

        Ok(Self {
            rooms: Arc::new(RoomRegistry::new()),
            shared_log,
            pubsub,
            jwt,
            documents,
            presence,
            ot_batch,
            publish_retry: Arc::new(crate::retry::RetryPolicy::new(crate::retry::RetryConfig::default())),
        })
    }

    /// The single chosen fan-out path for room events: always a Redis
    /// publish, so local delivery (via `bridge_into`) and cross-instance
    /// delivery share one code path and a room is never delivered to
    /// twice.
    async fn publish_room_event(&self, document_id: Uuid, event: RoomEvent) -> Result<(), GatewayError> {
        self.pubsub
            .publish(&format!("room:{document_id}"), &event)
            .await
            .map_err(Into::into)
    }

    /// Bridge a document's room channel to the Pub/Sub Fabric so events
    /// published by other Gateway instances reach this instance's local
    /// subscribers. Idempotent per `RoomSession` via `mark_started`.
    fn bridge_room(&self, document_id: Uuid, room: &Arc<RoomSession>) {
        let channel = format!("room:{document_id}");
        self.pubsub.bridge_into::<RoomEvent>(channel, room.sender());
    }

    /// Spawn the per-document consumer of the Reconciliation Engine's
    /// ack stream, translating each entry into a `RoomEvent::Synced` so
    /// the originating client receives `document-synced`. Exits once
    /// the room has no more local members.
    fn spawn_ack_consumer(&self, document_id: Uuid, room: Arc<RoomSession>) {
        let shared_log = self.shared_log.clone();
        let state = self.clone();
        tokio::spawn(async move {
            if let Err(e) = shared_log.ensure_group(TOPIC_DOCUMENT_UPDATES, document_id, "0").await {
                tracing::error!("ensure_group for acks on {} failed: {}", document_id, e);
                return;
            }
            while room.member_count() > 0 {
                let entries = match shared_log
                    .read_group::<ReconciliationAck>(TOPIC_DOCUMENT_UPDATES, document_id, 32, 1000)
                    .await
                {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::error!("ack read for {} failed: {}", document_id, e);
                        continue;
                    }
                };
                for entry in entries {
                    let ack = entry.payload;
                    if let Err(e) = state
                        .publish_room_event(
                            document_id,
                            RoomEvent::Synced { user_id: ack.user_id, version: ack.server_version },
                        )
                        .await
                    {
                        tracing::warn!("publish of synced event failed: {}", e);
                    }
                    if let Err(e) = shared_log.ack(TOPIC_DOCUMENT_UPDATES, document_id, &entry.id).await {
                        tracing::warn!("ack of reconciliation ack failed: {}", e);
                    }
                }
            }
        });
    }
}

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    token: String,
}

/// Build the Gateway's axum router: a single websocket upgrade endpoint.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsAuthParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    match state.jwt.verify(&params.token) {
        Ok(client) => {
            let user_id = client.user_id;
            let user_name = client.name.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, user_name))
        }
        Err(e) => {
            tracing::warn!("websocket handshake rejected: {}", e);
            axum::http::StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: GatewayState, user_id: Uuid, user_name: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(128);

    let mut current_document: Option<Uuid> = None;
    let mut room_rx: Option<tokio::sync::broadcast::Receiver<RoomEvent>> = None;

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(body) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(body)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if let Err(e) = handle_client_message(
                                    &state,
                                    user_id,
                                    user_name.clone(),
                                    msg,
                                    &mut current_document,
                                    &mut room_rx,
                                    &out_tx,
                                )
                                .await
                                {
                                    let _ = out_tx
                                        .send(ServerMessage::Error {
                                            document_id: current_document,
                                            message: e.to_string(),
                                        })
                                        .await;
                                }
                            }
                            Err(e) => {
                                let _ = out_tx
                                    .send(ServerMessage::Error {
                                        document_id: current_document,
                                        message: format!("malformed message: {e}"),
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!("websocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            event = recv_room_event(&mut room_rx) => {
                if let Some(event) = event {
                    if let Some(server_msg) = translate_room_event(user_id, current_document, event) {
                        let _ = out_tx.send(server_msg).await;
                    }
                }
            }
        }
    }

    if let Some(document_id) = current_document {
        leave_room(&state, document_id, user_id).await;
    }
    writer_task.abort();
}

async fn recv_room_event(
    room_rx: &mut Option<tokio::sync::broadcast::Receiver<RoomEvent>>,
) -> Option<RoomEvent> {
    match room_rx {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

fn translate_room_event(
    self_user_id: Uuid,
    document_id: Option<Uuid>,
    event: RoomEvent,
) -> Option<ServerMessage> {
    let document_id = document_id?;
    match event {
        RoomEvent::Changes { author_id, delta, version } if author_id != self_user_id => {
            Some(ServerMessage::ReceiveChanges { document_id, delta, version })
        }
        RoomEvent::Changes { .. } => None,
        RoomEvent::Synced { user_id, version } if user_id == self_user_id => {
            Some(ServerMessage::DocumentSynced { document_id, version })
        }
        RoomEvent::Synced { .. } => None,
        RoomEvent::Cursor { user_id, cursor, selection } if user_id != self_user_id => {
            Some(ServerMessage::CursorUpdate { document_id, user_id, cursor, selection })
        }
        RoomEvent::Cursor { .. } => None,
        RoomEvent::Joined { user_id, name } if user_id != self_user_id => {
            Some(ServerMessage::UserJoined { document_id, user_id, name })
        }
        RoomEvent::Joined { .. } => None,
        RoomEvent::Left { user_id } if user_id != self_user_id => {
            Some(ServerMessage::UserLeft { document_id, user_id })
        }
        RoomEvent::Left { .. } => None,
        RoomEvent::ExternalUpdate { version } => {
            Some(ServerMessage::DocumentExternalUpdate { document_id, version })
        }
    }
}

async fn handle_client_message(
    state: &GatewayState,
    user_id: Uuid,
    user_name: Option<String>,
    msg: ClientMessage,
    current_document: &mut Option<Uuid>,
    room_rx: &mut Option<tokio::sync::broadcast::Receiver<RoomEvent>>,
    out_tx: &mpsc::Sender<ServerMessage>,
) -> Result<(), GatewayError> {
    match msg {
        ClientMessage::JoinDocument { document_id, client_version: _ } => {
            let document = state.documents.find(document_id).await?;
            let room = state.rooms.get_or_create(document_id);
            room.add_member(user_id);
            *room_rx = Some(room.subscribe());
            *current_document = Some(document_id);

            if room.mark_started() {
                state.bridge_room(document_id, &room);
                state.spawn_ack_consumer(document_id, room.clone());
            }

            let record = crate::presence::PresenceRecord::new(user_id, document_id, user_name.clone());
            if let Err(e) = state.presence.upsert(&record).await {
                tracing::warn!("presence upsert on join failed: {}", e);
            }
            let sessions = state.presence.list(document_id).await.unwrap_or_default();

            state
                .publish_room_event(document_id, RoomEvent::Joined { user_id, name: user_name })
                .await?;

            out_tx
                .send(ServerMessage::DocumentJoined {
                    document_id,
                    data: document.data,
                    version: document.version,
                    sessions,
                })
                .await
                .ok();
            Ok(())
        }
        ClientMessage::SendChanges { document_id, base_version, delta } => {
            let change = PendingChange { document_id, user_id, base_version, delta: delta.clone() };

            let op = OperationalTransform::new(document_id, user_id, &delta, base_version);
            if state.ot_batch.push(op) {
                let ot_batch = state.ot_batch.clone();
                tokio::spawn(async move { ot_batch.flush().await });
            }

            // Echo the raw edit to the rest of the room immediately,
            // before reconciliation, so peers see it with minimal
            // latency; `document-synced` follows later via the ack
            // stream once the Reconciler has durably applied it.
            state
                .publish_room_event(
                    document_id,
                    RoomEvent::Changes { author_id: user_id, delta: change.delta.clone(), version: base_version },
                )
                .await?;

            // A transient Redis blip shouldn't surface as a dropped edit to
            // the client; retry a few times with backoff before giving up.
            state
                .publish_retry
                .run(|| state.shared_log.publish(TOPIC_DOCUMENT_CHANGES, document_id, &change))
                .await?;
            state.shared_log.mark_active(document_id).await?;
            Ok(())
        }
        ClientMessage::CursorMove { document_id, cursor, selection } => {
            state
                .publish_room_event(document_id, RoomEvent::Cursor { user_id, cursor, selection })
                .await?;

            let mut record = crate::presence::PresenceRecord::new(user_id, document_id, user_name);
            record.cursor = Some(cursor);
            record.selection = selection;
            if let Err(e) = state.presence.upsert(&record).await {
                tracing::warn!("presence upsert on cursor move failed: {}", e);
            }
            Ok(())
        }
    }
}

async fn leave_room(state: &GatewayState, document_id: Uuid, user_id: Uuid) {
    if let Err(e) = state.publish_room_event(document_id, RoomEvent::Left { user_id }).await {
        tracing::warn!("publish of left event failed: {}", e);
    }
    if let Err(e) = state.presence.remove(document_id, user_id).await {
        tracing::warn!("presence removal on leave failed: {}", e);
    }
    let room = state.rooms.get_or_create(document_id);
    if room.remove_member(user_id) {
        state.rooms.evict_if_empty(document_id);
    }
}

/// How long to wait for a graceful websocket close before dropping the
/// connection outright during shutdown.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::CursorPosition;

    #[test]
    fn test_translate_room_event_suppresses_self_echo_for_cursor() {
        let user = Uuid::new_v4();
        let event = RoomEvent::Cursor {
            user_id: user,
            cursor: CursorPosition { offset: 0 },
            selection: None,
        };
        assert!(translate_room_event(user, Some(Uuid::new_v4()), event).is_none());
    }

    #[test]
    fn test_translate_room_event_forwards_peer_changes() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let event = RoomEvent::Changes {
            author_id: other,
            delta: crate::delta::Delta::new(),
            version: 3,
        };
        let translated = translate_room_event(me, Some(Uuid::new_v4()), event);
        assert!(matches!(translated, Some(ServerMessage::ReceiveChanges { version: 3, .. })));
    }

    #[test]
    fn test_translate_room_event_suppresses_self_changes() {
        let me = Uuid::new_v4();
        let event = RoomEvent::Changes { author_id: me, delta: crate::delta::Delta::new(), version: 3 };
        assert!(translate_room_event(me, Some(Uuid::new_v4()), event).is_none());
    }

    #[test]
    fn test_translate_room_event_synced_only_for_author() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mine = RoomEvent::Synced { user_id: me, version: 5 };
        assert!(matches!(
            translate_room_event(me, Some(Uuid::new_v4()), mine),
            Some(ServerMessage::DocumentSynced { version: 5, .. })
        ));

        let theirs = RoomEvent::Synced { user_id: other, version: 5 };
        assert!(translate_room_event(me, Some(Uuid::new_v4()), theirs).is_none());
    }
}
