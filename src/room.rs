//! Gateway-local room registry: one `RoomSession` per document with
//! connections from this instance, fanning out via a `tokio::sync::broadcast`
//! channel instead of a callback/event-emitter list.

use std::sync::Arc;

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::RoomEvent;

const ROOM_EVENT_CAPACITY: usize = 256;

/// A document's local fan-out channel plus the set of users this
/// instance currently has connected to it.
pub struct RoomSession {
    /// Document this session fans out events for
    pub document_id: Uuid,
    sender: broadcast::Sender<RoomEvent>,
    members: DashMap<Uuid, ()>,
    started: AtomicBool,
}

impl RoomSession {
    fn new(document_id: Uuid) -> Self {
        let (sender, _) = broadcast::channel(ROOM_EVENT_CAPACITY);
        Self {
            document_id,
            sender,
            members: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Transition this room from not-yet-started to started. Returns
    /// `true` only for the single caller that performs that transition,
    /// so the Pub/Sub bridge and the ack-stream consumer are spawned
    /// exactly once per document per Gateway instance.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Subscribe a new connection to this room's events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }

    /// Clone the underlying sender, e.g. so a Pub/Sub bridge task can
    /// re-publish remote instances' events directly into this room
    /// without an extra forwarding hop.
    pub fn sender(&self) -> broadcast::Sender<RoomEvent> {
        self.sender.clone()
    }

    /// Broadcast an event to every subscriber on this instance. A send
    /// with no active subscribers is a normal, momentary state and is
    /// not an error. Production code should route through
    /// `PubSubFabric::publish` instead of calling this directly, so
    /// local and cross-instance delivery share one path.
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.sender.send(event);
    }

    /// Record `user_id` as present on this instance for this room.
    pub fn add_member(&self, user_id: Uuid) {
        self.members.insert(user_id, ());
    }

    /// Remove `user_id`. Returns true if the room is now empty on this
    /// instance, a signal the caller can use to evict the session.
    pub fn remove_member(&self, user_id: Uuid) -> bool {
        self.members.remove(&user_id);
        self.members.is_empty()
    }

    /// Users currently connected to this room on this instance.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Lookup-or-create map of active rooms on this Gateway instance.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<Uuid, Arc<RoomSession>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `document_id`, creating it if this is the
    /// first local connection to that document.
    pub fn get_or_create(&self, document_id: Uuid) -> Arc<RoomSession> {
        self.rooms
            .entry(document_id)
            .or_insert_with(|| Arc::new(RoomSession::new(document_id)))
            .clone()
    }

    /// Drop the session for `document_id` once it has no local members.
    pub fn evict_if_empty(&self, document_id: Uuid) {
        if let Some(session) = self.rooms.get(&document_id) {
            if session.member_count() == 0 {
                drop(session);
                self.rooms.remove(&document_id);
            }
        }
    }

    /// Number of rooms with at least one local connection.
    pub fn active_room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_reuses_existing_session() {
        let registry = RoomRegistry::new();
        let doc = Uuid::new_v4();
        let a = registry.get_or_create(doc);
        let b = registry.get_or_create(doc);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_remove_member_reports_empty_room() {
        let registry = RoomRegistry::new();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        let session = registry.get_or_create(doc);
        session.add_member(user);
        assert_eq!(session.member_count(), 1);
        assert!(session.remove_member(user));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let registry = RoomRegistry::new();
        let doc = Uuid::new_v4();
        let session = registry.get_or_create(doc);
        let mut rx = session.subscribe();
        session.publish(RoomEvent::Left { user_id: Uuid::nil() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RoomEvent::Left { .. }));
    }
}
