//! Wire protocol exchanged between clients and the Collaboration Gateway
//! over the websocket connection. Every message is a tagged JSON object
//! so clients can deserialize with a single `match` on `type`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::Delta;
use crate::presence::{CursorPosition, PresenceRecord, Selection};

/// A message sent from a client to the Gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Request to join a document's collaboration room
    JoinDocument {
        /// Document to join
        document_id: Uuid,
        /// Last version this client has applied, used only to decide
        /// whether a catch-up snapshot is needed; never used to reject
        /// an edit
        client_version: Option<i64>,
    },
    /// Submit a locally-applied edit for reconciliation
    SendChanges {
        /// Document being edited
        document_id: Uuid,
        /// The document version this delta was produced against
        base_version: i64,
        /// The edit itself
        delta: Delta,
    },
    /// Report a cursor or selection change
    CursorMove {
        /// Document the cursor belongs to
        document_id: Uuid,
        /// New cursor position
        cursor: CursorPosition,
        /// New selection range, if any
        selection: Option<Selection>,
    },
}

/// A message sent from the Gateway to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full document snapshot sent immediately after a successful join
    DocumentJoined {
        /// Document that was joined
        document_id: Uuid,
        /// Current text content
        data: String,
        /// Current version
        version: i64,
        /// Every user currently present in this document's room
        sessions: Vec<PresenceRecord>,
    },
    /// A peer's edit has been reconciled and should be applied locally
    ReceiveChanges {
        /// Document the edit applies to
        document_id: Uuid,
        /// The edit, already transformed against this client's pending ops
        delta: Delta,
        /// Version produced by applying this edit
        version: i64,
    },
    /// Acknowledges that this connection's own edit was reconciled
    DocumentSynced {
        /// Document that was synced
        document_id: Uuid,
        /// Version after the edit was applied
        version: i64,
    },
    /// A user joined the room
    UserJoined {
        /// Document room the user joined
        document_id: Uuid,
        /// The joining user
        user_id: Uuid,
        /// Display name, if known
        name: Option<String>,
    },
    /// A user left the room
    UserLeft {
        /// Document room the user left
        document_id: Uuid,
        /// The departing user
        user_id: Uuid,
    },
    /// A peer's cursor or selection changed
    CursorUpdate {
        /// Document the cursor belongs to
        document_id: Uuid,
        /// The user whose cursor moved
        user_id: Uuid,
        /// New cursor position
        cursor: CursorPosition,
        /// New selection range, if any
        selection: Option<Selection>,
    },
    /// The document changed due to an external writer (e.g. a REST API
    /// edit bypassing the Gateway), not a reconciled client edit
    DocumentExternalUpdate {
        /// Document that changed
        document_id: Uuid,
        /// New version
        version: i64,
    },
    /// A request could not be processed
    Error {
        /// Document the error relates to, if any
        document_id: Option<Uuid>,
        /// Human-readable message
        message: String,
    },
}

/// Events broadcast within a single Gateway instance's in-process
/// per-room channel, the typed replacement for a callback/event-emitter
/// fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomEvent {
    /// A client's raw, pre-reconciliation edit, broadcast to the rest of
    /// the room immediately on receipt (an optimistic local echo) rather
    /// than after the Reconciliation Engine has applied it
    Changes {
        /// User who authored the edit
        author_id: Uuid,
        /// The edit, exactly as submitted
        delta: Delta,
        /// The client-declared base version the edit was produced
        /// against, not a post-apply server version
        version: i64,
    },
    /// The Reconciliation Engine has durably applied a previously
    /// broadcast edit; delivered only to its author as `document-synced`
    Synced {
        /// Author of the now-reconciled edit
        user_id: Uuid,
        /// Version the document reached after applying it
        version: i64,
    },
    /// A cursor/selection update to fan out to the rest of the room
    Cursor {
        /// User whose cursor moved
        user_id: Uuid,
        /// New cursor position
        cursor: CursorPosition,
        /// New selection range, if any
        selection: Option<Selection>,
    },
    /// A participant joined
    Joined {
        /// Joining user
        user_id: Uuid,
        /// Display name, if known
        name: Option<String>,
    },
    /// A participant left
    Left {
        /// Departing user
        user_id: Uuid,
    },
    /// The document changed outside the reconciled-edit path
    ExternalUpdate {
        /// Version after the external change
        version: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_round_trips_through_json() {
        let msg = ClientMessage::CursorMove {
            document_id: Uuid::nil(),
            cursor: CursorPosition { offset: 3 },
            selection: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"cursor-move\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::CursorMove { cursor, .. } => assert_eq!(cursor.offset, 3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_server_message_error_tag() {
        let msg = ServerMessage::Error {
            document_id: None,
            message: "bad request".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
    }
}
