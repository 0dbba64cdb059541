//! Top-level error types, one variant family per binary's failure modes.

use thiserror::Error;

use crate::database::DatabaseError;
use crate::delta::OtError;

/// Errors surfaced by the Collaboration Gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Handshake authentication failed
    #[error("authentication failed: {0}")]
    Auth(#[from] crate::auth::JwtError),

    /// The requested room does not exist or has no reachable owner instance
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Malformed or unrecognized wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Shared Log or Pub/Sub Fabric unavailable
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Relational store error surfaced while flushing the dirty buffer
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the Reconciliation Engine.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// An operation could not be transformed or applied
    #[error("operational transform error: {0}")]
    Ot(#[from] OtError),

    /// Relational store error
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Shared Log error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The actor for a document was asked to do work after it began shutting down
    #[error("document actor {0} is shutting down")]
    ActorShuttingDown(uuid::Uuid),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the Presence Tracker.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Shared Redis-backed store unavailable
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the Snapshot Archiver.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// Object store read/write failure
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Shared Log error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Relational store error
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Requested snapshot does not exist
    #[error("snapshot not found: {0}")]
    NotFound(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
