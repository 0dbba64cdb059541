//! # Collaborative Editing Backend
//!
//! A horizontally-scalable backend for a real-time collaborative text
//! editor, split into four cooperating services that each run as their
//! own binary and scale independently:
//!
//! - [`gateway`] — the Collaboration Gateway: stateful websocket
//!   sessions, room fan-out, and the client-facing wire protocol.
//! - [`reconciler`] — the Reconciliation Engine: the operational
//!   transform authority producing canonical, versioned document state.
//! - [`presence`] — the Presence Tracker: a soft-state, TTL-backed
//!   registry of who is active in which document.
//! - [`archiver`] — the Snapshot Archiver: periodic full-document
//!   snapshots written to an object store for fast cold recovery.
//!
//! These communicate through a Shared Log (Redis Streams) and a
//! Pub/Sub Fabric (Redis Pub/Sub), and persist canonical state in
//! PostgreSQL via [`database`].

pub mod auth;
pub mod config;
pub mod database;
pub mod delta;
pub mod document;
pub mod error;
pub mod object_store_client;
pub mod presence;
pub mod protocol;
pub mod pubsub;
pub mod retry;
pub mod room;
pub mod shared_log;

pub mod archiver;
pub mod gateway;
pub mod reconciler;

/// Crate version, surfaced in health-check responses.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
