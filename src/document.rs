//! Canonical document state owned by the Reconciliation Engine.
//!
//! A `Document` is the row the Relational Store persists: the current
//! text, its monotonic version, and the Shared Log offset the
//! Reconciler last consumed for this document (used to resume
//! `XREADGROUP` at the right place after a restart). `OperationalTransform`
//! is the append-only audit row written alongside every accepted edit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::Delta;

/// Canonical state of one collaboratively-edited document.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Document {
    /// Document identifier
    pub id: Uuid,
    /// Display title
    pub title: String,
    /// Current text content
    pub data: String,
    /// Monotonically increasing version, bumped on every accepted operation
    pub version: i64,
    /// Timestamp of the last accepted operation
    pub last_modified: DateTime<Utc>,
    /// Owning user
    pub owner_id: Uuid,
    /// Shared Log entry ID the Reconciler last applied for this document,
    /// used to resume `XREADGROUP` from the correct offset after a restart
    pub last_applied_stream_id: Option<String>,
}

impl Document {
    /// Start a brand-new, empty document owned by `owner_id`.
    pub fn new(title: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            data: String::new(),
            version: 0,
            last_modified: Utc::now(),
            owner_id,
            last_applied_stream_id: None,
        }
    }

    /// Apply an already-transformed delta, bumping the version and
    /// recording the Shared Log offset it was read from.
    pub fn apply(&mut self, delta: &Delta, stream_id: impl Into<String>) -> Result<(), crate::delta::OtError> {
        self.data = delta.apply(&self.data)?;
        self.version += 1;
        self.last_modified = Utc::now();
        self.last_applied_stream_id = Some(stream_id.into());
        Ok(())
    }
}

/// One accepted operation, recorded for audit and for replaying a
/// document's history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OperationalTransform {
    /// Row identifier
    pub id: Uuid,
    /// Document this operation was applied to
    pub document_id: Uuid,
    /// Author of the operation
    pub user_id: Uuid,
    /// The transformed delta, stored as JSON
    pub operation: serde_json::Value,
    /// Document version produced by applying this operation
    pub version: i64,
    /// When the operation was accepted
    pub timestamp: DateTime<Utc>,
}

impl OperationalTransform {
    /// Build an audit row from an accepted delta and the version it produced.
    pub fn new(document_id: Uuid, user_id: Uuid, delta: &Delta, version: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            user_id,
            operation: serde_json::to_value(delta).unwrap_or(serde_json::Value::Null),
            version,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_starts_empty_at_version_zero() {
        let doc = Document::new("untitled", Uuid::new_v4());
        assert_eq!(doc.version, 0);
        assert!(doc.data.is_empty());
        assert!(doc.last_applied_stream_id.is_none());
    }

    #[test]
    fn test_apply_bumps_version_and_records_stream_id() {
        let mut doc = Document::new("untitled", Uuid::new_v4());
        let delta = Delta::insert(0, "hello");
        doc.apply(&delta, "0-1").unwrap();
        assert_eq!(doc.data, "hello");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.last_applied_stream_id.as_deref(), Some("0-1"));
    }
}
