//! Snapshot blob storage on top of the `object_store` crate, with
//! short-lived signed read URLs minted locally via HMAC-SHA256 since
//! the generic `object_store` API has no native presigned-URL support
//! across its backends.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hmac::{Hmac, Mac};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sha2::Sha256;
use uuid::Uuid;

use crate::config::ObjectStoreSettings;

type HmacSha256 = Hmac<Sha256>;

/// Writes and reads append-only document snapshots.
pub struct SnapshotArchive {
    store: Arc<dyn ObjectStore>,
    settings: ObjectStoreSettings,
}

fn snapshot_path(prefix: &str, document_id: Uuid, version: i64) -> ObjectPath {
    ObjectPath::from(format!("{prefix}/{document_id}/{version}.json"))
}

impl SnapshotArchive {
    /// Build an archive writing under `settings.prefix` in `store`.
    pub fn new(store: Arc<dyn ObjectStore>, settings: ObjectStoreSettings) -> Self {
        Self { store, settings }
    }

    /// Write one immutable snapshot for `document_id` at `version`.
    /// Snapshots are never overwritten: each version gets its own key.
    pub async fn put_snapshot(
        &self,
        document_id: Uuid,
        version: i64,
        body: Bytes,
    ) -> object_store::Result<()> {
        let path = snapshot_path(&self.settings.prefix, document_id, version);
        self.store.put(&path, body.into()).await?;
        Ok(())
    }

    /// Read back a previously written snapshot.
    pub async fn get_snapshot(&self, document_id: Uuid, version: i64) -> object_store::Result<Bytes> {
        let path = snapshot_path(&self.settings.prefix, document_id, version);
        let result = self.store.get(&path).await?;
        Ok(result.bytes().await?)
    }

    /// List every version available for `document_id`, in storage order.
    pub async fn list_versions(&self, document_id: Uuid) -> object_store::Result<Vec<String>> {
        use futures::StreamExt;
        let prefix = ObjectPath::from(format!("{}/{}", self.settings.prefix, document_id));
        let mut stream = self.store.list(Some(&prefix));
        let mut keys = Vec::new();
        while let Some(meta) = stream.next().await {
            keys.push(meta?.location.to_string());
        }
        Ok(keys)
    }

    /// Mint a short-lived signed URL token for reading `document_id`'s
    /// snapshot at `version`, valid for `settings.signed_url_ttl`.
    pub fn sign_read_url(&self, document_id: Uuid, version: i64) -> String {
        let expires_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.settings.signed_url_ttl.as_secs();

        let payload = format!("{document_id}:{version}:{expires_at}");
        let signature = self.sign(&payload);
        format!("{payload}:{signature}")
    }

    /// Validate a token minted by `sign_read_url`, returning the
    /// document id and version if the signature is valid and the token
    /// has not expired.
    pub fn verify_read_token(&self, token: &str) -> Option<(Uuid, i64)> {
        let mut parts = token.rsplitn(2, ':');
        let signature = parts.next()?;
        let payload = parts.next()?;

        if self.sign(payload) != signature {
            return None;
        }

        let mut fields = payload.splitn(3, ':');
        let document_id: Uuid = fields.next()?.parse().ok()?;
        let version: i64 = fields.next()?.parse().ok()?;
        let expires_at: u64 = fields.next()?.parse().ok()?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > expires_at {
            return None;
        }

        Some((document_id, version))
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.settings.signing_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Lifetime a signed URL token remains valid for, surfaced for callers
/// building a Cache-Control response header.
pub fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn settings() -> ObjectStoreSettings {
        ObjectStoreSettings {
            bucket: "test".to_string(),
            prefix: "documents".to_string(),
            signing_secret: "test-secret".to_string(),
            signed_url_ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrips() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let archive = SnapshotArchive::new(store, settings());
        let doc = Uuid::new_v4();
        archive
            .put_snapshot(doc, 1, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let body = archive.get_snapshot(doc, 1).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_signed_url_round_trips() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let archive = SnapshotArchive::new(store, settings());
        let doc = Uuid::new_v4();
        let token = archive.sign_read_url(doc, 7);
        let verified = archive.verify_read_token(&token);
        assert_eq!(verified, Some((doc, 7)));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let archive = SnapshotArchive::new(store, settings());
        let doc = Uuid::new_v4();
        let mut token = archive.sign_read_url(doc, 7);
        token.push('x');
        assert!(archive.verify_read_token(&token).is_none());
    }
}
