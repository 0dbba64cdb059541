//! Pub/Sub Fabric: cross-instance fan-out of room events over Redis
//! Pub/Sub, bridged into each Gateway instance's local `broadcast`
//! channels so a user connected to instance A sees edits accepted on
//! instance B.

use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;

/// Publishes and subscribes to a single logical channel namespace
/// (`room:{room_id}`).
#[derive(Clone)]
pub struct PubSubFabric {
    client: redis::Client,
    publish_conn: ConnectionManager,
}

impl PubSubFabric {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let publish_conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publish_conn })
    }

    /// Publish `message` to `channel` for delivery to every other
    /// instance subscribed to it.
    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> redis::RedisResult<()> {
        let body = serde_json::to_string(message).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string()))
        })?;
        let mut conn = self.publish_conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Spawn a task that subscribes to `channel` and forwards every
    /// deserializable message onto `local`, bridging remote instances'
    /// publishes into this instance's in-process broadcast channel.
    pub fn bridge_into<T>(&self, channel: String, local: broadcast::Sender<T>)
    where
        T: DeserializeOwned + Clone + Send + 'static,
    {
        let client = self.client.clone();
        tokio::spawn(async move {
            let conn = match client.get_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("pubsub bridge connect failed: {}", e);
                    return;
                }
            };
            let mut pubsub = conn.into_pubsub();
            if let Err(e) = pubsub.subscribe(&channel).await {
                tracing::error!("pubsub subscribe failed for {}: {}", channel, e);
                return;
            }

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("pubsub payload decode failed: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<T>(&payload) {
                    Ok(value) => {
                        // No local subscribers is a normal, momentary state; ignore.
                        let _ = local.send(value);
                    }
                    Err(e) => tracing::warn!("pubsub message deserialize failed: {}", e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming_is_stable() {
        let room_id = uuid::Uuid::nil();
        let channel = format!("room:{room_id}");
        assert_eq!(channel, format!("room:{}", uuid::Uuid::nil()));
    }
}
