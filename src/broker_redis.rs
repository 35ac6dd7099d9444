#[cfg(feature = "redis")]
use std::collections::HashMap;
#[cfg(feature = "redis")]
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "redis")]
use tokio::sync::Mutex;
#[cfg(feature = "redis")]
use tracing::info;

#[cfg(feature = "redis")]
use crate::broker::{
    Connection, Connector, DeliveryTag, InboundMessage, MessageProperties, OutboundMessage,
};
#[cfg(feature = "redis")]
use crate::error::BrokerError;

/// Broker transport on Redis lists.
///
/// Each queue is a list. Receiving moves the head into a processing list
/// owned by this consumer name; acking removes it from there. On declare,
/// whatever a previous session of the same consumer left in its processing
/// list goes back to the queue, which gives redelivery after a crash or
/// reconnect. Redis has no heartbeats, so the heartbeat interval is unused.
#[cfg(feature = "redis")]
pub struct RedisConnector {
    prefix: String,
    consumer: String,
}

#[cfg(feature = "redis")]
impl RedisConnector {
    pub fn new(prefix: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            consumer: consumer.into(),
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, url: &str, _heartbeat: Duration) -> Result<Arc<dyn Connection>, BrokerError> {
        let client = redis::Client::open(url).map_err(disconnected)?;
        let mut conn = client.get_tokio_connection().await.map_err(disconnected)?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(disconnected)?;
        info!(url, consumer = %self.consumer, "connected to redis broker");

        Ok(Arc::new(RedisConnection {
            client,
            prefix: self.prefix.clone(),
            consumer: self.consumer.clone(),
            next_tag: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }))
    }
}

#[cfg(feature = "redis")]
fn disconnected(err: redis::RedisError) -> BrokerError {
    BrokerError::Disconnected(err.to_string())
}

#[cfg(feature = "redis")]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    properties: MessageProperties,
    body: String,
    #[serde(default)]
    redelivered: bool,
}

#[cfg(feature = "redis")]
impl StoredMessage {
    fn wrap(message: OutboundMessage) -> Self {
        Self {
            properties: message.properties,
            body: hex::encode(message.body),
            redelivered: false,
        }
    }

    fn encode(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|e| BrokerError::Encode(e.to_string()))
    }

    /// Split a raw list entry into inbound parts. Undecodable entries come
    /// back with an empty body so the consumer rejects them through the
    /// normal path.
    fn unwrap_raw(raw: &str) -> (MessageProperties, Vec<u8>, bool) {
        match serde_json::from_str::<StoredMessage>(raw) {
            Ok(message) => (
                message.properties,
                hex::decode(message.body).unwrap_or_default(),
                message.redelivered,
            ),
            Err(_) => (MessageProperties::default(), Vec::new(), false),
        }
    }
}

/// Re-encode `raw` with the redelivered flag set. Foreign entries are
/// returned as they are.
#[cfg(feature = "redis")]
fn flag_redelivered(raw: String) -> Result<String, BrokerError> {
    match serde_json::from_str::<StoredMessage>(&raw) {
        Ok(mut message) => {
            message.redelivered = true;
            message.encode()
        }
        Err(_) => Ok(raw),
    }
}

#[cfg(feature = "redis")]
fn queue_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:queue:{queue}")
}

#[cfg(feature = "redis")]
fn processing_key(prefix: &str, queue: &str, consumer: &str) -> String {
    format!("{prefix}:processing:{queue}:{consumer}")
}

#[cfg(feature = "redis")]
pub struct RedisConnection {
    client: redis::Client,
    prefix: String,
    consumer: String,
    next_tag: AtomicU64,
    /// Tag -> (queue, raw list entry) for unsettled messages.
    in_flight: Mutex<HashMap<DeliveryTag, (String, String)>>,
}

#[cfg(feature = "redis")]
impl RedisConnection {
    fn queue_key(&self, queue: &str) -> String {
        queue_key(&self.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        processing_key(&self.prefix, queue, &self.consumer)
    }

    fn declared_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    async fn conn(&self) -> Result<redis::aio::Connection, BrokerError> {
        self.client.get_tokio_connection().await.map_err(disconnected)
    }

    async fn ensure_declared(&self, conn: &mut redis::aio::Connection, queue: &str) -> Result<(), BrokerError> {
        let known: bool = conn
            .sismember(self.declared_key(), queue)
            .await
            .map_err(disconnected)?;
        if known {
            Ok(())
        } else {
            Err(BrokerError::UnknownQueue(queue.to_string()))
        }
    }

    /// Move leftovers of an earlier session back to the head of the queue.
    async fn recover(&self, conn: &mut redis::aio::Connection, queue: &str) -> Result<usize, BrokerError> {
        let mut recovered = 0;
        loop {
            let raw: Option<String> = redis::cmd("RPOP")
                .arg(self.processing_key(queue))
                .query_async(conn)
                .await
                .map_err(disconnected)?;
            let Some(raw) = raw else { break };

            let entry = flag_redelivered(raw)?;
            let _: i64 = conn
                .lpush(self.queue_key(queue), entry)
                .await
                .map_err(disconnected)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn settle(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let (owner, raw) = self
            .in_flight
            .lock()
            .await
            .remove(&tag)
            .ok_or(BrokerError::UnknownTag(tag))?;
        debug_assert_eq!(owner, queue);

        let mut conn = self.conn().await?;
        let _: i64 = conn
            .lrem(self.processing_key(&owner), 1, &raw)
            .await
            .map_err(disconnected)?;

        if requeue {
            let entry = flag_redelivered(raw)?;
            let _: i64 = conn
                .lpush(self.queue_key(&owner), entry)
                .await
                .map_err(disconnected)?;
        }
        Ok(())
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl Connection for RedisConnection {
    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .sadd(self.declared_key(), name)
            .await
            .map_err(disconnected)?;
        let recovered = self.recover(&mut conn, name).await?;
        if recovered > 0 {
            info!(queue = name, recovered, "requeued unacknowledged messages");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        self.ensure_declared(&mut conn, queue).await?;

        let entry = StoredMessage::wrap(message).encode()?;
        let _: i64 = conn
            .rpush(self.queue_key(queue), entry)
            .await
            .map_err(disconnected)?;
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(self.queue_key(queue))
            .arg(self.processing_key(queue))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await
            .map_err(disconnected)?;
        let Some(raw) = raw else { return Ok(None) };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight
            .lock()
            .await
            .insert(tag, (queue.to_string(), raw.clone()));

        let (properties, body, redelivered) = StoredMessage::unwrap_raw(&raw);

        Ok(Some(InboundMessage {
            tag,
            properties,
            body,
            redelivered,
        }))
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.settle(queue, tag, false).await
    }

    async fn reject(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.settle(queue, tag, requeue).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let in_flight: Vec<(DeliveryTag, String)> = self
            .in_flight
            .lock()
            .await
            .iter()
            .map(|(tag, (queue, _))| (*tag, queue.clone()))
            .collect();
        for (tag, queue) in in_flight {
            self.settle(&queue, tag, true).await?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "redis"))]
mod tests {
    use super::*;
    use crate::types::CorrelationId;

    fn outbound() -> OutboundMessage {
        OutboundMessage {
            properties: MessageProperties {
                persistent: true,
                correlation_id: Some(CorrelationId::from("c-1")),
                reply_to: Some("replies".into()),
            },
            body: br#"{"action":"class.get"}"#.to_vec(),
        }
    }

    #[test]
    fn keys_are_prefixed_and_scoped_per_consumer() {
        assert_eq!(queue_key("relay", "classes"), "relay:queue:classes");
        assert_eq!(processing_key("relay", "classes", "api-1"), "relay:processing:classes:api-1");
        assert_ne!(
            processing_key("relay", "classes", "api-1"),
            processing_key("relay", "classes", "api-2")
        );
    }

    #[test]
    fn stored_entry_keeps_body_and_properties() {
        let raw = StoredMessage::wrap(outbound()).encode().unwrap();
        let (properties, body, redelivered) = StoredMessage::unwrap_raw(&raw);

        assert_eq!(properties, outbound().properties);
        assert_eq!(body, outbound().body);
        assert!(!redelivered);
    }

    #[test]
    fn recovered_entries_are_flagged_redelivered() {
        let raw = StoredMessage::wrap(outbound()).encode().unwrap();
        let (_, body, redelivered) = StoredMessage::unwrap_raw(&flag_redelivered(raw).unwrap());
        assert!(redelivered);
        assert_eq!(body, outbound().body);
    }

    #[test]
    fn foreign_entries_surface_with_empty_body() {
        assert_eq!(flag_redelivered("plain text".into()).unwrap(), "plain text");
        let (properties, body, redelivered) = StoredMessage::unwrap_raw("plain text");
        assert_eq!(properties, MessageProperties::default());
        assert!(body.is_empty());
        assert!(!redelivered);
    }
}
