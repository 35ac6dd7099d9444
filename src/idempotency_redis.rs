#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::error::IdempotencyError;
#[cfg(feature = "redis")]
use crate::idempotency::IdempotencyStore;
#[cfg(feature = "redis")]
use crate::types::IdempotencyRecord;

/// Idempotency records shared between processes through Redis.
///
/// `set_if_absent` is a single `SET NX PX`, so concurrent consumers in
/// different processes cannot both claim one message id.
#[cfg(feature = "redis")]
pub struct RedisIdempotencyStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        Ok(Self::new(client, prefix))
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn conn(&self) -> Result<redis::aio::Connection, IdempotencyError> {
        self.client.get_tokio_connection().await.map_err(unavailable)
    }
}

#[cfg(feature = "redis")]
fn unavailable(err: redis::RedisError) -> IdempotencyError {
    IdempotencyError::Unavailable(err.to_string())
}

#[cfg(feature = "redis")]
fn encode(record: &IdempotencyRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

#[cfg(feature = "redis")]
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[cfg(feature = "redis")]
#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn set_if_absent(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(encode(record))
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<(), IdempotencyError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(encode(record))
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.key(key)).await.map_err(unavailable)?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| IdempotencyError::Corrupt {
                key: key.to_string(),
                cause: e.to_string(),
            })
        })
        .transpose()
    }

    async fn remove(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.del(self.key(key)).await.map_err(unavailable)?;
        Ok(())
    }
}
