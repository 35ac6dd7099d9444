#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, TimeZone, Utc};
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Row};

#[cfg(feature = "postgres")]
use crate::error::StorageError;
#[cfg(feature = "postgres")]
use crate::storage::Storage;
#[cfg(feature = "postgres")]
use crate::types::{Delivery, DeliveryId, Subscription, SubscriptionId};

/// Postgres-backed storage.
///
/// Records are kept as JSONB documents. The columns needed for lookups and
/// for the claim lease are mirrored next to the document; times are epoch
/// milliseconds. `locked_until` lives only in its column.
#[cfg(feature = "postgres")]
pub struct PostgresStorage {
    client: Client,
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, StorageError> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    id TEXT PRIMARY KEY,
                    url TEXT NOT NULL UNIQUE,
                    created_at BIGINT NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id TEXT PRIMARY KEY,
                    subscription_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    next_retry_at BIGINT,
                    locked_until BIGINT,
                    created_at BIGINT NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_deliveries_subscription
                 ON webhook_deliveries (subscription_id, created_at)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }
}

#[cfg(feature = "postgres")]
fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[cfg(feature = "postgres")]
fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError::Decode(e.to_string()))
}

#[cfg(feature = "postgres")]
fn subscription_from_row(row: &Row) -> Result<Subscription, StorageError> {
    decode_subscription(row.try_get("payload")?)
}

#[cfg(feature = "postgres")]
fn delivery_from_row(row: &Row) -> Result<Delivery, StorageError> {
    decode_delivery(row.try_get("payload")?, row.try_get("locked_until")?)
}

#[cfg(feature = "postgres")]
fn decode_subscription(payload: serde_json::Value) -> Result<Subscription, StorageError> {
    serde_json::from_value(payload).map_err(|e| StorageError::Decode(e.to_string()))
}

/// The lease column wins over whatever the document says.
#[cfg(feature = "postgres")]
fn decode_delivery(payload: serde_json::Value, locked_until: Option<i64>) -> Result<Delivery, StorageError> {
    let mut delivery: Delivery =
        serde_json::from_value(payload).map_err(|e| StorageError::Decode(e.to_string()))?;
    delivery.locked_until = locked_until.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    Ok(delivery)
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<Subscription, StorageError> {
        self.client
            .execute(
                "INSERT INTO webhook_subscriptions (id, url, created_at, payload)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (url) DO NOTHING",
                &[
                    &subscription.id.as_str(),
                    &subscription.url,
                    &millis(subscription.created_at),
                    &encode(subscription)?,
                ],
            )
            .await?;

        let row = self
            .client
            .query_one(
                "SELECT payload FROM webhook_subscriptions WHERE url = $1",
                &[&subscription.url],
            )
            .await?;
        subscription_from_row(&row)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let rows = self
            .client
            .query("SELECT payload FROM webhook_subscriptions ORDER BY created_at", &[])
            .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_subscriptions WHERE id = $1",
                &[&id.as_str()],
            )
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO webhook_deliveries
                    (id, subscription_id, status, next_retry_at, locked_until, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &delivery.id.as_str(),
                    &delivery.subscription_id.as_str(),
                    &delivery.status.as_str(),
                    &delivery.next_retry_at.map(millis),
                    &delivery.locked_until.map(millis),
                    &millis(delivery.created_at),
                    &encode(delivery)?,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $2, next_retry_at = $3, locked_until = $4, payload = $5
                 WHERE id = $1",
                &[
                    &delivery.id.as_str(),
                    &delivery.status.as_str(),
                    &delivery.next_retry_at.map(millis),
                    &delivery.locked_until.map(millis),
                    &encode(delivery)?,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StorageError::Backend(format!("no delivery {}", delivery.id)));
        }
        Ok(())
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload, locked_until FROM webhook_deliveries WHERE id = $1",
                &[&id.as_str()],
            )
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn deliveries_for_subscription(&self, id: &SubscriptionId) -> Result<Vec<Delivery>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT payload, locked_until FROM webhook_deliveries
                 WHERE subscription_id = $1
                 ORDER BY created_at",
                &[&id.as_str()],
            )
            .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn claim_delivery(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StorageError> {
        let row = self
            .client
            .query_opt(
                "UPDATE webhook_deliveries
                 SET locked_until = $3
                 WHERE id = $1
                   AND status NOT IN ('success', 'failed')
                   AND (next_retry_at IS NULL OR next_retry_at <= $2)
                   AND (locked_until IS NULL OR locked_until <= $2)
                 RETURNING payload, locked_until",
                &[&id.as_str(), &millis(now), &millis(lease_until)],
            )
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn reclaimable_deliveries(&self, now: DateTime<Utc>) -> Result<Vec<Delivery>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT payload, locked_until FROM webhook_deliveries
                 WHERE status NOT IN ('success', 'failed')
                   AND (locked_until IS NULL OR locked_until <= $1)
                 ORDER BY created_at",
                &[&millis(now)],
            )
            .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}
