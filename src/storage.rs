use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::{Delivery, DeliveryId, Subscription, SubscriptionId};

/// Persistence for subscriptions and their deliveries.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert `subscription` unless one with the same URL exists. Returns
    /// the stored subscription, which is the existing one on conflict.
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<Subscription, StorageError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError>;

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError>;

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError>;

    async fn update_delivery(&self, delivery: &Delivery) -> Result<(), StorageError>;

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError>;

    /// Deliveries for one subscription, oldest first.
    async fn deliveries_for_subscription(&self, id: &SubscriptionId) -> Result<Vec<Delivery>, StorageError>;

    /// Take the lease on a claimable delivery until `lease_until`.
    ///
    /// Returns `None` when the delivery is terminal, not yet due, or leased
    /// by someone else. At most one caller wins a given lease.
    async fn claim_delivery(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StorageError>;

    /// Non-terminal deliveries that are unleased (or whose lease expired).
    async fn reclaimable_deliveries(&self, now: DateTime<Utc>) -> Result<Vec<Delivery>, StorageError>;
}

/// In-memory storage for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    deliveries: Mutex<HashMap<DeliveryId, Delivery>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<Subscription, StorageError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(existing) = subscriptions.values().find(|s| s.url == subscription.url) {
            return Ok(existing.clone());
        }
        subscriptions.insert(subscription.id.clone(), subscription.clone());
        Ok(subscription.clone())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let mut subscriptions: Vec<Subscription> = self.subscriptions.lock().await.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(subscriptions)
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        Ok(self.subscriptions.lock().await.get(id).cloned())
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        self.deliveries
            .lock()
            .await
            .insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        let mut deliveries = self.deliveries.lock().await;
        match deliveries.get_mut(&delivery.id) {
            Some(stored) => {
                *stored = delivery.clone();
                Ok(())
            }
            None => Err(StorageError::Backend(format!("no delivery {}", delivery.id))),
        }
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        Ok(self.deliveries.lock().await.get(id).cloned())
    }

    async fn deliveries_for_subscription(&self, id: &SubscriptionId) -> Result<Vec<Delivery>, StorageError> {
        let mut deliveries: Vec<Delivery> = self
            .deliveries
            .lock()
            .await
            .values()
            .filter(|d| &d.subscription_id == id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deliveries)
    }

    async fn claim_delivery(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StorageError> {
        let mut deliveries = self.deliveries.lock().await;
        match deliveries.get_mut(id) {
            Some(delivery) if delivery.is_claimable(now) => {
                delivery.locked_until = Some(lease_until);
                Ok(Some(delivery.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reclaimable_deliveries(&self, now: DateTime<Utc>) -> Result<Vec<Delivery>, StorageError> {
        let mut deliveries: Vec<Delivery> = self
            .deliveries
            .lock()
            .await
            .values()
            .filter(|d| !d.status.is_terminal() && d.locked_until.map_or(true, |until| until <= now))
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliveryStatus, DomainEvent};
    use serde_json::json;
    use std::sync::Arc;

    fn subscription(url: &str) -> Subscription {
        Subscription::new(url, ["*".to_string()].into_iter().collect(), "secret")
    }

    #[tokio::test]
    async fn subscription_insert_is_idempotent_by_url() {
        let storage = InMemoryStorage::new();
        let first = storage.insert_subscription(&subscription("https://a.example")).await.unwrap();
        let second = storage.insert_subscription(&subscription("https://a.example")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(storage.list_subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_one_claim_wins_a_lease() {
        let storage = Arc::new(InMemoryStorage::new());
        let sub = subscription("https://a.example");
        let delivery = Delivery::pending(&sub, &DomainEvent::new("class.created", json!({})));
        storage.insert_delivery(&delivery).await.unwrap();

        let now = Utc::now();
        let lease = now + chrono::Duration::seconds(30);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            let id = delivery.id.clone();
            tasks.push(tokio::spawn(async move { storage.claim_delivery(&id, now, lease).await.unwrap() }));
        }

        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);

        // Expired lease can be taken again.
        let later = lease + chrono::Duration::seconds(1);
        assert!(storage
            .claim_delivery(&delivery.id, later, later + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn terminal_deliveries_are_not_reclaimable() {
        let storage = InMemoryStorage::new();
        let sub = subscription("https://a.example");
        let mut done = Delivery::pending(&sub, &DomainEvent::new("a", json!(1)));
        done.status = DeliveryStatus::Success;
        let open = Delivery::pending(&sub, &DomainEvent::new("b", json!(2)));
        storage.insert_delivery(&done).await.unwrap();
        storage.insert_delivery(&open).await.unwrap();

        let reclaimable = storage.reclaimable_deliveries(Utc::now()).await.unwrap();
        assert_eq!(reclaimable.len(), 1);
        assert_eq!(reclaimable[0].id, open.id);
        assert!(storage.claim_delivery(&done.id, Utc::now(), Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_unknown_delivery_fails() {
        let storage = InMemoryStorage::new();
        let sub = subscription("https://a.example");
        let delivery = Delivery::pending(&sub, &DomainEvent::new("a", json!(1)));
        assert!(storage.update_delivery(&delivery).await.is_err());
    }
}
