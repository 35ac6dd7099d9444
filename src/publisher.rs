use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::WebhookError;
use crate::scheduler::DueQueue;
use crate::storage::Storage;
use crate::telemetry::metric_inc;
use crate::types::{Delivery, DeliveryId, DomainEvent, Subscription, SubscriptionId};

/// Owns webhook subscriptions and turns domain events into deliveries.
///
/// [`WebhookPublisher::publish_event`] is fire-and-forget: events go to a
/// background fan-out task over a bounded channel, so a slow store or a
/// full buffer never reaches the business transaction that raised them.
pub struct WebhookPublisher {
    shared: Arc<PublisherShared>,
    fanout_tx: Mutex<Option<mpsc::Sender<DomainEvent>>>,
    fanout_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct PublisherShared {
    storage: Arc<dyn Storage>,
    queue: Arc<DueQueue>,
}

impl WebhookPublisher {
    /// Start the fan-out task. Deliveries are scheduled on `queue`.
    pub fn new(config: &RelayConfig, storage: Arc<dyn Storage>, queue: Arc<DueQueue>) -> Self {
        let shared = Arc::new(PublisherShared { storage, queue });
        let (fanout_tx, fanout_rx) = mpsc::channel(config.fanout_capacity.max(1));
        let handle = tokio::spawn(fanout_loop(shared.clone(), fanout_rx));

        Self {
            shared,
            fanout_tx: Mutex::new(Some(fanout_tx)),
            fanout_handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Register `url` for `events`. Registering a known URL again returns
    /// the existing subscription unchanged.
    pub async fn register_subscription<I, S>(
        &self,
        url: &str,
        events: I,
        secret: Option<String>,
    ) -> Result<Subscription, WebhookError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let url = url.trim();
        validate_url(url)?;

        let events: BTreeSet<String> = events
            .into_iter()
            .map(|event| {
                let event: String = event.into();
                event.trim().to_string()
            })
            .collect();
        if events.is_empty() || events.iter().any(|event| event.is_empty()) {
            return Err(WebhookError::Validation("events must be a non-empty list of event types".into()));
        }

        let secret = match secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => generate_secret(),
        };

        let candidate = Subscription::new(url, events, secret);
        let stored = self.shared.storage.insert_subscription(&candidate).await?;
        if stored.id == candidate.id {
            metric_inc("webhook.subscription.registered");
            info!(subscription_id = %stored.id, url = %stored.url, "webhook subscription registered");
        } else {
            debug!(subscription_id = %stored.id, url = %stored.url, "subscription already registered");
        }
        Ok(stored)
    }

    pub async fn get_subscriptions(&self) -> Result<Vec<Subscription>, WebhookError> {
        Ok(self.shared.storage.list_subscriptions().await?)
    }

    pub async fn get_subscription(&self, id: &SubscriptionId) -> Result<Subscription, WebhookError> {
        self.shared
            .storage
            .get_subscription(id)
            .await?
            .ok_or_else(|| WebhookError::SubscriptionNotFound(id.clone()))
    }

    /// Delivery history of one subscription, oldest first.
    pub async fn deliveries(&self, subscription_id: &SubscriptionId) -> Result<Vec<Delivery>, WebhookError> {
        self.get_subscription(subscription_id).await?;
        Ok(self
            .shared
            .storage
            .deliveries_for_subscription(subscription_id)
            .await?)
    }

    pub async fn delivery(&self, id: &DeliveryId) -> Result<Delivery, WebhookError> {
        self.shared
            .storage
            .get_delivery(id)
            .await?
            .ok_or_else(|| WebhookError::DeliveryNotFound(id.clone()))
    }

    /// Hand `event` to the fan-out task. Never blocks and never fails;
    /// dropped events are logged.
    pub fn publish_event(&self, event: DomainEvent) {
        let guard = self.fanout_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = guard.as_ref() else {
            warn!(event_type = %event.event_type, "publisher shut down, dropping event");
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                metric_inc("webhook.event.dropped");
                warn!(event_type = %event.event_type, "fan-out buffer full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                metric_inc("webhook.event.dropped");
                warn!(event_type = %event.event_type, "fan-out task gone, dropping event");
            }
        }
    }

    /// Create one `pending` delivery per matching subscription and schedule
    /// each for an immediate attempt.
    pub async fn fan_out(&self, event: &DomainEvent) -> Result<Vec<Delivery>, WebhookError> {
        self.shared.fan_out(event).await
    }

    /// Stop accepting events and wait for the buffered ones to fan out.
    pub async fn shutdown(&self) {
        self.fanout_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = self.fanout_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl PublisherShared {
    async fn fan_out(&self, event: &DomainEvent) -> Result<Vec<Delivery>, WebhookError> {
        let subscriptions = self.storage.list_subscriptions().await?;
        let mut deliveries = Vec::new();

        for subscription in subscriptions.iter().filter(|s| s.matches(&event.event_type)) {
            let delivery = Delivery::pending(subscription, event);
            self.storage.insert_delivery(&delivery).await?;
            self.queue.schedule_now(delivery.id.clone()).await;
            debug!(
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_type = %event.event_type,
                "delivery created"
            );
            deliveries.push(delivery);
        }

        metric_inc("webhook.event.published");
        Ok(deliveries)
    }
}

async fn fanout_loop(shared: Arc<PublisherShared>, mut rx: mpsc::Receiver<DomainEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = shared.fan_out(&event).await {
            error!(event_type = %event.event_type, error = %err, "failed to fan out event");
        }
    }
    debug!("fan-out task finished");
}

fn validate_url(url: &str) -> Result<(), WebhookError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| WebhookError::Validation(format!("url must be http(s): {url}")))?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(WebhookError::Validation(format!("url has no host: {url}")));
    }
    Ok(())
}

fn generate_secret() -> String {
    format!("whsec_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
