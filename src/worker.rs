//! Webhook delivery workers.
//!
//! Each worker:
//! - Pulls due deliveries from the shared [`DueQueue`]
//! - Claims the delivery in storage before attempting it
//! - Signs and POSTs the event with a fixed per-attempt timeout
//! - Records the outcome and schedules the next attempt
//!
//! Attempts for one delivery never overlap: the in-flight set covers this
//! process and the storage lease covers everything else.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::config::RelayConfig;
use crate::error::{FailureReason, StorageError};
use crate::scheduler::DueQueue;
use crate::signing::build_signature_headers;
use crate::storage::Storage;
use crate::telemetry::metric_inc;
use crate::types::{CorrelationId, Delivery, DeliveryId, DeliveryStatus};

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// Stored response bodies are cut to this many bytes.
const MAX_RESPONSE_BODY: usize = 1024;

/// Extra lease time on top of the HTTP timeout.
const LEASE_MARGIN: Duration = Duration::from_secs(5);

/// One outgoing webhook call.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs webhook POSTs.
///
/// Any HTTP response is `Ok`, whatever its status; `Err` is reserved for
/// calls that produced no response at all.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(&self, request: WebhookRequest) -> Result<WebhookResponse, FailureReason>;
}

/// `reqwest`-based client.
#[cfg(feature = "http")]
pub struct HttpClient {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpClient {
    pub fn new(timeout: Duration, max_redirects: usize) -> Result<Self, crate::error::WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(max_redirects))
            .user_agent(concat!("message-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| crate::error::WebhookError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, crate::error::WebhookError> {
        Self::new(config.http_timeout, config.max_redirects)
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl WebhookClient for HttpClient {
    async fn post(&self, request: WebhookRequest) -> Result<WebhookResponse, FailureReason> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Ok(WebhookResponse { status, body })
            }
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout),
            Err(err) => Err(FailureReason::Network(err.to_string())),
        }
    }
}

/// JSON body POSTed to subscribers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a CorrelationId>,
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_RESPONSE_BODY {
        let mut cut = MAX_RESPONSE_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Record one attempt's result on `delivery`.
///
/// Returns the delay before the next attempt, or `None` when the delivery
/// reached a terminal state.
pub fn apply_outcome(
    delivery: &mut Delivery,
    result: Result<WebhookResponse, FailureReason>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Option<Duration> {
    delivery.attempts += 1;
    delivery.locked_until = None;

    let reason = match result {
        Ok(response) if response.is_success() => {
            delivery.status = DeliveryStatus::Success;
            delivery.response_status = Some(response.status);
            delivery.response_body = Some(truncate(response.body));
            delivery.error_message = None;
            delivery.next_retry_at = None;
            delivery.delivered_at = Some(now);
            return None;
        }
        Ok(response) => {
            delivery.response_status = Some(response.status);
            delivery.response_body = Some(truncate(response.body));
            FailureReason::Status(response.status)
        }
        Err(reason) => {
            delivery.response_status = None;
            delivery.response_body = None;
            reason
        }
    };
    delivery.error_message = Some(reason.to_string());

    if policy.allows_retry(delivery.attempts) {
        let delay = policy.delay_for(delivery.attempts);
        delivery.status = DeliveryStatus::Retrying;
        let delay_chrono = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        delivery.next_retry_at = Some(now + delay_chrono);
        Some(delay)
    } else {
        delivery.status = DeliveryStatus::Failed;
        delivery.next_retry_at = None;
        None
    }
}

/// Pool of delivery workers plus the reclaim sweep.
pub struct WebhookDeliveryWorker {
    shared: Arc<WorkerShared>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct WorkerShared {
    storage: Arc<dyn Storage>,
    queue: Arc<DueQueue>,
    client: Arc<dyn WebhookClient>,
    policy: RetryPolicy,
    http_timeout: Duration,
    in_flight: Mutex<HashSet<DeliveryId>>,
}

impl WebhookDeliveryWorker {
    /// Spawn `config.worker_count` workers on `queue` and the reclaim sweep.
    ///
    /// The first sweep runs immediately and picks up deliveries left
    /// unfinished by an earlier process.
    pub fn start(
        config: &RelayConfig,
        storage: Arc<dyn Storage>,
        queue: Arc<DueQueue>,
        client: Arc<dyn WebhookClient>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            storage,
            queue,
            client,
            policy: config.retry_policy(),
            http_timeout: config.http_timeout,
            in_flight: Mutex::new(HashSet::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_count = config.worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count + 1);
        for _ in 0..worker_count {
            handles.push(tokio::spawn(worker_loop(shared.clone())));
        }
        handles.push(tokio::spawn(reclaim_loop(
            shared.clone(),
            config.reclaim_interval,
            shutdown_rx,
        )));
        info!(workers = worker_count, "webhook delivery workers started");

        Self {
            shared,
            shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Attempt one delivery now, if it is claimable.
    pub async fn process(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        self.shared.process(id).await
    }

    /// Schedule every unfinished, unleased delivery. Returns how many.
    pub async fn reclaim_now(&self) -> Result<usize, StorageError> {
        self.shared.reclaim().await
    }

    /// Stop the workers and wait for in-progress attempts to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.shared.queue.close();

        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("webhook delivery workers stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn worker_loop(shared: Arc<WorkerShared>) {
    while let Some(id) = shared.queue.next_due().await {
        // Left for the reclaim sweep.
        if let Err(err) = shared.process(&id).await {
            error!(delivery_id = %id, error = %err, "delivery attempt could not be recorded");
        }
    }
}

async fn reclaim_loop(shared: Arc<WorkerShared>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                match shared.reclaim().await {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "rescheduled unfinished deliveries"),
                    Err(err) => warn!(error = %err, "reclaim sweep failed"),
                }
            }
        }
    }
}

/// Marks a delivery as in flight in this process until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<DeliveryId>>,
    id: DeliveryId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<DeliveryId>>, id: &DeliveryId) -> Option<Self> {
        if lock(set).insert(id.clone()) {
            Some(Self { set, id: id.clone() })
        } else {
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

/// What one claim-and-attempt pass did.
enum Attempt {
    Done(Delivery),
    /// Claimed too early; due again at the given time.
    NotDue(DateTime<Utc>),
    Skipped,
}

impl WorkerShared {
    async fn process(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        let attempt = {
            let Some(_in_flight) = InFlight::acquire(&self.in_flight, id) else {
                debug!(delivery_id = %id, "attempt already in flight");
                return Ok(None);
            };
            self.attempt(id).await?
        };

        // Scheduled after the in-flight mark is gone so a short delay
        // cannot be skipped as a concurrent attempt.
        match attempt {
            Attempt::Done(delivery) => {
                if delivery.status == DeliveryStatus::Retrying {
                    if let Some(at) = delivery.next_retry_at {
                        self.queue.schedule_at(delivery.id.clone(), at).await;
                    }
                }
                Ok(Some(delivery))
            }
            Attempt::NotDue(at) => {
                self.queue.schedule_at(id.clone(), at).await;
                Ok(None)
            }
            Attempt::Skipped => Ok(None),
        }
    }

    async fn attempt(&self, id: &DeliveryId) -> Result<Attempt, StorageError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.http_timeout + LEASE_MARGIN)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let Some(mut delivery) = self.storage.claim_delivery(id, now, now + lease).await? else {
            // Timer fired slightly ahead of the stored due time.
            if let Some(current) = self.storage.get_delivery(id).await? {
                if !current.status.is_terminal() && current.locked_until.map_or(true, |until| until <= now) {
                    if let Some(at) = current.next_retry_at.filter(|at| *at > now) {
                        return Ok(Attempt::NotDue(at));
                    }
                }
            }
            debug!(delivery_id = %id, "delivery not claimable, skipping");
            return Ok(Attempt::Skipped);
        };

        let subscription = match self.storage.get_subscription(&delivery.subscription_id).await? {
            Some(subscription) if subscription.active => subscription,
            _ => {
                delivery.status = DeliveryStatus::Failed;
                delivery.error_message = Some(FailureReason::SubscriptionUnavailable.to_string());
                delivery.next_retry_at = None;
                delivery.locked_until = None;
                self.storage.update_delivery(&delivery).await?;
                metric_inc("webhook.delivery.abandoned");
                warn!(
                    delivery_id = %delivery.id,
                    subscription_id = %delivery.subscription_id,
                    "subscription missing or inactive, delivery failed"
                );
                return Ok(Attempt::Done(delivery));
            }
        };

        let body = serde_json::to_vec(&WebhookBody {
            event_type: &delivery.event,
            data: &delivery.payload,
            correlation_id: delivery.correlation_id.as_ref(),
        })
        .map_err(|e| StorageError::Decode(e.to_string()))?;

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (EVENT_HEADER.to_string(), delivery.event.clone()),
            (DELIVERY_HEADER.to_string(), delivery.id.to_string()),
        ];
        let signature = build_signature_headers(&subscription.secret, &body, Utc::now().timestamp());
        headers.extend(
            signature
                .into_pairs()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value)),
        );

        let result = self
            .client
            .post(WebhookRequest {
                url: subscription.url.clone(),
                headers,
                body,
                timeout: self.http_timeout,
            })
            .await;

        let retry_in = apply_outcome(&mut delivery, result, &self.policy, Utc::now());
        self.storage.update_delivery(&delivery).await?;

        match delivery.status {
            DeliveryStatus::Success => {
                metric_inc("webhook.delivery.success");
                info!(
                    delivery_id = %delivery.id,
                    url = %subscription.url,
                    attempts = delivery.attempts,
                    "webhook delivered"
                );
            }
            DeliveryStatus::Retrying => {
                metric_inc("webhook.delivery.failure");
                warn!(
                    delivery_id = %delivery.id,
                    url = %subscription.url,
                    attempts = delivery.attempts,
                    error = ?delivery.error_message,
                    retry_in = ?retry_in,
                    "webhook attempt failed, will retry"
                );
            }
            _ => {
                metric_inc("webhook.delivery.exhausted");
                error!(
                    delivery_id = %delivery.id,
                    url = %subscription.url,
                    attempts = delivery.attempts,
                    error = ?delivery.error_message,
                    "webhook delivery failed permanently"
                );
            }
        }
        Ok(Attempt::Done(delivery))
    }

    async fn reclaim(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let deliveries = self.storage.reclaimable_deliveries(now).await?;
        let mut count = 0;
        for delivery in deliveries {
            if lock(&self.in_flight).contains(&delivery.id) {
                continue;
            }
            let at = delivery.next_retry_at.unwrap_or(now);
            self.queue.schedule_at(delivery.id, at).await;
            count += 1;
        }
        Ok(count)
    }
}
