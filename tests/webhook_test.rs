use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use message_relay::{
    verify_webhook_request, Delivery, DeliveryId, DeliveryStatus, DomainEvent, DueQueue, FailureReason,
    InMemoryStorage, RelayConfig, Storage, WebhookClient, WebhookDeliveryWorker, WebhookPublisher, WebhookRequest,
    WebhookResponse, DELIVERY_HEADER, EVENT_HEADER,
};

/// Answers with scripted statuses and records what each attempt saw.
struct ScriptedClient {
    storage: Arc<InMemoryStorage>,
    secret: Mutex<Option<String>>,
    statuses: Mutex<VecDeque<u16>>,
    fallback: u16,
    /// `nextRetryAt` stored on the delivery when each attempt started.
    seen_next_retry: Mutex<Vec<Option<DateTime<Utc>>>>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl ScriptedClient {
    fn new(storage: Arc<InMemoryStorage>, statuses: &[u16], fallback: u16) -> Arc<Self> {
        Arc::new(Self {
            storage,
            secret: Mutex::new(None),
            statuses: Mutex::new(statuses.iter().copied().collect()),
            fallback,
            seen_next_retry: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    async fn calls(&self) -> usize {
        self.requests.lock().await.len()
    }
}

fn header<'a>(request: &'a WebhookRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[async_trait]
impl WebhookClient for ScriptedClient {
    async fn post(&self, request: WebhookRequest) -> Result<WebhookResponse, FailureReason> {
        if let Some(secret) = self.secret.lock().await.as_ref() {
            let headers = request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()));
            let now = Utc::now().timestamp() as u64;
            assert_eq!(verify_webhook_request(headers, &request.body, secret.as_bytes(), 300, now), Ok(()));
        }

        if let Some(id) = header(&request, DELIVERY_HEADER) {
            let stored = self.storage.get_delivery(&DeliveryId::from(id)).await.unwrap();
            self.seen_next_retry
                .lock()
                .await
                .push(stored.and_then(|delivery| delivery.next_retry_at));
        }
        self.requests.lock().await.push(request);

        let status = self.statuses.lock().await.pop_front().unwrap_or(self.fallback);
        Ok(WebhookResponse { status, body: format!("status {status}") })
    }
}

struct Harness {
    storage: Arc<InMemoryStorage>,
    publisher: WebhookPublisher,
    worker: WebhookDeliveryWorker,
}

fn config() -> RelayConfig {
    RelayConfig {
        max_attempts: 3,
        retry_base_ms: 10,
        retry_max_ms: 40,
        retry_jitter_ms: 0,
        worker_count: 2,
        reclaim_interval: Duration::from_secs(60),
        ..RelayConfig::default()
    }
}

fn start(storage: Arc<InMemoryStorage>, client: Arc<dyn WebhookClient>) -> Harness {
    let config = config();
    let queue = Arc::new(DueQueue::new());
    let publisher = WebhookPublisher::new(&config, storage.clone(), queue.clone());
    let worker = WebhookDeliveryWorker::start(&config, storage.clone(), queue, client);
    Harness {
        storage,
        publisher,
        worker,
    }
}

async fn wait_for_terminal(storage: &InMemoryStorage, id: &DeliveryId) -> Delivery {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(delivery) = storage.get_delivery(id).await.unwrap() {
            if delivery.status.is_terminal() {
                return delivery;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "delivery {id} never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn registering_the_same_url_twice_keeps_one_subscription() {
    let storage = Arc::new(InMemoryStorage::new());
    let client = ScriptedClient::new(storage.clone(), &[], 200);
    let harness = start(storage, client);

    let first = harness
        .publisher
        .register_subscription("https://crm.example/hooks", ["enrollment.created"], None)
        .await
        .unwrap();
    let second = harness
        .publisher
        .register_subscription("https://crm.example/hooks", ["*"], Some("other".into()))
        .await
        .unwrap();

    assert_eq!(first, second);
    let subscriptions = harness.publisher.get_subscriptions().await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert!(subscriptions[0].active);
    harness.worker.shutdown().await;
}

#[tokio::test]
async fn failed_attempts_retry_until_success() {
    let storage = Arc::new(InMemoryStorage::new());
    let client = ScriptedClient::new(storage.clone(), &[500, 503], 200);
    let harness = start(storage.clone(), client.clone());

    let subscription = harness
        .publisher
        .register_subscription("https://crm.example/hooks", ["enrollment.created"], Some("whsec_test".into()))
        .await
        .unwrap();
    *client.secret.lock().await = Some(subscription.secret.clone());

    harness.publisher.publish_event(
        DomainEvent::new("enrollment.created", json!({ "memberId": "m-1" })).with_correlation_id("corr-42"),
    );
    harness.publisher.shutdown().await;

    let deliveries = harness.publisher.deliveries(&subscription.id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivered = wait_for_terminal(&harness.storage, &deliveries[0].id).await;

    assert_eq!(delivered.status, DeliveryStatus::Success);
    assert_eq!(delivered.attempts, 3);
    assert_eq!(delivered.response_status, Some(200));
    assert!(delivered.delivered_at.is_some());

    let seen = client.seen_next_retry.lock().await.clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], None);
    let (Some(first_retry), Some(second_retry)) = (seen[1], seen[2]) else {
        panic!("retries were not scheduled: {seen:?}");
    };
    assert!(first_retry < second_retry);

    let requests = client.requests.lock().await;
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body,
        json!({ "type": "enrollment.created", "data": { "memberId": "m-1" }, "correlationId": "corr-42" })
    );
    assert_eq!(header(&requests[0], EVENT_HEADER), Some("enrollment.created"));
    drop(requests);

    harness.worker.shutdown().await;
}

#[tokio::test]
async fn exhausted_delivery_fails_and_is_not_retried_again() {
    let storage = Arc::new(InMemoryStorage::new());
    let client = ScriptedClient::new(storage.clone(), &[], 500);
    let harness = start(storage.clone(), client.clone());

    harness
        .publisher
        .register_subscription("https://down.example/hooks", ["*"], None)
        .await
        .unwrap();
    let deliveries = harness
        .publisher
        .fan_out(&DomainEvent::new("class.cancelled", json!({ "classId": "c-9" })))
        .await
        .unwrap();
    let failed = wait_for_terminal(&harness.storage, &deliveries[0].id).await;

    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.response_status, Some(500));
    assert_eq!(failed.next_retry_at, None);
    assert!(failed.error_message.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.calls().await, 3);
    assert_eq!(harness.worker.process(&failed.id).await.unwrap(), None);
    assert_eq!(harness.worker.reclaim_now().await.unwrap(), 0);
    harness.worker.shutdown().await;
}

#[tokio::test]
async fn only_matching_subscriptions_receive_an_event() {
    let storage = Arc::new(InMemoryStorage::new());
    let client = ScriptedClient::new(storage.clone(), &[], 200);
    let harness = start(storage, client);

    let everything = harness
        .publisher
        .register_subscription("https://all.example/hooks", ["*"], None)
        .await
        .unwrap();
    let updates_only = harness
        .publisher
        .register_subscription("https://updates.example/hooks", ["enrollment.updated"], None)
        .await
        .unwrap();

    let deliveries = harness
        .publisher
        .fan_out(&DomainEvent::new("enrollment.created", json!({})))
        .await
        .unwrap();

    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].subscription_id, everything.id);
    assert!(harness.publisher.deliveries(&updates_only.id).await.unwrap().is_empty());
    harness.worker.shutdown().await;
}

#[tokio::test]
async fn deliveries_to_inactive_subscriptions_fail_immediately() {
    let storage = Arc::new(InMemoryStorage::new());
    let client = ScriptedClient::new(storage.clone(), &[], 200);

    // Recorded before the workers start, as if left by an earlier process.
    let mut subscription = message_relay::Subscription::new(
        "https://gone.example/hooks",
        ["*".to_string()].into_iter().collect(),
        "s",
    );
    subscription.active = false;
    storage.insert_subscription(&subscription).await.unwrap();
    let orphan = Delivery::pending(&subscription, &DomainEvent::new("class.created", json!({})));
    storage.insert_delivery(&orphan).await.unwrap();

    let harness = start(storage.clone(), client.clone());
    let delivery = wait_for_terminal(&harness.storage, &orphan.id).await;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 0);
    assert_eq!(client.calls().await, 0);
    harness.worker.shutdown().await;
}

#[tokio::test]
async fn deliveries_with_expired_leases_are_reclaimed_at_start() {
    let storage = Arc::new(InMemoryStorage::new());
    let client = ScriptedClient::new(storage.clone(), &[], 200);

    let subscription = message_relay::Subscription::new(
        "https://crm.example/hooks",
        ["*".to_string()].into_iter().collect(),
        "s",
    );
    storage.insert_subscription(&subscription).await.unwrap();

    // Left behind by a worker that died mid-attempt.
    let now = Utc::now();
    let mut abandoned = Delivery::pending(&subscription, &DomainEvent::new("class.created", json!({ "id": 1 })));
    abandoned.status = DeliveryStatus::Retrying;
    abandoned.attempts = 1;
    abandoned.next_retry_at = Some(now - chrono::Duration::minutes(1));
    abandoned.locked_until = Some(now - chrono::Duration::seconds(10));
    storage.insert_delivery(&abandoned).await.unwrap();

    // Still leased by a live worker elsewhere.
    let mut leased = Delivery::pending(&subscription, &DomainEvent::new("class.created", json!({ "id": 2 })));
    leased.status = DeliveryStatus::Retrying;
    leased.attempts = 1;
    leased.next_retry_at = Some(now - chrono::Duration::minutes(1));
    leased.locked_until = Some(now + chrono::Duration::hours(1));
    storage.insert_delivery(&leased).await.unwrap();

    let harness = start(storage.clone(), client.clone());
    let delivery = wait_for_terminal(&harness.storage, &abandoned.id).await;

    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 2);
    assert_eq!(delivery.locked_until, None);
    assert_eq!(client.calls().await, 1);

    let untouched = storage.get_delivery(&leased.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, DeliveryStatus::Retrying);
    assert_eq!(untouched.attempts, 1);
    assert_eq!(harness.worker.reclaim_now().await.unwrap(), 0);
    harness.worker.shutdown().await;
}

#[cfg(feature = "http")]
mod http {
    use super::*;
    use message_relay::HttpClient;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn delivers_signed_post_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header("content-type", "application/json"))
            .and(header("x-webhook-event", "class.created"))
            .and(header_exists("x-webhook-signature"))
            .and(header_exists("x-webhook-timestamp"))
            .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
            .expect(1)
            .mount(&server)
            .await;

        let storage = Arc::new(InMemoryStorage::new());
        let client = Arc::new(HttpClient::from_config(&config()).unwrap());
        let harness = start(storage, client);

        harness
            .publisher
            .register_subscription(&format!("{}/hooks", server.uri()), ["class.created"], None)
            .await
            .unwrap();
        let deliveries = harness
            .publisher
            .fan_out(&DomainEvent::new("class.created", json!({ "classId": "c-1" })))
            .await
            .unwrap();
        let delivered = wait_for_terminal(&harness.storage, &deliveries[0].id).await;

        assert_eq!(delivered.status, DeliveryStatus::Success);
        assert_eq!(delivered.response_status, Some(202));
        assert_eq!(delivered.response_body.as_deref(), Some("queued"));
        harness.worker.shutdown().await;
    }

    #[tokio::test]
    async fn slow_endpoint_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_millis(100), 3).unwrap();
        let result = client
            .post(WebhookRequest {
                url: server.uri(),
                headers: Vec::new(),
                body: b"{}".to_vec(),
                timeout: Duration::from_millis(100),
            })
            .await;
        assert_eq!(result, Err(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let client = HttpClient::new(Duration::from_secs(1), 3).unwrap();
        let result = client
            .post(WebhookRequest {
                url: "http://127.0.0.1:9/hooks".to_string(),
                headers: Vec::new(),
                body: Vec::new(),
                timeout: Duration::from_secs(1),
            })
            .await;
        assert!(matches!(result, Err(FailureReason::Network(_))));
    }
}
