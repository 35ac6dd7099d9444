#![cfg(feature = "api")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use message_relay::{webhooks_router, DueQueue, InMemoryStorage, RelayConfig, WebhookPublisher};

fn publisher() -> Arc<WebhookPublisher> {
    Arc::new(WebhookPublisher::new(
        &RelayConfig::default(),
        Arc::new(InMemoryStorage::new()),
        Arc::new(DueQueue::new()),
    ))
}

async fn send(publisher: &Arc<WebhookPublisher>, request: Request<Body>) -> (StatusCode, Value) {
    let response = webhooks_router(publisher.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_and_list_subscriptions() {
    let publisher = publisher();

    let (status, created) = send(
        &publisher,
        post_json(
            "/webhooks/subscriptions",
            json!({ "url": "https://crm.example/hooks", "events": ["enrollment.created"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["url"], "https://crm.example/hooks");
    assert_eq!(created["active"], true);
    assert!(created["secret"].as_str().unwrap().starts_with("whsec_"));

    let (status, listed) = send(&publisher, get("/webhooks/subscriptions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], created["id"]);
}

#[tokio::test]
async fn invalid_subscription_is_a_bad_request() {
    let publisher = publisher();
    let (status, body) = send(
        &publisher,
        post_json("/webhooks/subscriptions", json!({ "url": "not a url", "events": ["x"] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn deliveries_of_a_subscription() {
    let publisher = publisher();
    let subscription = publisher
        .register_subscription("https://crm.example/hooks", ["*"], None)
        .await
        .unwrap();
    publisher
        .fan_out(&message_relay::DomainEvent::new("class.created", json!({ "classId": "c-1" })))
        .await
        .unwrap();

    let (status, deliveries) = send(
        &publisher,
        get(&format!("/webhooks/subscriptions/{}/deliveries", subscription.id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deliveries[0]["event"], "class.created");
    assert_eq!(deliveries[0]["status"], "pending");
    assert_eq!(deliveries[0]["attempts"], 0);

    let (status, body) = send(&publisher, get("/webhooks/subscriptions/missing/deliveries")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "subscription_not_found");
}
