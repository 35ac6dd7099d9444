//! HTTP surface for subscription registration and delivery history.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::WebhookError;
use crate::publisher::WebhookPublisher;
use crate::types::{Delivery, Subscription, SubscriptionId};

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// JSON error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            WebhookError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            WebhookError::SubscriptionNotFound(_) => (StatusCode::NOT_FOUND, "subscription_not_found"),
            WebhookError::DeliveryNotFound(_) => (StatusCode::NOT_FOUND, "delivery_not_found"),
            WebhookError::Http(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            WebhookError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn webhooks_router(publisher: Arc<WebhookPublisher>) -> Router {
    Router::new()
        .route(
            "/webhooks/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route("/webhooks/subscriptions/:id/deliveries", get(list_deliveries))
        .with_state(publisher)
}

async fn create_subscription(
    State(publisher): State<Arc<WebhookPublisher>>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), WebhookError> {
    let subscription = publisher
        .register_subscription(&request.url, request.events, request.secret)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn list_subscriptions(
    State(publisher): State<Arc<WebhookPublisher>>,
) -> Result<Json<Vec<Subscription>>, WebhookError> {
    Ok(Json(publisher.get_subscriptions().await?))
}

async fn list_deliveries(
    State(publisher): State<Arc<WebhookPublisher>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Delivery>>, WebhookError> {
    Ok(Json(publisher.deliveries(&SubscriptionId::from(id)).await?))
}
