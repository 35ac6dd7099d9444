use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HandlerError;

/// Matches every event type in a subscription's event set.
pub const WILDCARD_EVENT: &str = "*";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Caller-assigned identifier of one logical operation.
    ///
    /// Two deliveries carrying the same `MessageId` are the same operation
    /// and must produce side effects at most once.
    MessageId
);

string_id!(
    /// Token linking a request to its eventual reply.
    CorrelationId
);

string_id!(SubscriptionId);

string_id!(DeliveryId);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl DeliveryId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The unit exchanged over the broker.
///
/// `correlation_id` and `reply_to` are only present on request/reply
/// exchanges and always travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    pub action: String,

    #[serde(default)]
    pub payload: Value,

    /// Set only on replies whose handler failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Create a one-way envelope with a fresh message id.
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Some(MessageId::generate()),
            correlation_id: None,
            reply_to: None,
            action: action.into(),
            payload,
            error: None,
        }
    }

    /// Use a caller-assigned message id (the idempotency key).
    pub fn with_message_id(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Turn this envelope into a request expecting a reply on `reply_to`.
    pub fn with_reply(mut self, correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id);
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Build the reply to this request carrying the handler's result.
    pub fn reply(&self, payload: Value) -> Self {
        Self {
            message_id: Some(MessageId::generate()),
            correlation_id: self.correlation_id.clone(),
            reply_to: None,
            action: self.action.clone(),
            payload,
            error: None,
        }
    }

    /// Build an error reply to this request.
    pub fn error_reply(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.reply(Value::Null)
        }
    }

    /// Error reply to a request that never decoded into an envelope.
    pub fn rejection(correlation_id: CorrelationId, action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message_id: Some(MessageId::generate()),
            correlation_id: Some(correlation_id),
            reply_to: None,
            action: action.into(),
            payload: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Returns the reply destination when this envelope is a request.
    pub fn reply_route(&self) -> Option<(&CorrelationId, &str)> {
        match (&self.correlation_id, &self.reply_to) {
            (Some(id), Some(to)) => Some((id, to.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.action.trim().is_empty() {
            return Err(HandlerError::validation("action is empty"));
        }
        if self.reply_to.is_some() && self.correlation_id.is_none() {
            return Err(HandlerError::validation("replyTo without correlationId"));
        }
        if let Some(ref reply_to) = self.reply_to {
            if reply_to.is_empty() {
                return Err(HandlerError::validation("replyTo is empty"));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandlerError> {
        serde_json::from_slice(bytes).map_err(|e| HandlerError::validation(e.to_string()))
    }
}

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyState {
    /// Claimed by a delivery whose side effect has not committed yet.
    /// Lives for the short claim lease only.
    Processing,
    /// The side effect committed. Lives for the full TTL.
    #[default]
    Processed,
}

/// Idempotency entry for one message id. Only a `Processed` record is
/// evidence that the message's side effects were committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    #[serde(default)]
    pub state: IdempotencyState,
    /// When the record entered its current state.
    pub processed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing() -> Self {
        Self {
            state: IdempotencyState::Processing,
            processed_at: Utc::now(),
        }
    }

    pub fn processed() -> Self {
        Self {
            state: IdempotencyState::Processed,
            processed_at: Utc::now(),
        }
    }

    pub fn is_processed(&self) -> bool {
        self.state == IdempotencyState::Processed
    }
}

/// A domain event raised by business logic and fanned out to webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A registered external endpoint interested in some or all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    pub url: String,
    pub events: BTreeSet<String>,
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(url: impl Into<String>, events: BTreeSet<String>, secret: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::generate(),
            url: url.into(),
            events,
            secret: secret.into(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether an event of `event_type` should be delivered here.
    pub fn matches(&self, event_type: &str) -> bool {
        self.active && (self.events.contains(WILDCARD_EVENT) || self.events.contains(event_type))
    }
}

/// Delivery lifecycle. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// One event pushed (or being pushed) to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Claim lease held by a worker while an attempt is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// A fresh `pending` delivery of `event` to `subscription`.
    pub fn pending(subscription: &Subscription, event: &DomainEvent) -> Self {
        Self {
            id: DeliveryId::generate(),
            subscription_id: subscription.id.clone(),
            event: event.event_type.clone(),
            payload: event.data.clone(),
            correlation_id: event.correlation_id.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_status: None,
            response_body: None,
            error_message: None,
            next_retry_at: None,
            locked_until: None,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    /// Whether a worker may claim this delivery at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && self.next_retry_at.map_or(true, |at| at <= now)
            && self.locked_until.map_or(true, |until| until <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_format_uses_camel_case_and_omits_absent_fields() {
        let envelope = Envelope::new("class.list", json!({}))
            .with_message_id("m-1");
        let wire: Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["messageId"], "m-1");
        assert_eq!(wire["action"], "class.list");
        assert!(wire.get("correlationId").is_none());
        assert!(wire.get("replyTo").is_none());
        assert!(wire.get("error").is_none());
    }

    #[test]
    fn envelope_accepts_minimal_wire_object() {
        let envelope = Envelope::from_bytes(br#"{"action":"enroll"}"#).unwrap();
        assert_eq!(envelope.message_id, None);
        assert_eq!(envelope.payload, Value::Null);
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn reply_to_requires_correlation_id() {
        let mut envelope = Envelope::new("enroll", json!({}));
        envelope.reply_to = Some("replies".into());
        assert!(matches!(envelope.validate(), Err(HandlerError::Validation(_))));

        let envelope = envelope.with_reply(CorrelationId::from("c-1"), "replies");
        assert!(envelope.validate().is_ok());
        assert_eq!(envelope.reply_route().map(|(_, to)| to), Some("replies"));
    }

    #[test]
    fn reply_keeps_correlation_and_drops_reply_to() {
        let request = Envelope::new("class.list", json!({}))
            .with_reply(CorrelationId::from("c-9"), "replies");
        let reply = request.error_reply("boom");

        assert_eq!(reply.correlation_id, Some(CorrelationId::from("c-9")));
        assert_eq!(reply.reply_to, None);
        assert_eq!(reply.error.as_deref(), Some("boom"));
        assert_ne!(reply.message_id, request.message_id);
    }

    #[test]
    fn wildcard_subscription_matches_everything_while_active() {
        let mut subscription = Subscription::new(
            "https://hooks.example.com",
            [WILDCARD_EVENT.to_string()].into_iter().collect(),
            "s",
        );
        assert!(subscription.matches("enrollment.created"));

        subscription.active = false;
        assert!(!subscription.matches("enrollment.created"));
    }

    #[test]
    fn leased_delivery_is_not_claimable_until_lease_expires() {
        let subscription = Subscription::new("https://a", BTreeSet::new(), "s");
        let mut delivery = Delivery::pending(&subscription, &DomainEvent::new("x", json!(1)));
        let now = Utc::now();
        assert!(delivery.is_claimable(now));

        delivery.locked_until = Some(now + chrono::Duration::seconds(5));
        assert!(!delivery.is_claimable(now));
        assert!(delivery.is_claimable(now + chrono::Duration::seconds(5)));

        delivery.status = DeliveryStatus::Success;
        assert!(!delivery.is_claimable(now + chrono::Duration::seconds(60)));
    }
}
