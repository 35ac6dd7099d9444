use std::time::Duration;

use crate::types::{CorrelationId, DeliveryId, SubscriptionId};

/// Errors raised by the broker transport or the client built on top of it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped.
    /// Callers reconnect and retry.
    #[error("broker connection lost: {0}")]
    Disconnected(String),

    /// The client has been closed explicitly.
    #[error("broker client is closed")]
    Closed,

    /// Publishing or consuming on a queue that was never declared.
    #[error("queue not declared: {0}")]
    UnknownQueue(String),

    /// A delivery tag that this connection does not hold.
    #[error("unknown delivery tag {0}")]
    UnknownTag(u64),

    /// The message could not be encoded for the wire.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// A consumer is already registered for the queue.
    #[error("queue {0} already has a consumer")]
    AlreadyConsuming(String),
}

/// Failure returned by a message handler.
///
/// `Validation` and `Failed` reject the message without requeue and differ
/// only in logging. `InProgress` puts the message back on its queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The envelope or its payload is malformed. Never retried.
    #[error("invalid message: {0}")]
    Validation(String),

    /// Business logic failed while processing the message.
    #[error("handler failed: {0}")]
    Failed(String),

    /// Another delivery of the same message holds the claim and has not
    /// finished yet. The message is requeued.
    #[error("message {0} is still being processed")]
    InProgress(String),
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        HandlerError::Validation(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn in_progress(message_id: impl Into<String>) -> Self {
        HandlerError::InProgress(message_id.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt idempotency record for {key}: {cause}")]
    Corrupt { key: String, cause: String },
}

/// Errors observed by a request/reply caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No reply arrived within the configured window.
    #[error("no reply for {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    /// The remote handler failed and answered with an error reply.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// The coordinator stopped before a reply arrived.
    #[error("request/reply coordinator stopped")]
    Stopped,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to decode stored record: {0}")]
    Decode(String),
}

/// Errors surfaced by the webhook subsystem to its direct callers
/// (registration and queries). Delivery failures are never surfaced here;
/// they are recorded on the delivery itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid subscription: {0}")]
    Validation(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    /// The HTTP client could not be built.
    #[error("http client error: {0}")]
    Http(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

/// Reasons why a single HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("endpoint responded with status {0}")]
    Status(u16),

    #[error("subscription is missing or inactive")]
    SubscriptionUnavailable,
}
