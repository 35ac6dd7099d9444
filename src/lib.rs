//! Asynchronous messaging for the gym-management backend.
//!
//! This crate provides the plumbing between services:
//! - a broker client with per-queue consumers and reconnects
//! - an idempotent-consumer guard keyed by message id
//! - request/reply over the broker with correlation ids and timeouts
//! - webhook fan-out of domain events with signed, retried deliveries
//!
//! ## Guarantees
//! - At-least-once delivery from the broker
//! - At-most-once side effects per message id (with [`IdempotentHandler`])
//! - Exactly one ack or reject per delivered message
//! - Request/reply calls end within their timeout, broker outages included
//! - Serialized attempts per webhook delivery, bounded retries
//!
//! ## Non-Guarantees
//! - Ordering across deliveries or queues
//! - Exactly-once webhook receipt (subscribers see retries)
//! - Dead-letter queues or replay
//!
//! Event publication never fails the caller; problems are logged and the
//! delivery history records every webhook attempt.

mod backoff;
mod broker;
mod broker_memory;
mod config;
mod error;
mod idempotency;
mod publisher;
mod rpc;
mod scheduler;
mod signing;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "api")]
mod api;

#[cfg(feature = "redis")]
mod broker_redis;

#[cfg(feature = "redis")]
mod idempotency_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use backoff::{Backoff, RetryPolicy};
pub use broker::{
    handler_fn, BrokerClient, ConnectOptions, Connection, Connector, DeliveryTag, FnHandler, InboundMessage,
    MessageHandler, MessageProperties, OutboundMessage, PublishOptions,
};
pub use broker_memory::MemoryBroker;
pub use config::RelayConfig;
pub use error::{
    BrokerError, ConfigError, FailureReason, HandlerError, IdempotencyError, RequestError, StorageError,
    WebhookError,
};
pub use idempotency::{Claim, IdempotencyGuard, IdempotencyStore, IdempotentHandler, MemoryIdempotencyStore};
pub use publisher::WebhookPublisher;
pub use rpc::RequestReplyCoordinator;
pub use scheduler::DueQueue;
pub use signing::{
    build_signature_headers, compute_signature, is_timestamp_fresh, parse_signature_headers, verify_signature,
    verify_webhook_request, ParsedSignature, SignatureHeaders, VerificationError, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use storage::{InMemoryStorage, Storage};
pub use types::{
    CorrelationId, Delivery, DeliveryId, DeliveryStatus, DomainEvent, Envelope, IdempotencyRecord, IdempotencyState,
    MessageId, Subscription, SubscriptionId, WILDCARD_EVENT,
};
pub use worker::{
    apply_outcome, WebhookClient, WebhookDeliveryWorker, WebhookRequest, WebhookResponse, DELIVERY_HEADER,
    EVENT_HEADER,
};

#[cfg(feature = "http")]
pub use worker::HttpClient;

#[cfg(feature = "api")]
pub use api::{webhooks_router, CreateSubscriptionRequest, ErrorResponse};

#[cfg(feature = "redis")]
pub use broker_redis::RedisConnector;

#[cfg(feature = "redis")]
pub use idempotency_redis::RedisIdempotencyStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
