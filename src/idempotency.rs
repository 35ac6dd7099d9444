//! Idempotent-consumer guard.
//!
//! A `processed` record under a message id means that message's side
//! effects have been committed once. The guard offers the classic
//! check/mark pair and an atomic claim. Only the claim is race-free: two
//! deliveries of the same id can both pass `is_processed` before either
//! calls `mark_processed`.
//!
//! A claim first writes a short-lived `processing` record. It becomes
//! `processed` (full TTL) only after the handler succeeds, and is removed
//! when the handler fails. A delivery that finds `processing` is requeued
//! rather than treated as a duplicate, so a redelivery racing a still
//! running attempt is never acknowledged away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::broker::MessageHandler;
use crate::config::RelayConfig;
use crate::error::{HandlerError, IdempotencyError};
use crate::telemetry::metric_inc;
use crate::types::{Envelope, IdempotencyRecord, MessageId};

/// Default lifetime of a `processing` claim.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(30);

/// Result of [`IdempotencyGuard::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This delivery owns the message and must run its side effect.
    Acquired,
    /// Another delivery holds an unexpired `processing` claim.
    InProgress,
    /// The side effect already committed.
    Processed,
}

/// Key-value cache with per-entry TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Store `record` unless a live entry exists. Returns `true` if stored.
    async fn set_if_absent(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError>;

    async fn set(&self, key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<(), IdempotencyError>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    async fn remove(&self, key: &str) -> Result<(), IdempotencyError>;
}

/// Process-local store. Expired entries are dropped lazily.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (IdempotencyRecord, Instant)>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.len()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn set_if_absent(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (record.clone(), now + ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<(), IdempotencyError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (record.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((record, expires_at)) if *expires_at > now => Ok(Some(record.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), IdempotencyError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Dedup cache keyed by message id.
///
/// Share one guard (or one backing store) across every consumer of a
/// logical queue, otherwise duplicates routed to different consumers are
/// not detected.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    claim_lease: Duration,
    namespace: String,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            claim_lease: DEFAULT_CLAIM_LEASE.min(ttl),
            namespace: "processed".to_string(),
        }
    }

    /// Guard backed by a fresh process-local store.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryIdempotencyStore::new()), ttl)
    }

    /// Guard for `config`: Redis when `cache_url` is set, process memory
    /// otherwise.
    pub fn from_config(config: &RelayConfig) -> Result<Self, IdempotencyError> {
        let store: Arc<dyn IdempotencyStore> = match config.cache_url.as_deref() {
            None => Arc::new(MemoryIdempotencyStore::new()),
            Some(url) => shared_store(url)?,
        };
        Ok(Self::new(store, config.idempotency_ttl).with_claim_lease(config.claim_lease))
    }

    /// Prefix keys so several consumers can share one store.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// How long an unfinished claim blocks other deliveries.
    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease.min(self.ttl);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    fn key(&self, message_id: &MessageId) -> String {
        format!("idempotency:{}:{}", self.namespace, message_id)
    }

    /// `true` once the message's side effect has committed. An in-progress
    /// claim does not count.
    pub async fn is_processed(&self, message_id: &MessageId) -> Result<bool, IdempotencyError> {
        Ok(self
            .store
            .get(&self.key(message_id))
            .await?
            .is_some_and(|record| record.is_processed()))
    }

    /// Record `message_id` as processed. Call only after the side effect
    /// is durably committed.
    pub async fn mark_processed(&self, message_id: &MessageId) -> Result<(), IdempotencyError> {
        self.store
            .set(&self.key(message_id), &IdempotencyRecord::processed(), self.ttl)
            .await
    }

    pub async fn get_info(&self, message_id: &MessageId) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        self.store.get(&self.key(message_id)).await
    }

    /// Atomically claim `message_id` for this delivery.
    ///
    /// An acquired claim is a `processing` record that expires after the
    /// claim lease; finish it with [`IdempotencyGuard::mark_processed`] or
    /// [`IdempotencyGuard::release`].
    pub async fn try_claim(&self, message_id: &MessageId) -> Result<Claim, IdempotencyError> {
        let key = self.key(message_id);
        let stored = self
            .store
            .set_if_absent(&key, &IdempotencyRecord::processing(), self.claim_lease)
            .await?;
        if stored {
            return Ok(Claim::Acquired);
        }

        match self.store.get(&key).await? {
            Some(record) if record.is_processed() => Ok(Claim::Processed),
            // Expired between the two calls; the next delivery claims it.
            _ => Ok(Claim::InProgress),
        }
    }

    /// Drop a claim whose side effect did not happen.
    pub async fn release(&self, message_id: &MessageId) -> Result<(), IdempotencyError> {
        self.store.remove(&self.key(message_id)).await
    }
}

#[cfg(feature = "redis")]
fn shared_store(url: &str) -> Result<Arc<dyn IdempotencyStore>, IdempotencyError> {
    Ok(Arc::new(crate::idempotency_redis::RedisIdempotencyStore::open(url, "relay")?))
}

#[cfg(not(feature = "redis"))]
fn shared_store(url: &str) -> Result<Arc<dyn IdempotencyStore>, IdempotencyError> {
    Err(IdempotencyError::Unavailable(format!(
        "cache {url} needs the `redis` feature"
    )))
}

/// Wraps a handler so each message id is processed at most once.
///
/// Duplicates of a committed message are answered with
/// `{"status": "duplicate"}` and acknowledged without running the inner
/// handler. A delivery that races an unfinished one is requeued. Messages
/// without an id are rejected.
pub struct IdempotentHandler<H> {
    guard: IdempotencyGuard,
    inner: H,
}

impl<H: MessageHandler> IdempotentHandler<H> {
    pub fn new(guard: IdempotencyGuard, inner: H) -> Self {
        Self { guard, inner }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for IdempotentHandler<H> {
    async fn handle(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let message_id = envelope
            .message_id
            .as_ref()
            .ok_or_else(|| HandlerError::validation("messageId is required"))?;

        let claim = self.guard.try_claim(message_id).await.map_err(|e| {
            error!(message_id = %message_id, error = %e, "idempotency check failed");
            HandlerError::failed(e.to_string())
        })?;

        match claim {
            Claim::Acquired => {}
            Claim::Processed => {
                debug!(message_id = %message_id, action = %envelope.action, "skipping duplicate message");
                metric_inc("idempotency.duplicate");
                return Ok(json!({ "status": "duplicate", "messageId": message_id }));
            }
            Claim::InProgress => {
                debug!(message_id = %message_id, action = %envelope.action, "message claimed by another delivery");
                metric_inc("idempotency.in_progress");
                return Err(HandlerError::in_progress(message_id.as_str()));
            }
        }

        match self.inner.handle(envelope).await {
            Ok(result) => {
                // The side effect is done; a lost record only risks a repeat.
                if let Err(err) = self.guard.mark_processed(message_id).await {
                    error!(message_id = %message_id, error = %err, "failed to record processed message");
                }
                Ok(result)
            }
            Err(err) => {
                if let Err(release_err) = self.guard.release(message_id).await {
                    warn!(
                        message_id = %message_id,
                        error = %release_err,
                        "failed to release idempotency claim"
                    );
                }
                Err(err)
            }
        }
    }
}
