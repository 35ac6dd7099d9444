//! Request/reply over the broker.
//!
//! Each call is tagged with a fresh correlation id and parked as a waiter
//! until the reply consumer hands it the matching reply or the timeout
//! fires. Replies are matched by correlation id only, so they may arrive
//! in any order. A reply nobody waits for (late, duplicate, foreign) is
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::broker::{BrokerClient, MessageHandler, PublishOptions};
use crate::config::RelayConfig;
use crate::error::{BrokerError, HandlerError, RequestError};
use crate::telemetry::metric_inc;
use crate::types::{CorrelationId, Envelope};

/// Concurrent replies handled by the reply consumer.
const REPLY_PREFETCH: usize = 16;

type Waiters = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Envelope>>>>;

fn lock_waiters(waiters: &Waiters) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Envelope>>> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RequestReplyCoordinator {
    client: BrokerClient,
    reply_queue: String,
    waiters: Waiters,
    default_timeout: Duration,
}

impl RequestReplyCoordinator {
    /// Declare `reply_queue` and start demultiplexing replies from it.
    pub async fn start(
        client: BrokerClient,
        reply_queue: impl Into<String>,
        default_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let reply_queue = reply_queue.into();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));

        client.declare_queue(&reply_queue, true).await?;
        client
            .consume(
                &reply_queue,
                Arc::new(ReplyDemux { waiters: waiters.clone() }),
                REPLY_PREFETCH,
            )
            .await?;

        Ok(Self {
            client,
            reply_queue,
            waiters,
            default_timeout,
        })
    }

    /// Start with the configured request timeout as the default.
    pub async fn from_config(
        client: BrokerClient,
        reply_queue: impl Into<String>,
        config: &RelayConfig,
    ) -> Result<Self, BrokerError> {
        Self::start(client, reply_queue, config.request_timeout).await
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock_waiters(&self.waiters).len()
    }

    /// Send `action` to `queue` and wait for the reply with the default timeout.
    pub async fn call(&self, queue: &str, action: &str, payload: Value) -> Result<Value, RequestError> {
        self.call_with_timeout(queue, action, payload, self.default_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        queue: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let correlation_id = CorrelationId::generate();
        let (reply_tx, reply_rx) = oneshot::channel();
        // One deadline covers publishing (which may sit in reconnect) and waiting.
        let deadline = Instant::now() + timeout;

        // Released on every exit path, including caller cancellation.
        let _slot = WaiterSlot::register(&self.waiters, correlation_id.clone(), reply_tx);

        let request = Envelope::new(action, payload);
        let options = PublishOptions::persistent().with_reply(correlation_id.clone(), &self.reply_queue);
        match timeout_at(deadline, self.client.publish(queue, &request, options)).await {
            Ok(published) => published?,
            Err(_) => return Err(self.timed_out(queue, action, correlation_id, timeout)),
        }
        debug!(queue, action, correlation_id = %correlation_id, "request sent");

        match timeout_at(deadline, reply_rx).await {
            Ok(Ok(reply)) => {
                metric_inc("rpc.replied");
                match reply.error {
                    Some(error) => Err(RequestError::Remote(error)),
                    None => Ok(reply.payload),
                }
            }
            Ok(Err(_)) => Err(RequestError::Stopped),
            Err(_) => Err(self.timed_out(queue, action, correlation_id, timeout)),
        }
    }

    fn timed_out(&self, queue: &str, action: &str, correlation_id: CorrelationId, timeout: Duration) -> RequestError {
        metric_inc("rpc.timed_out");
        warn!(queue, action, correlation_id = %correlation_id, ?timeout, "request timed out");
        RequestError::Timeout { correlation_id, timeout }
    }

    /// Stop the reply consumer. Outstanding calls fail with `Stopped`.
    pub async fn stop(&self) {
        self.client.stop_consumer(&self.reply_queue).await;
        lock_waiters(&self.waiters).clear();
    }
}

/// Pending-waiter registration, removed from the map on drop.
struct WaiterSlot {
    waiters: Waiters,
    correlation_id: CorrelationId,
}

impl WaiterSlot {
    fn register(waiters: &Waiters, correlation_id: CorrelationId, reply_tx: oneshot::Sender<Envelope>) -> Self {
        lock_waiters(waiters).insert(correlation_id.clone(), reply_tx);
        Self {
            waiters: waiters.clone(),
            correlation_id,
        }
    }
}

impl Drop for WaiterSlot {
    fn drop(&mut self) {
        lock_waiters(&self.waiters).remove(&self.correlation_id);
    }
}

struct ReplyDemux {
    waiters: Waiters,
}

#[async_trait]
impl MessageHandler for ReplyDemux {
    async fn handle(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let Some(ref correlation_id) = envelope.correlation_id else {
            debug!(action = %envelope.action, "discarding reply without correlation id");
            return Ok(Value::Null);
        };

        let waiter = lock_waiters(&self.waiters).remove(correlation_id);
        match waiter {
            Some(reply_tx) => {
                if reply_tx.send(envelope.clone()).is_err() {
                    debug!(correlation_id = %correlation_id, "caller gave up before reply arrived");
                }
            }
            None => {
                metric_inc("rpc.reply.unmatched");
                debug!(correlation_id = %correlation_id, "discarding reply with no waiting call");
            }
        }
        Ok(Value::Null)
    }
}
