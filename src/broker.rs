//! Broker client: connection lifecycle, queue topology, publishing and
//! per-queue consumer loops.
//!
//! The broker itself is reached through the [`Connector`] and
//! [`Connection`] traits so the client logic (ack/reject discipline,
//! replies, reconnects) is shared by every transport.
//!
//! ## Delivery contract
//! - Exactly one ack or reject per delivered message
//! - At most one reply per request
//! - Failed handlers reject without requeue
//! - Unacknowledged messages are redelivered after a reconnect

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::RelayConfig;
use crate::error::{BrokerError, HandlerError};
use crate::telemetry::{metric_inc, metric_inc_queue};
use crate::types::{CorrelationId, Envelope};

/// How long a consumer waits on an empty queue before re-checking state.
const RECEIVE_WAIT: Duration = Duration::from_millis(250);

/// Pause before requeueing a message another delivery is still working on.
const REQUEUE_DELAY: Duration = Duration::from_millis(100);

/// Action of error replies to requests that could not be decoded.
const REJECTED_ACTION: &str = "rejected";

pub type DeliveryTag = u64;

/// Transport-level message properties, mirrored from the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub persistent: bool,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub tag: DeliveryTag,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Set when the broker has handed this message out before.
    pub redelivered: bool,
}

/// A live connection (and channel) to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next message. The message stays
    /// unacknowledged until [`Connection::ack`] or [`Connection::reject`].
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn reject(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Close the connection. Unacknowledged messages go back to their queues.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, heartbeat: Duration) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// Options for a single publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub persistent: bool,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::persistent()
    }
}

impl PublishOptions {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn transient() -> Self {
        Self {
            persistent: false,
            ..Self::persistent()
        }
    }

    pub fn with_reply(mut self, correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id);
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Business logic invoked for every message on a consumed queue.
///
/// The returned value becomes the reply payload when the message is a
/// request; it is ignored otherwise.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: &Envelope) -> Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        (self.0)(envelope.clone()).await
    }
}

/// Connection parameters for [`BrokerClient::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub heartbeat: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Prefetch used by [`BrokerClient::consume_default`].
    pub prefetch: usize,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = RelayConfig::default();
        Self {
            url: url.into(),
            heartbeat: defaults.heartbeat,
            reconnect_base: defaults.reconnect_base,
            reconnect_max: defaults.reconnect_max,
            prefetch: defaults.prefetch,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_reconnect(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

impl From<&RelayConfig> for ConnectOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            url: config.broker_url.clone(),
            heartbeat: config.heartbeat,
            reconnect_base: config.reconnect_base,
            reconnect_max: config.reconnect_max,
            prefetch: config.prefetch.max(1),
        }
    }
}

/// Handle to an open broker connection.
///
/// Cheap to clone; all clones share the connection, the declared topology
/// and the consumer registry. The client lives until [`BrokerClient::close`].
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    /// Current connection and its generation.
    connection: RwLock<Option<(Arc<dyn Connection>, u64)>>,
    reconnect_lock: Mutex<()>,
    /// Declared queues and their durability, replayed on reconnect.
    topology: Mutex<BTreeMap<String, bool>>,
    consumers: Mutex<HashMap<String, Consumer>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

struct Consumer {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BrokerClient {
    /// Open a connection through `connector`.
    pub async fn connect(connector: Arc<dyn Connector>, options: ConnectOptions) -> Result<Self, BrokerError> {
        let connection = connector.connect(&options.url, options.heartbeat).await?;
        info!(url = %options.url, "broker connection opened");

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ClientInner {
                connector,
                options,
                connection: RwLock::new(Some((connection, 0))),
                reconnect_lock: Mutex::new(()),
                topology: Mutex::new(BTreeMap::new()),
                consumers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Declare a queue and remember it for re-declaration after reconnects.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.inner.topology.lock().await.insert(name.to_string(), durable);

        let (connection, generation) = self.connection().await?;
        match connection.declare_queue(name, durable).await {
            Ok(()) => {
                debug!(queue = name, durable, "queue declared");
                Ok(())
            }
            // A reconnect replays the whole topology, including this queue.
            Err(BrokerError::Disconnected(reason)) => {
                warn!(queue = name, %reason, "declare failed, reconnecting");
                self.reconnect(generation).await
            }
            Err(err) => Err(err),
        }
    }

    /// Publish `envelope` on `queue`.
    ///
    /// Correlation fields set in `options` are written into the envelope so
    /// the wire body and the transport properties always agree.
    pub async fn publish(
        &self,
        queue: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut envelope = envelope.clone();
        if let Some(correlation_id) = options.correlation_id {
            envelope.correlation_id = Some(correlation_id);
        }
        if let Some(reply_to) = options.reply_to {
            envelope.reply_to = Some(reply_to);
        }

        let message = OutboundMessage {
            properties: MessageProperties {
                persistent: options.persistent,
                correlation_id: envelope.correlation_id.clone(),
                reply_to: envelope.reply_to.clone(),
            },
            body: envelope.to_bytes().map_err(|e| BrokerError::Encode(e.to_string()))?,
        };

        let (connection, generation) = self.connection().await?;
        match connection.publish(queue, message.clone()).await {
            Ok(()) => {}
            Err(BrokerError::Disconnected(reason)) => {
                warn!(queue, %reason, "publish failed, reconnecting");
                self.reconnect(generation).await?;
                let (connection, _) = self.connection().await?;
                connection.publish(queue, message).await?;
            }
            Err(err) => return Err(err),
        }

        metric_inc_queue("broker.publish", queue);
        debug!(
            queue,
            action = %envelope.action,
            message_id = ?envelope.message_id,
            "message published"
        );
        Ok(())
    }

    /// Start the consumer loop for `queue`.
    ///
    /// At most `prefetch` messages are handled concurrently; `prefetch = 1`
    /// processes the queue strictly one message at a time. A queue has at
    /// most one consumer per client.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        prefetch: usize,
    ) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }

        let durable = self.inner.topology.lock().await.get(queue).copied();
        if durable.is_none() {
            self.declare_queue(queue, true).await?;
        }

        let mut consumers = self.inner.consumers.lock().await;
        if let Some(existing) = consumers.get(queue) {
            if !existing.handle.is_finished() {
                return Err(BrokerError::AlreadyConsuming(queue.to_string()));
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(consume_loop(
            self.clone(),
            queue.to_string(),
            handler,
            prefetch.max(1),
            stop_rx,
            self.inner.shutdown_tx.subscribe(),
        ));
        consumers.insert(queue.to_string(), Consumer { stop_tx, handle });
        info!(queue, prefetch, "consumer started");
        Ok(())
    }

    /// Start the consumer loop for `queue` with the prefetch from the
    /// connect options.
    pub async fn consume_default(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        self.consume(queue, handler, self.inner.options.prefetch).await
    }

    /// Stop the consumer for `queue`, if any, and wait for its loop to end.
    pub async fn stop_consumer(&self, queue: &str) {
        let consumer = self.inner.consumers.lock().await.remove(queue);
        if let Some(consumer) = consumer {
            let _ = consumer.stop_tx.send(true);
            let _ = consumer.handle.await;
            info!(queue, "consumer stopped");
        }
    }

    /// Stop every consumer and close the connection.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        let consumers: Vec<Consumer> = {
            let mut guard = self.inner.consumers.lock().await;
            guard.drain().map(|(_, consumer)| consumer).collect()
        };
        for consumer in consumers {
            let _ = consumer.handle.await;
        }

        let connection = self.inner.connection.write().await.take();
        if let Some((connection, _)) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "error while closing broker connection");
            }
        }
        info!("broker client closed");
    }

    async fn connection(&self) -> Result<(Arc<dyn Connection>, u64), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }
        self.inner
            .connection
            .read()
            .await
            .clone()
            .ok_or(BrokerError::Closed)
    }

    /// Replace the connection that failed at `failed_generation`.
    ///
    /// Concurrent callers that observed the same failure wait for one
    /// reconnect instead of each opening their own connection.
    async fn reconnect(&self, failed_generation: u64) -> Result<(), BrokerError> {
        let _guard = self.inner.reconnect_lock.lock().await;

        let current = self.inner.connection.read().await.as_ref().map(|(_, g)| *g);
        match current {
            None => return Err(BrokerError::Closed),
            Some(generation) if generation != failed_generation => return Ok(()),
            Some(_) => {}
        }

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let options = &self.inner.options;
        for delay in Backoff::new(options.reconnect_base, options.reconnect_max) {
            if !self.is_open() {
                return Err(BrokerError::Closed);
            }

            match self.open_with_topology().await {
                Ok(connection) => {
                    let old = self
                        .inner
                        .connection
                        .write()
                        .await
                        .replace((connection, failed_generation + 1));
                    if let Some((old, _)) = old {
                        let _ = old.close().await;
                    }
                    metric_inc("broker.reconnect");
                    info!(generation = failed_generation + 1, "broker connection re-established");
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, retry_in = ?delay, "broker reconnect failed");
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => return Err(BrokerError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(BrokerError::Closed)
    }

    async fn open_with_topology(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let options = &self.inner.options;
        let connection = self.inner.connector.connect(&options.url, options.heartbeat).await?;

        let topology = self.inner.topology.lock().await.clone();
        for (queue, durable) in topology {
            if let Err(err) = connection.declare_queue(&queue, durable).await {
                let _ = connection.close().await;
                return Err(err);
            }
        }
        Ok(connection)
    }
}

async fn consume_loop(
    client: BrokerClient,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    prefetch: usize,
    mut stop_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(prefetch));

    loop {
        if !client.is_open() || *stop_rx.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = stop_rx.changed() => break,
            _ = shutdown_rx.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Ok((connection, generation)) = client.connection().await else { break };

        let received = tokio::select! {
            _ = stop_rx.changed() => break,
            _ = shutdown_rx.changed() => break,
            received = connection.receive(&queue, RECEIVE_WAIT) => received,
        };

        match received {
            Ok(Some(message)) => {
                tokio::spawn(handle_delivery(
                    client.clone(),
                    connection,
                    queue.clone(),
                    message,
                    handler.clone(),
                    permit,
                ));
            }
            Ok(None) => {}
            Err(err) => {
                drop(permit);
                warn!(queue = %queue, error = %err, "consumer lost its connection");
                if client.reconnect(generation).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(queue = %queue, "consumer loop finished");
}

/// Run the handler for one delivered message and settle it.
async fn handle_delivery(
    client: BrokerClient,
    connection: Arc<dyn Connection>,
    queue: String,
    message: InboundMessage,
    handler: Arc<dyn MessageHandler>,
    _permit: OwnedSemaphorePermit,
) {
    let tag = message.tag;
    if message.redelivered {
        debug!(queue = %queue, tag, "handling redelivered message");
    }

    let envelope = match decode(&message) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(queue = %queue, tag, error = %err, "rejecting malformed message");
            metric_inc_queue("broker.message.malformed", &queue);
            if let Some((correlation_id, reply_to)) = salvage_reply_route(&message) {
                let reply = Envelope::rejection(correlation_id, REJECTED_ACTION, err.to_string());
                if let Err(publish_err) = client.publish(&reply_to, &reply, PublishOptions::transient()).await {
                    warn!(reply_to = %reply_to, error = %publish_err, "failed to publish error reply");
                }
            }
            settle(&connection, &queue, tag, Settle::Reject).await;
            return;
        }
    };

    match handler.handle(&envelope).await {
        Ok(result) => {
            if let Some((correlation_id, reply_to)) = envelope.reply_route() {
                let reply = envelope.reply(result);
                if let Err(err) = client.publish(reply_to, &reply, PublishOptions::transient()).await {
                    error!(
                        queue = %queue,
                        reply_to,
                        correlation_id = %correlation_id,
                        error = %err,
                        "failed to publish reply"
                    );
                    settle(&connection, &queue, tag, Settle::Reject).await;
                    return;
                }
            }
            metric_inc_queue("broker.message.handled", &queue);
            settle(&connection, &queue, tag, Settle::Ack).await;
        }
        Err(HandlerError::InProgress(message_id)) => {
            debug!(queue = %queue, tag, message_id = %message_id, "message busy elsewhere, requeueing");
            metric_inc_queue("broker.message.requeued", &queue);
            tokio::time::sleep(REQUEUE_DELAY).await;
            settle(&connection, &queue, tag, Settle::Requeue).await;
        }
        Err(err) => {
            match &err {
                HandlerError::Validation(_) => warn!(
                    queue = %queue,
                    action = %envelope.action,
                    message_id = ?envelope.message_id,
                    error = %err,
                    "message failed validation"
                ),
                _ => error!(
                    queue = %queue,
                    action = %envelope.action,
                    message_id = ?envelope.message_id,
                    error = %err,
                    "message handler failed"
                ),
            }

            if let Some((_, reply_to)) = envelope.reply_route() {
                let reply = envelope.error_reply(err.to_string());
                if let Err(publish_err) = client.publish(reply_to, &reply, PublishOptions::transient()).await {
                    warn!(reply_to, error = %publish_err, "failed to publish error reply");
                }
            }
            metric_inc_queue("broker.message.rejected", &queue);
            settle(&connection, &queue, tag, Settle::Reject).await;
        }
    }
}

fn decode(message: &InboundMessage) -> Result<Envelope, HandlerError> {
    let mut envelope = Envelope::from_bytes(&message.body)?;
    if envelope.correlation_id.is_none() {
        envelope.correlation_id = message.properties.correlation_id.clone();
    }
    if envelope.reply_to.is_none() {
        envelope.reply_to = message.properties.reply_to.clone();
    }
    envelope.validate()?;
    Ok(envelope)
}

/// Reply route of a message whose envelope failed to decode or validate,
/// taken from the transport properties or, failing that, the raw JSON.
fn salvage_reply_route(message: &InboundMessage) -> Option<(CorrelationId, String)> {
    let raw: Option<Value> = serde_json::from_slice(&message.body).ok();
    let field = |name: &str| {
        raw.as_ref()
            .and_then(|raw| raw.get(name))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let correlation_id = message
        .properties
        .correlation_id
        .clone()
        .or_else(|| field("correlationId").map(CorrelationId::from))?;
    let reply_to = message
        .properties
        .reply_to
        .clone()
        .filter(|reply_to| !reply_to.is_empty())
        .or_else(|| field("replyTo"))?;
    Some((correlation_id, reply_to))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Reject,
    Requeue,
}

/// Settle one delivery.
///
/// A failure here means the connection is gone; the broker redelivers the
/// message after the reconnect.
async fn settle(connection: &Arc<dyn Connection>, queue: &str, tag: DeliveryTag, outcome: Settle) {
    let result = match outcome {
        Settle::Ack => connection.ack(queue, tag).await,
        Settle::Reject => connection.reject(queue, tag, false).await,
        Settle::Requeue => connection.reject(queue, tag, true).await,
    };
    if let Err(err) = result {
        warn!(queue, tag, ?outcome, error = %err, "failed to settle message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(properties: MessageProperties, body: &str) -> InboundMessage {
        InboundMessage {
            tag: 1,
            properties,
            body: body.as_bytes().to_vec(),
            redelivered: false,
        }
    }

    #[test]
    fn reply_route_comes_from_properties_first() {
        let message = inbound(
            MessageProperties {
                persistent: true,
                correlation_id: Some(CorrelationId::from("c-1")),
                reply_to: Some("replies".into()),
            },
            "not json",
        );
        assert_eq!(
            salvage_reply_route(&message),
            Some((CorrelationId::from("c-1"), "replies".to_string()))
        );
    }

    #[test]
    fn reply_route_falls_back_to_raw_body() {
        let message = inbound(
            MessageProperties::default(),
            r#"{"action":"","correlationId":"c-2","replyTo":"class.replies"}"#,
        );
        assert_eq!(
            salvage_reply_route(&message),
            Some((CorrelationId::from("c-2"), "class.replies".to_string()))
        );
    }

    #[test]
    fn one_way_messages_have_no_reply_route() {
        assert_eq!(salvage_reply_route(&inbound(MessageProperties::default(), "garbage")), None);
        let half = inbound(MessageProperties::default(), r#"{"correlationId":"c-3","replyTo":""}"#);
        assert_eq!(salvage_reply_route(&half), None);
    }

    #[test]
    fn connect_options_take_prefetch_from_config() {
        let config = RelayConfig {
            prefetch: 8,
            ..RelayConfig::default()
        };
        assert_eq!(ConnectOptions::from(&config).prefetch, 8);
        assert_eq!(ConnectOptions::new("memory://").with_prefetch(0).prefetch, 1);
    }
}
