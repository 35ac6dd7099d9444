use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::broker::{
    Connection, Connector, DeliveryTag, InboundMessage, MessageProperties, OutboundMessage,
};
use crate::error::BrokerError;

/// In-process broker with durable queues and at-least-once delivery.
///
/// Each connection tracks the messages it has received but not yet
/// settled. Closing a connection, or severing all of them with
/// [`MemoryBroker::disconnect_all`], puts those messages back at the head
/// of their queues flagged as redelivered.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    unacked: Mutex<HashMap<DeliveryTag, Unacked>>,
    next_tag: AtomicU64,
    next_connection: AtomicU64,
    /// Bumped by `disconnect_all`; connections from older epochs are dead.
    epoch: AtomicU64,
    unreachable: AtomicBool,
}

struct MemoryQueue {
    durable: bool,
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

#[derive(Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.ready).push_front(message);
        self.notify.notify_one();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrokerState {
    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>, BrokerError> {
        lock(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    /// Return every unsettled message matching `filter` to its queue.
    fn requeue_unacked<F>(&self, filter: F)
    where
        F: Fn(&Unacked) -> bool,
    {
        let released: Vec<Unacked> = {
            let mut unacked = lock(&self.unacked);
            let mut tags: Vec<DeliveryTag> = unacked
                .iter()
                .filter(|(_, entry)| filter(entry))
                .map(|(tag, _)| *tag)
                .collect();
            // Highest tag first so pushing to the front restores delivery order.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            tags.into_iter().filter_map(|tag| unacked.remove(&tag)).collect()
        };

        for entry in released {
            if let Ok(queue) = self.queue(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.push_front(message);
            }
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sever every open connection. Their unsettled messages are requeued.
    pub fn disconnect_all(&self) {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        self.state.requeue_unacked(|_| true);
        for queue in lock(&self.state.queues).values() {
            queue.notify.notify_waiters();
        }
    }

    /// Make new connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Messages waiting in `queue`, not counting unsettled ones.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .queue(queue)
            .map(|q| lock(&q.ready).len())
            .unwrap_or(0)
    }

    /// Messages handed to consumers and not yet settled, across all queues.
    pub fn unacked_count(&self) -> usize {
        lock(&self.state.unacked).len()
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.state.queue(queue).ok().map(|q| q.durable)
    }

    /// Append raw bytes to `queue`, bypassing envelope encoding.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        self.state.queue(queue)?.push_back(StoredMessage {
            properties: MessageProperties::default(),
            body: body.into(),
            redelivered: false,
        });
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _url: &str, _heartbeat: Duration) -> Result<Arc<dyn Connection>, BrokerError> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("broker unreachable".into()));
        }
        Ok(Arc::new(MemoryConnection {
            id: self.state.next_connection.fetch_add(1, Ordering::SeqCst),
            epoch: self.state.epoch.load(Ordering::SeqCst),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConnection {
    id: u64,
    epoch: u64,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("connection closed".into()));
        }
        if self.state.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(BrokerError::Disconnected("connection reset by broker".into()));
        }
        Ok(())
    }

    fn take_unacked(&self, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        let mut unacked = lock(&self.state.unacked);
        match unacked.get(&tag) {
            Some(entry) if entry.connection == self.id => {}
            _ => return Err(BrokerError::UnknownTag(tag)),
        }
        unacked.remove(&tag).ok_or(BrokerError::UnknownTag(tag))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        lock(&self.state.queues)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryQueue {
                    durable,
                    ready: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            });
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.queue(queue)?.push_back(StoredMessage {
            properties: message.properties,
            body: message.body,
            redelivered: false,
        });
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        let deadline = Instant::now() + wait;
        let memory_queue = self.state.queue(queue)?;

        loop {
            let notified = memory_queue.notify.notified();
            self.ensure_open()?;

            let next = lock(&memory_queue.ready).pop_front();
            if let Some(message) = next {
                let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                lock(&self.state.unacked).insert(
                    tag,
                    Unacked {
                        connection: self.id,
                        queue: queue.to_string(),
                        message: message.clone(),
                    },
                );
                return Ok(Some(InboundMessage {
                    tag,
                    properties: message.properties,
                    body: message.body,
                    redelivered: message.redelivered,
                }));
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, _queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.take_unacked(tag).map(|_| ())
    }

    async fn reject(&self, _queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let entry = self.take_unacked(tag)?;
        if requeue {
            let mut message = entry.message;
            message.redelivered = true;
            self.state.queue(&entry.queue)?.push_front(message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let id = self.id;
        self.state.requeue_unacked(|entry| entry.connection == id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(body: &str) -> OutboundMessage {
        OutboundMessage {
            properties: MessageProperties::default(),
            body: body.as_bytes().to_vec(),
        }
    }

    async fn open(broker: &MemoryBroker) -> Arc<dyn Connection> {
        broker.connect("memory://", Duration::from_secs(30)).await.unwrap()
    }

    #[tokio::test]
    async fn publish_to_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        let err = conn.publish("nowhere", outbound("x")).await.unwrap_err();
        assert_eq!(err, BrokerError::UnknownQueue("nowhere".into()));
    }

    #[tokio::test]
    async fn messages_are_delivered_in_fifo_order() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        conn.declare_queue("q", true).await.unwrap();
        conn.publish("q", outbound("1")).await.unwrap();
        conn.publish("q", outbound("2")).await.unwrap();

        let first = conn.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        let second = conn.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.body, b"1");
        assert_eq!(second.body, b"2");
        assert_eq!(broker.unacked_count(), 2);

        conn.ack("q", first.tag).await.unwrap();
        conn.reject("q", second.tag, false).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        conn.declare_queue("q", true).await.unwrap();
        let got = conn.receive("q", Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn receive_wakes_up_on_publish() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        conn.declare_queue("q", true).await.unwrap();

        let publisher = open(&broker).await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", outbound("late")).await.unwrap();
        });

        let got = conn.receive("q", Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(got.body, b"late");
    }

    #[tokio::test]
    async fn disconnect_requeues_unacked_as_redelivered() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        conn.declare_queue("q", true).await.unwrap();
        conn.publish("q", outbound("a")).await.unwrap();
        let message = conn.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(!message.redelivered);

        broker.disconnect_all();

        assert!(matches!(conn.ack("q", message.tag).await, Err(BrokerError::Disconnected(_))));
        let fresh = open(&broker).await;
        let again = fresh.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn reject_with_requeue_puts_message_back_in_front() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        conn.declare_queue("q", true).await.unwrap();
        conn.publish("q", outbound("a")).await.unwrap();
        conn.publish("q", outbound("b")).await.unwrap();

        let a = conn.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        conn.reject("q", a.tag, true).await.unwrap();

        let again = conn.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn connections_cannot_settle_each_others_tags() {
        let broker = MemoryBroker::new();
        let a = open(&broker).await;
        let b = open(&broker).await;
        a.declare_queue("q", true).await.unwrap();
        a.publish("q", outbound("x")).await.unwrap();
        let message = a.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(b.ack("q", message.tag).await, Err(BrokerError::UnknownTag(message.tag)));
        a.ack("q", message.tag).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(broker.connect("memory://", Duration::from_secs(1)).await.is_err());
        broker.set_reachable(true);
        assert!(broker.connect("memory://", Duration::from_secs(1)).await.is_ok());
    }
}
