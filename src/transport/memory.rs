//! # In-Memory Broker
//!
//! A process-local broker implementing the transport traits. Queues are
//! namespaced by virtual host, messages published to an undeclared queue are
//! dropped (like the AMQP default exchange), rejected messages can be
//! requeued with the redelivered flag set, and closing a channel ends its
//! consumer streams.
//!
//! The broker also exposes knobs for exercising failure paths: counting and
//! failing handshakes, dropping every connection, force-closing every
//! channel, and failing every consumer stream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    Acknowledger, Channel, Connection, Connector, Delivery, DeliveryStream, OutboundMessage,
};
use crate::errors::TransportError;

/// Lifecycle of a client channel as seen by its consumers
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelStatus {
    Open,
    Closed,
    /// Consumers yield one error carrying the reason, then end
    Failed(String),
}

#[derive(Debug, Clone)]
struct StoredMessage {
    correlation_id: Option<String>,
    reply_to: Option<String>,
    body: Vec<u8>,
    redelivered: bool,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<StoredMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>,
    depth: AtomicUsize,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, message: StoredMessage) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        // The queue owns its receiver, so the send cannot fail
        let _ = self.tx.send(message);
    }
}

#[derive(Default)]
struct BrokerState {
    handshakes: AtomicUsize,
    failing_handshakes: AtomicUsize,
    acks: AtomicUsize,
    queues: Mutex<HashMap<(String, String), Arc<MemoryQueue>>>,
    connections: Mutex<Vec<Arc<AtomicBool>>>,
    channels: Mutex<Vec<Arc<watch::Sender<ChannelStatus>>>>,
}

impl BrokerState {
    fn queue(&self, vhost: &str, queue: &str) -> Option<Arc<MemoryQueue>> {
        let queues = self.queues.lock().unwrap();
        queues.get(&(vhost.to_string(), queue.to_string())).cloned()
    }

    fn declare(&self, vhost: &str, queue: &str) -> Arc<MemoryQueue> {
        let mut queues = self.queues.lock().unwrap();
        Arc::clone(
            queues
                .entry((vhost.to_string(), queue.to_string()))
                .or_insert_with(|| Arc::new(MemoryQueue::new())),
        )
    }
}

/// In-process broker; cheap to clone, clones share state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful handshakes so far
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Number of acknowledged deliveries so far
    pub fn acks(&self) -> usize {
        self.state.acks.load(Ordering::SeqCst)
    }

    /// Refuse the next `count` handshakes
    pub fn fail_next_handshakes(&self, count: usize) {
        self.state.failing_handshakes.store(count, Ordering::SeqCst);
    }

    /// Number of messages waiting in a queue (0 if undeclared)
    pub fn queue_depth(&self, vhost: &str, queue: &str) -> usize {
        self.state
            .queue(vhost, queue)
            .map(|q| q.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Simulate a network failure: every connection and channel goes down
    pub fn drop_connections(&self) {
        for alive in self.state.connections.lock().unwrap().drain(..) {
            alive.store(false, Ordering::SeqCst);
        }
        self.shutdown_channels();
    }

    /// Force-close every client channel, ending their consumer streams
    pub fn shutdown_channels(&self) {
        self.settle_channels(ChannelStatus::Closed);
    }

    /// Break every client channel: each consumer stream yields a
    /// `TransportError::Consume` with the given reason, then ends
    pub fn fail_consumers(&self, reason: &str) {
        self.settle_channels(ChannelStatus::Failed(reason.to_string()));
    }

    fn settle_channels(&self, status: ChannelStatus) {
        for channel in self.state.channels.lock().unwrap().drain(..) {
            channel.send_if_modified(|current| {
                if *current == ChannelStatus::Open {
                    *current = status.clone();
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Publish directly into a declared queue of a virtual host
    ///
    /// Returns false (and drops the message) if the queue is not declared.
    pub fn inject(&self, vhost: &str, message: OutboundMessage) -> bool {
        let Some(queue) = self.state.queue(vhost, &message.routing_key) else {
            return false;
        };
        queue.push(StoredMessage {
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            body: message.body,
            redelivered: false,
        });
        true
    }

    /// Serve a request queue with an async JSON handler
    ///
    /// Each request is handled in its own task; when the handler returns a
    /// value it is published to the request's `reply_to` queue under the same
    /// correlation id. Returning `None` simulates a lost reply. Responder
    /// channels survive [`MemoryBroker::shutdown_channels`].
    pub async fn spawn_responder<F, Fut>(
        &self,
        vhost: &str,
        queue: &str,
        handler: F,
    ) -> Result<JoinHandle<()>, TransportError>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<serde_json::Value>> + Send + 'static,
    {
        let channel = self.open_channel(vhost, Arc::new(AtomicBool::new(true)), false);
        channel.declare_durable_queue(queue).await?;
        let mut requests = channel.consume(queue, "memory-responder").await?;
        let handler = Arc::new(handler);
        let queue = queue.to_string();

        Ok(tokio::spawn(async move {
            while let Some(delivery) = requests.next().await {
                let Ok(delivery) = delivery else { break };
                let channel = Arc::clone(&channel);
                let handler = Arc::clone(&handler);
                let queue = queue.clone();
                tokio::spawn(async move {
                    let request = match serde_json::from_slice(&delivery.body) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(queue = %queue, error = %e, "Responder received malformed request");
                            let _ = delivery.reject().await;
                            return;
                        }
                    };
                    let _ = delivery.ack().await;

                    let (Some(reply), Some(reply_to)) = (handler(request).await, delivery.reply_to.clone())
                    else {
                        debug!(queue = %queue, "Responder produced no reply");
                        return;
                    };
                    let body = serde_json::to_vec(&reply).unwrap_or_default();
                    let reply = OutboundMessage::reply(reply_to, body, delivery.correlation_id.clone());
                    if let Err(e) = channel.publish(reply).await {
                        warn!(queue = %queue, error = %e, "Responder failed to publish reply");
                    }
                });
            }
        }))
    }

    fn open_channel(&self, vhost: &str, alive: Arc<AtomicBool>, tracked: bool) -> Arc<MemoryChannel> {
        let (status, _) = watch::channel(ChannelStatus::Open);
        let status = Arc::new(status);
        if tracked {
            self.state.channels.lock().unwrap().push(Arc::clone(&status));
        }
        Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            vhost: vhost.to_string(),
            status,
            connection_alive: alive,
        })
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let refused = self
            .state
            .failing_handshakes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect(format!(
                "connection to vhost \"{vhost}\" refused"
            )));
        }

        self.state.handshakes.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.connections.lock().unwrap().push(Arc::clone(&alive));

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            vhost: vhost.to_string(),
            alive,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    vhost: String,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Channel("connection is closed".to_string()));
        }
        Ok(self
            .broker
            .open_channel(&self.vhost, Arc::clone(&self.alive), true))
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    vhost: String,
    status: Arc<watch::Sender<ChannelStatus>>,
    connection_alive: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        *self.status.borrow() == ChannelStatus::Open && self.connection_alive.load(Ordering::SeqCst)
    }

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.declare(&self.vhost, queue);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.ensure_open().map_err(|e| TransportError::Publish(e.to_string()))?;
        match self.state.queue(&self.vhost, &message.routing_key) {
            Some(queue) => queue.push(StoredMessage {
                correlation_id: message.correlation_id,
                reply_to: message.reply_to,
                body: message.body,
                redelivered: false,
            }),
            None => debug!(queue = %message.routing_key, "Dropping unroutable message"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        self.ensure_open().map_err(|e| TransportError::Consume(e.to_string()))?;
        let queue = self.state.queue(&self.vhost, queue).ok_or_else(|| {
            TransportError::Consume(format!("queue \"{queue}\" is not declared"))
        })?;
        debug!(consumer_tag, vhost = %self.vhost, "Starting memory consumer");

        let status = self.status.subscribe();
        let state = Arc::clone(&self.state);
        let stream = futures::stream::unfold(
            (queue, status, state, false),
            |(queue, mut status, state, failed)| async move {
                if failed {
                    return None;
                }
                let next = {
                    let mut rx = queue.rx.lock().await;
                    tokio::select! {
                        message = rx.recv() => Ok(message),
                        settled = status.wait_for(|s| *s != ChannelStatus::Open) => match settled {
                            Ok(settled) => match &*settled {
                                ChannelStatus::Failed(reason) => Err(reason.clone()),
                                _ => Ok(None),
                            },
                            Err(_) => Ok(None),
                        },
                    }
                };
                let message = match next {
                    Ok(message) => message?,
                    Err(reason) => {
                        let error = TransportError::Consume(reason);
                        return Some((Err(error), (queue, status, state, true)));
                    }
                };
                queue.depth.fetch_sub(1, Ordering::SeqCst);

                let delivery = Delivery::new(
                    message.correlation_id.clone(),
                    message.reply_to.clone(),
                    message.body.clone(),
                    message.redelivered,
                    Box::new(MemoryAcker {
                        state: Arc::clone(&state),
                        queue: Arc::clone(&queue),
                        message: Mutex::new(Some(message)),
                    }),
                );
                Some((Ok(delivery), (queue, status, state, false)))
            },
        );
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.status.send_if_modified(|status| {
            if *status == ChannelStatus::Open {
                *status = ChannelStatus::Closed;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: Arc<MemoryQueue>,
    message: Mutex<Option<StoredMessage>>,
}

impl MemoryAcker {
    fn settle(&self) -> Result<StoredMessage, TransportError> {
        self.message
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Ack("delivery already settled".to_string()))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle()?;
        self.state.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        let mut message = self.settle()?;
        if requeue {
            message.redelivered = true;
            self.queue.push(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_durable_queue("jobs").await.unwrap();

        channel
            .publish(OutboundMessage::request("jobs", b"{}".to_vec(), "id-1", "replies"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("test", "jobs"), 1);

        let mut stream = channel.consume("jobs", "tag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some("id-1"));
        assert_eq!(delivery.reply_to.as_deref(), Some("replies"));
        assert!(!delivery.redelivered);

        delivery.ack().await.unwrap();
        assert_eq!(broker.acks(), 1);
        assert!(delivery.ack().await.is_err());
        assert_eq!(broker.queue_depth("test", "jobs"), 0);
    }

    #[tokio::test]
    async fn test_requeue_sets_redelivered() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_durable_queue("jobs").await.unwrap();
        assert!(broker.inject("test", OutboundMessage::reply("jobs", b"1".to_vec(), None)));

        let mut stream = channel.consume("jobs", "tag").await.unwrap();
        stream.next().await.unwrap().unwrap().requeue().await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"1");
    }

    #[tokio::test]
    async fn test_closing_channel_ends_stream() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_durable_queue("jobs").await.unwrap();
        let mut stream = channel.consume("jobs", "tag").await.unwrap();

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert!(stream.next().await.is_none());
        assert!(!channel.is_open());
        assert!(channel
            .publish(OutboundMessage::reply("jobs", Vec::new(), None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_vhosts_are_isolated() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("a").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_durable_queue("jobs").await.unwrap();

        assert!(broker.inject("a", OutboundMessage::reply("jobs", b"x".to_vec(), None)));
        assert!(!broker.inject("b", OutboundMessage::reply("jobs", b"x".to_vec(), None)));
        assert_eq!(broker.queue_depth("a", "jobs"), 1);
        assert_eq!(broker.queue_depth("b", "jobs"), 0);
    }

    #[tokio::test]
    async fn test_failing_handshakes_are_consumed() {
        let broker = MemoryBroker::new();
        broker.fail_next_handshakes(1);
        assert!(broker.connect("test").await.is_err());
        assert!(broker.connect("test").await.is_ok());
        assert_eq!(broker.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_failed_consumer_yields_error_then_ends() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_durable_queue("jobs").await.unwrap();
        let mut stream = channel.consume("jobs", "tag").await.unwrap();

        broker.fail_consumers("connection reset");

        match stream.next().await {
            Some(Err(TransportError::Consume(reason))) => assert_eq!(reason, "connection reset"),
            other => panic!("Unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
        assert!(!channel.is_open());
    }
}
