//! # Broker Transport Module
//!
//! Abstraction over the queue-based transport the RPC client runs on. The
//! [`amqp`] submodule talks to a real broker through `lapin`. With the
//! `testing` feature, `memory` provides an in-process broker with the same
//! semantics for tests.
//!
//! Messages are always published to the default exchange, so the routing key
//! is the name of the destination queue.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::TransportError;

pub mod amqp;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use amqp::AmqpConnector;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBroker;

/// Content type attached to every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Request queue, response queue and virtual host of one RPC client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueIdentity {
    pub request_queue: String,
    pub response_queue: String,
    pub vhost: String,
}

impl QueueIdentity {
    pub fn new(
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
        vhost: impl Into<String>,
    ) -> Self {
        Self {
            request_queue: request_queue.into(),
            response_queue: response_queue.into(),
            vhost: vhost.into(),
        }
    }
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} @ {}",
            self.request_queue, self.response_queue, self.vhost
        )
    }
}

/// A message about to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Destination queue
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    /// A request expecting a reply on `reply_to`
    pub fn request(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    /// A reply tagged with the correlation id of its request
    pub fn reply(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            correlation_id,
            reply_to: None,
        }
    }
}

/// Settles a delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    /// Negative acknowledgement, optionally putting the message back on its queue
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message received from a queue
pub struct Delivery {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
    /// Set when the broker has handed this message out before
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        correlation_id: Option<String>,
        reply_to: Option<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            correlation_id,
            reply_to,
            body,
            redelivered,
            acker,
        }
    }

    /// Remove the message from its queue
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Hand the message back to the broker for another consumer
    pub async fn requeue(&self) -> Result<(), TransportError> {
        self.acker.reject(true).await
    }

    /// Drop the message without redelivery
    pub async fn reject(&self) -> Result<(), TransportError> {
        self.acker.reject(false).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries from one consumer; ends when the channel closes
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Establishes broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform one handshake against the given virtual host
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live broker connection, shared between clients
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;
}

/// A per-client communication context on a shared connection
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;
    /// Declare a queue that survives broker restarts
    async fn declare_durable_queue(&self, queue: &str) -> Result<(), TransportError>;
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError>;
    /// Close the channel; closing a closed channel is a no-op
    async fn close(&self) -> Result<(), TransportError>;
}
