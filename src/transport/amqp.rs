//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tracing::{debug, info};

use super::{
    Acknowledger, Channel, Connection, Connector, Delivery, DeliveryStream, OutboundMessage,
    JSON_CONTENT_TYPE,
};
use crate::config::BrokerConfig;
use crate::errors::TransportError;

/// Default exchange; routes by queue name
const DEFAULT_EXCHANGE: &str = "";
const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections using the configured broker parameters
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    broker: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(broker: BrokerConfig) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn Connection>, TransportError> {
        debug!(host = %self.broker.host, port = self.broker.port, vhost, "Opening AMQP connection");

        let connection = lapin::Connection::connect_uri(
            self.broker.amqp_uri(vhost),
            ConnectionProperties::default(),
        )
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(host = %self.broker.host, vhost, "AMQP connection established");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare(format!("{queue}: {e}")))?;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }

        self.inner
            .basic_publish(
                DEFAULT_EXCHANGE,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;

        let deliveries = consumer.map(|item| {
            item.map(into_delivery)
                .map_err(|e| TransportError::Consume(e.to_string()))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "client closed")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|queue| queue.as_str().to_string());

    Delivery::new(
        correlation_id,
        reply_to,
        delivery.data,
        delivery.redelivered,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
