//! AMQP 0-9-1 transport over lapin
//!
//! Closure of a connection or of a channel is reported through lapin's
//! `on_error` callbacks into a `watch` slot, so a channel-level error
//! (e.g. `PRECONDITION_FAILED` on a redeclare) is observable on its own.

use crate::messaging::delivery::{Acknowledger, Delivery};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::options::ConsumeOptions;
use crate::messaging::traits::{BrokerChannel, BrokerConnection, BrokerGateway, DeliveryStream};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Reply code for a normal client-initiated close
const REPLY_SUCCESS: u16 = 200;

type CloseSender = Arc<watch::Sender<Option<String>>>;
type CloseReceiver = watch::Receiver<Option<String>>;

async fn wait_closed(rx: &CloseReceiver) -> String {
    let mut rx = rx.clone();
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return "close notifier dropped".to_string();
        }
    }
}

/// Gateway dialing a RabbitMQ-compatible broker
#[derive(Clone, Default)]
pub struct AmqpGateway {
    properties: ConnectionProperties,
}

impl AmqpGateway {
    /// Create a gateway with default connection properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gateway with custom connection properties
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl BrokerGateway for AmqpGateway {
    async fn dial(&self, url: &str) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| MessagingError::Connect(format!("AMQP connection failed: {}", e)))?;

        let (closer, closed_rx) = watch::channel(None);
        let closer = Arc::new(closer);
        let on_error = closer.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            on_error.send_replace(Some(err.to_string()));
        });

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection {
            connection,
            closer,
            closed_rx,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    closer: CloseSender,
    closed_rx: CloseReceiver,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connect(format!("AMQP channel open failed: {}", e)))?;

        let (closer, closed_rx) = watch::channel(None);
        let closer = Arc::new(closer);
        let on_error = closer.clone();
        let id = channel.id();
        channel.on_error(move |err| {
            warn!(channel = id, error = %err, "AMQP channel error");
            on_error.send_replace(Some(err.to_string()));
        });

        // a connection loss takes every channel with it
        let connection_rx = self.closed_rx.clone();
        let channel_rx = closed_rx.clone();
        let on_close = closer.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = wait_closed(&connection_rx) => {
                    on_close.send_if_modified(|slot| {
                        if slot.is_none() {
                            *slot = Some(reason);
                            true
                        } else {
                            false
                        }
                    });
                }
                _ = wait_closed(&channel_rx) => {}
            }
        });

        Ok(Arc::new(AmqpChannel {
            channel,
            closer,
            closed_rx,
        }))
    }

    async fn closed(&self) -> String {
        wait_closed(&self.closed_rx).await
    }

    fn is_open(&self) -> bool {
        self.closed_rx.borrow().is_none() && self.connection.status().connected()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closer.send_replace(Some("closed by client".to_string()));
        self.connection
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(|e| MessagingError::Connect(format!("AMQP close failed: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
    closer: CloseSender,
    closed_rx: CloseReceiver,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &str) -> MessagingResult<()> {
        let options = ExchangeDeclareOptions {
            durable: true,
            auto_delete: false,
            internal: false,
            ..Default::default()
        };
        self.channel
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| MessagingError::Declare(format!("exchange '{}': {}", exchange, e)))
    }

    async fn declare_queue(&self, queue: &str, options: &ConsumeOptions) -> MessagingResult<String> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            nowait: options.no_wait,
            ..Default::default()
        };
        let declared = self
            .channel
            .queue_declare(queue, declare, FieldTable::default())
            .await
            .map_err(|e| MessagingError::Declare(format!("queue '{}': {}", queue, e)))?;

        // with nowait the broker does not report a generated name back
        let name = declared.name().as_str();
        Ok(if name.is_empty() { queue } else { name }.to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
    ) -> MessagingResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::Declare(format!("bind '{}' to '{}': {}", queue, exchange, e))
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> MessagingResult<Box<dyn DeliveryStream>> {
        if !options.auto_ack {
            // at most one unacknowledged delivery per worker sits in the client buffer
            let prefetch = u16::try_from(options.threads).unwrap_or(u16::MAX);
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| MessagingError::Declare(format!("qos '{}': {}", queue, e)))?;
        }

        let consume = BasicConsumeOptions {
            no_local: options.no_local,
            no_ack: options.auto_ack,
            exclusive: options.exclusive,
            nowait: options.no_wait,
        };
        let consumer = self
            .channel
            .basic_consume(queue, &options.consumer, consume, FieldTable::default())
            .await
            .map_err(|e| MessagingError::Declare(format!("consume '{}': {}", queue, e)))?;

        Ok(Box::new(AmqpDeliveryStream {
            tag: consumer.tag().as_str().to_string(),
            consumer,
            channel: self.channel.clone(),
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        body: &[u8],
    ) -> MessagingResult<()> {
        let properties =
            BasicProperties::default().with_content_type(ShortString::from(content_type));

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|e| MessagingError::Publish(format!("AMQP publish failed: {}", e)))?
            .await
            .map_err(|e| MessagingError::Publish(format!("AMQP publish not confirmed: {}", e)))?;

        Ok(())
    }

    async fn closed(&self) -> String {
        wait_closed(&self.closed_rx).await
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closer.send_replace(Some("closed by client".to_string()));
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(MessagingError::from)
    }
}

struct AmqpDeliveryStream {
    tag: String,
    consumer: Consumer,
    channel: Channel,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<MessagingResult<Delivery>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(MessagingError::from(e))),
        };

        let acker = AmqpAcker {
            channel: self.channel.clone(),
        };
        Some(Ok(Delivery::new(
            delivery.data,
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.routing_key.as_str().to_string(),
            Box::new(acker),
        )))
    }

    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn cancel(&mut self) -> MessagingResult<()> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| MessagingError::Declare(format!("cancel '{}': {}", self.tag, e)))
    }
}

struct AmqpAcker {
    channel: Channel,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessagingError::Acknowledge(format!("delivery {}: {}", delivery_tag, e)))
    }
}
