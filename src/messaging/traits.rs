//! Transport trait abstractions
//!
//! The consumer core only talks to the broker through these traits. Each call
//! is a single primitive with one success or failure outcome; retries and
//! recovery live above this layer.

use crate::messaging::delivery::Delivery;
use crate::messaging::error::MessagingResult;
use crate::messaging::options::ConsumeOptions;
use async_trait::async_trait;
use std::sync::Arc;

/// Entry point of a transport: opens connections to a broker
#[async_trait]
pub trait BrokerGateway: Send + Sync + 'static {
    /// Dial the broker at `url`
    async fn dial(&self, url: &str) -> MessagingResult<Arc<dyn BrokerConnection>>;
}

/// One live transport session
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection
    async fn open_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>>;

    /// Resolve once the connection is closed, returning the reason
    async fn closed(&self) -> String;

    /// Check if the connection is still open
    fn is_open(&self) -> bool;

    /// Close the connection from the client side
    async fn close(&self) -> MessagingResult<()>;
}

/// A channel multiplexed over a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable, non-auto-deleted direct exchange
    async fn declare_exchange(&self, exchange: &str) -> MessagingResult<()>;

    /// Declare a queue, returning the name the broker assigned
    async fn declare_queue(&self, queue: &str, options: &ConsumeOptions) -> MessagingResult<String>;

    /// Bind `queue` to `exchange` under `routing_key`
    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
    ) -> MessagingResult<()>;

    /// Start consuming `queue`
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> MessagingResult<Box<dyn DeliveryStream>>;

    /// Publish one non-mandatory, non-immediate message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        body: &[u8],
    ) -> MessagingResult<()>;

    /// Resolve once the channel is closed, returning the reason.
    ///
    /// A channel-level broker error closes the channel but not its connection.
    async fn closed(&self) -> String;

    /// Close the channel
    async fn close(&self) -> MessagingResult<()>;
}

/// Ordered stream of deliveries for one broker-side consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the stream is closed
    async fn next(&mut self) -> Option<MessagingResult<Delivery>>;

    /// Consumer tag the broker knows this stream by
    fn consumer_tag(&self) -> &str;

    /// Cancel the broker-side consumer
    async fn cancel(&mut self) -> MessagingResult<()>;
}
