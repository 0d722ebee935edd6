//! Inbound deliveries and their acknowledgment handles

use crate::messaging::error::MessagingResult;
use async_trait::async_trait;
use std::fmt;

/// Transport hook that confirms processing of one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge exactly the delivery identified by `delivery_tag` (never cumulative)
    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()>;
}

/// One message pulled from a subscription's delivery stream
pub struct Delivery {
    /// Message body
    pub payload: Vec<u8>,

    /// Broker-assigned tag, unique per channel
    pub delivery_tag: u64,

    /// Set when the broker delivered this message before
    pub redelivered: bool,

    /// Routing key the message was published with
    pub routing_key: String,

    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery backed by a transport acknowledger
    pub fn new(
        payload: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        routing_key: impl Into<String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            delivery_tag,
            redelivered,
            routing_key: routing_key.into(),
            acker,
        }
    }

    /// Acknowledge this delivery
    pub async fn ack(self) -> MessagingResult<()> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Separate the payload from the acknowledgment handle
    pub fn into_parts(self) -> (Vec<u8>, PendingAck) {
        (
            self.payload,
            PendingAck {
                delivery_tag: self.delivery_tag,
                acker: self.acker,
            },
        )
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Acknowledgment handle detached from its payload
pub struct PendingAck {
    delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl PendingAck {
    /// Tag of the delivery this handle acknowledges
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge the delivery
    pub async fn ack(self) -> MessagingResult<()> {
        self.acker.ack(self.delivery_tag).await
    }
}
