//! One-shot publish path

use crate::messaging::config::DEFAULT_CONTENT_TYPE;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::{BrokerChannel, BrokerConnection, BrokerGateway};
use std::sync::Arc;
use tracing::{debug, warn};

/// Declare `exchange` (idempotent) and publish one message on `channel`.
///
/// An empty `content_type` falls back to [`DEFAULT_CONTENT_TYPE`]. Every
/// transport failure is reported as [`MessagingError::Publish`]; nothing is
/// retried.
pub async fn publish_on(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    content_type: &str,
    body: &[u8],
) -> MessagingResult<()> {
    let content_type = if content_type.is_empty() {
        DEFAULT_CONTENT_TYPE
    } else {
        content_type
    };

    let result = async {
        channel
            .declare_exchange(exchange)
            .await
            .map_err(into_publish)?;
        channel
            .publish(exchange, routing_key, content_type, body)
            .await
            .map_err(into_publish)
    }
    .await;

    match &result {
        Ok(()) => {
            MESSAGING_METRICS
                .messages_published
                .with_label_values(&[exchange])
                .inc();
            debug!(exchange, routing_key, bytes = body.len(), "Message published");
        }
        Err(err) => {
            MESSAGING_METRICS
                .publish_failures
                .with_label_values(&[exchange, err.kind()])
                .inc();
            warn!(exchange, routing_key, error = %err, "Publish failed");
        }
    }

    result
}

fn into_publish(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::Publish(_) => err,
        other => MessagingError::Publish(other.to_string()),
    }
}

/// Publisher with its own connection, independent of any consumer
pub struct Publisher {
    exchange: String,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Dial `url` and open a channel for publishing to `exchange`
    pub async fn connect(
        url: &str,
        exchange: impl Into<String>,
        gateway: &dyn BrokerGateway,
    ) -> MessagingResult<Self> {
        let connection = gateway.dial(url).await?;
        let channel = connection.open_channel().await?;

        Ok(Self {
            exchange: exchange.into(),
            connection,
            channel,
        })
    }

    /// Exchange messages are published to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish one message
    pub async fn publish(
        &self,
        routing_key: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> MessagingResult<()> {
        if !self.connection.is_open() {
            return Err(MessagingError::Publish("connection closed".to_string()));
        }
        publish_on(
            self.channel.as_ref(),
            &self.exchange,
            routing_key,
            content_type.unwrap_or_default(),
            body,
        )
        .await
    }

    /// Close the channel and connection
    pub async fn close(&self) -> MessagingResult<()> {
        if let Err(err) = self.channel.close().await {
            debug!(error = %err, "Channel close failed");
        }
        self.connection.close().await
    }
}
