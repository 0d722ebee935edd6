//! Resilient consumer: the public entry point

use crate::messaging::amqp::AmqpGateway;
use crate::messaging::config::ConsumerConfig;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::events::ConsumerEvent;
use crate::messaging::handler::MessageHandler;
use crate::messaging::metrics::init_messaging_metrics;
use crate::messaging::options::{merge, merge_map, ConsumeOptions, ConsumeOverrides};
use crate::messaging::publisher::publish_on;
use crate::messaging::state::{ConnectionState, StateData};
use crate::messaging::supervisor::ConnectionSupervisor;
use crate::messaging::traits::BrokerGateway;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Consumer that survives connection loss.
///
/// Subscriptions registered through [`Consumer::consume`] are replayed
/// automatically after every reconnect; callers never register twice.
pub struct Consumer {
    config: ConsumerConfig,
    supervisor: Arc<ConnectionSupervisor>,
    recovery: JoinHandle<()>,
}

impl Consumer {
    /// Connect to an AMQP broker at `url`.
    ///
    /// An empty `exchange` selects the default exchange name. Fails with
    /// [`MessagingError::Connect`] if the initial connect fails.
    pub async fn new(url: &str, exchange: &str) -> MessagingResult<Self> {
        Self::with_config(ConsumerConfig::new(url, exchange), Arc::new(AmqpGateway::new())).await
    }

    /// Connect using `config` over an arbitrary transport
    pub async fn with_config(
        config: ConsumerConfig,
        gateway: Arc<dyn BrokerGateway>,
    ) -> MessagingResult<Self> {
        config.validate()?;
        init_messaging_metrics();

        let supervisor = ConnectionSupervisor::new(&config, gateway);
        let recovery = supervisor.start().await?;

        info!(
            exchange = %supervisor.exchange(),
            reconnect_interval_ms = config.reconnect_interval_ms,
            "Consumer connected"
        );

        Ok(Self {
            config,
            supervisor,
            recovery,
        })
    }

    /// Register `handler` for `queue`.
    ///
    /// The queue is declared, bound to the exchange under its own name and
    /// consumed by `threads` workers. Registering the same queue again
    /// replaces the previous options and handler.
    pub async fn consume<H>(
        &self,
        queue: &str,
        overrides: ConsumeOverrides,
        handler: H,
    ) -> MessagingResult<()>
    where
        H: MessageHandler,
    {
        let options = merge(&self.config.consume_defaults, &overrides)?;
        self.consume_resolved(queue, options, Arc::new(handler)).await
    }

    /// Register with untyped overrides, type-checked before anything is declared
    pub async fn consume_with_map<H>(
        &self,
        queue: &str,
        overrides: &Map<String, Value>,
        handler: H,
    ) -> MessagingResult<()>
    where
        H: MessageHandler,
    {
        let options = merge_map(&self.config.consume_defaults, overrides)?;
        self.consume_resolved(queue, options, Arc::new(handler)).await
    }

    /// Register a shared handler with fully resolved options
    pub async fn consume_resolved(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> MessagingResult<()> {
        self.supervisor.register(queue, options, handler).await
    }

    /// Publish one message to the consumer's exchange.
    ///
    /// `None` or an empty content type uses the configured default.
    pub async fn publish(
        &self,
        routing_key: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> MessagingResult<()> {
        if self.supervisor.is_shutdown() {
            return Err(MessagingError::Shutdown);
        }
        let channel = self.supervisor.channel().ok_or_else(|| {
            MessagingError::Publish(format!(
                "connection unavailable ({})",
                self.supervisor.state()
            ))
        })?;

        let content_type = content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| self.config.content_type());
        publish_on(
            channel.as_ref(),
            self.supervisor.exchange(),
            routing_key,
            content_type,
            body,
        )
        .await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Full connection state record
    pub fn state_data(&self) -> StateData {
        self.supervisor.state_data()
    }

    /// Connection generation; increments on every successful (re)connect
    pub fn generation(&self) -> u64 {
        self.supervisor.generation()
    }

    /// Exchange queues are bound to
    pub fn exchange(&self) -> &str {
        self.supervisor.exchange()
    }

    /// Registered queue names, in registration order
    pub fn subscriptions(&self) -> Vec<String> {
        self.supervisor.registry().names()
    }

    /// Resolved options of a registered queue
    pub fn options(&self, queue: &str) -> Option<ConsumeOptions> {
        self.supervisor
            .registry()
            .get(queue)
            .map(|subscription| subscription.options.as_ref().clone())
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.supervisor.subscribe()
    }

    /// Stop every dispatcher, wait for in-flight handlers and close the connection
    pub async fn shutdown(mut self) {
        self.supervisor.shutdown().await;
        let _ = (&mut self.recovery).await;
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}
