//! Connection supervisor: owns the live connection and drives recovery.
//!
//! One long-lived recovery task waits on a single-slot closure signal (a
//! `watch` channel carrying the generation of the connection that closed).
//! Close listeners overwrite the slot and never block; signals for a
//! generation that has already been replaced are ignored. On a current
//! signal the task moves to `Closing`, waits the fixed back-off, reconnects
//! and replays every registered subscription, retrying indefinitely.
//!
//! Registration and connect+replay are serialized by the topology lock so a
//! subscription added during a reconnect is neither lost nor replayed twice.
//!
//! Each subscription consumes on a channel of its own, so a channel-level
//! broker error while declaring one queue never reaches the others. The
//! session's control channel (exchange declare and publish) is watched like
//! the connection: its closure starts recovery too.

use crate::messaging::config::ConsumerConfig;
use crate::messaging::dispatcher::{DeliveryDispatcher, DispatcherHandle};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::events::ConsumerEvent;
use crate::messaging::handler::MessageHandler;
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::options::ConsumeOptions;
use crate::messaging::registry::{Subscription, SubscriptionRegistry};
use crate::messaging::state::{ConnectionState, StateData};
use crate::messaging::traits::{BrokerChannel, BrokerConnection, BrokerGateway, DeliveryStream};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Owns the connection/channel pair and replays subscriptions after loss
pub struct ConnectionSupervisor {
    url: String,
    exchange: String,
    reconnect_interval: Duration,
    gateway: Arc<dyn BrokerGateway>,
    registry: Arc<SubscriptionRegistry>,
    state: RwLock<StateData>,
    session: RwLock<Option<Session>>,
    closures: Arc<watch::Sender<u64>>,
    topology: Mutex<()>,
    events: broadcast::Sender<ConsumerEvent>,
    cancel: CancellationToken,
    generation: AtomicU64,
}

impl ConnectionSupervisor {
    /// Create a supervisor; nothing is dialed until [`ConnectionSupervisor::start`]
    pub fn new(config: &ConsumerConfig, gateway: Arc<dyn BrokerGateway>) -> Arc<Self> {
        let (closures, _) = watch::channel(0);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Arc::new(Self {
            url: config.url.clone(),
            exchange: config.exchange_name().to_string(),
            reconnect_interval: config.reconnect_interval(),
            gateway,
            registry: Arc::new(SubscriptionRegistry::new()),
            state: RwLock::new(StateData::new()),
            session: RwLock::new(None),
            closures: Arc::new(closures),
            topology: Mutex::new(()),
            events,
            cancel: CancellationToken::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Perform the initial connect and spawn the recovery task.
    ///
    /// A failure here is fatal and is never retried.
    pub async fn start(self: &Arc<Self>) -> MessagingResult<JoinHandle<()>> {
        {
            let _topology = self.topology.lock().await;
            self.connect(false).await?;
        }
        Ok(self.spawn_recovery())
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.read().state
    }

    /// Copy of the full state record
    pub fn state_data(&self) -> StateData {
        self.state.read().clone()
    }

    /// Generation of the most recent successful connect; 0 before the first
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Exchange every subscription binds to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Registered subscriptions
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop recovery and every worker without waiting or closing anything
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    /// Channel of the live session, if connected
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        if !self.state().is_usable() {
            return None;
        }
        self.session
            .read()
            .as_ref()
            .map(|session| session.channel.clone())
    }

    /// Register a subscription and start its dispatcher.
    ///
    /// Declares and binds the queue, starts the broker-side consumer and
    /// records the subscription. Re-registering a queue name replaces the
    /// previous registration; its dispatcher is stopped without waiting.
    pub async fn register(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> MessagingResult<()> {
        if self.is_shutdown() {
            return Err(MessagingError::Shutdown);
        }

        let _topology = self.topology.lock().await;
        let session = self.usable_session().ok_or_else(|| {
            MessagingError::Declare(format!(
                "connection unavailable ({}), cannot consume '{}'",
                self.state(),
                queue
            ))
        })?;

        let subscription = self.registry.prepare(queue, options, handler);
        let handle = self.bind(&session, &subscription).await?;

        if let Some(previous) = self.registry.add(subscription, handle, session.generation) {
            previous.stop();
        }
        Ok(())
    }

    /// Stop recovery, every dispatcher and the connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let _topology = self.topology.lock().await;
        self.transition(ConnectionState::Closed, "shutdown requested");

        for handle in self.registry.take_dispatchers() {
            handle.shutdown().await;
        }

        let session = self.session.write().take();
        if let Some(session) = session {
            if let Err(err) = session.channel.close().await {
                debug!(error = %err, "Channel close failed");
            }
            if let Err(err) = session.connection.close().await {
                debug!(error = %err, "Connection close failed");
            }
        }
        info!(exchange = %self.exchange, "Supervisor shut down");
    }

    fn usable_session(&self) -> Option<Session> {
        if !self.state().is_usable() {
            return None;
        }
        self.session.read().clone()
    }

    fn transition(&self, to: ConnectionState, reason: impl Into<String>) -> bool {
        let transition = self.state.write().transition_to(to, reason);
        match transition {
            Some(transition) => {
                MESSAGING_METRICS
                    .connection_state
                    .set(transition.to.to_metric_value());
                info!(
                    from = %transition.from,
                    to = %transition.to,
                    reason = %transition.reason,
                    "Connection state changed"
                );
                true
            }
            None => {
                debug!(from = %self.state(), to = %to, "Ignoring illegal state transition");
                false
            }
        }
    }

    /// Dial, open a channel and declare the exchange.
    ///
    /// Must be called with the topology lock held.
    async fn connect(&self, recovering: bool) -> MessagingResult<u64> {
        if self.is_shutdown() {
            return Err(MessagingError::Shutdown);
        }

        let reason = if recovering { "reconnecting" } else { "dialing" };
        self.transition(ConnectionState::Connecting, reason);

        let (connection, channel) = match self.establish().await {
            Ok(pair) => pair,
            Err(err) => {
                let fallback = if recovering {
                    ConnectionState::Closing
                } else {
                    ConnectionState::Disconnected
                };
                self.transition(fallback, err.to_string());
                return Err(err);
            }
        };

        if self.is_shutdown() {
            let _ = connection.close().await;
            return Err(MessagingError::Shutdown);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let control = channel.clone();
        *self.session.write() = Some(Session {
            generation,
            connection: connection.clone(),
            channel,
        });
        self.transition(ConnectionState::Connected, format!("generation {}", generation));
        self.spawn_close_listener(generation, connection, control);

        let _ = self.events.send(ConsumerEvent::Connected { generation });
        Ok(generation)
    }

    async fn establish(
        &self,
    ) -> MessagingResult<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        let connection = self
            .gateway
            .dial(&self.url)
            .await
            .map_err(|err| into_connect(err, "dial"))?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(into_connect(err, "open channel"));
            }
        };

        if let Err(err) = channel.declare_exchange(&self.exchange).await {
            let _ = connection.close().await;
            return Err(into_connect(
                err,
                &format!("declare exchange '{}'", self.exchange),
            ));
        }

        Ok((connection, channel))
    }

    fn spawn_close_listener(
        &self,
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
        control: Arc<dyn BrokerChannel>,
    ) {
        let closures = self.closures.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let (what, reason) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                reason = connection.closed() => ("connection", reason),
                reason = control.closed() => ("channel", reason),
            };
            if cancel.is_cancelled() {
                return;
            }
            warn!(generation, what, reason = %reason, "Session closed by broker");
            let _ = events.send(ConsumerEvent::ConnectionLost { generation, reason });
            closures.send_replace(generation);
        });
    }

    fn spawn_recovery(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run_recovery().await })
    }

    async fn run_recovery(self: Arc<Self>) {
        let mut closures = self.closures.subscribe();
        // a closure signalled before this task subscribed must not be missed
        closures.mark_changed();
        debug!(interval = ?self.reconnect_interval, "Recovery task started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = closures.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let closed = *closures.borrow_and_update();
            if closed != self.generation() {
                debug!(closed, current = self.generation(), "Ignoring stale closure signal");
                continue;
            }
            self.recover(closed).await;
        }

        debug!("Recovery task stopped");
    }

    /// Reconnect after losing `lost` and replay every subscription.
    ///
    /// Retries on a fixed interval until a connect succeeds or shutdown.
    async fn recover(&self, lost: u64) {
        {
            let _topology = self.topology.lock().await;
            if self.is_shutdown() {
                return;
            }
            self.transition(ConnectionState::Closing, format!("generation {} lost", lost));
            let session = self.session.write().take();
            for handle in self.registry.take_dispatchers() {
                handle.stop();
            }
            // only the control channel may have gone; drop the rest of the session
            if let Some(session) = session.filter(|session| session.connection.is_open()) {
                if let Err(err) = session.connection.close().await {
                    debug!(generation = lost, error = %err, "Connection close failed");
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }

            let _topology = self.topology.lock().await;
            if self.is_shutdown() {
                return;
            }

            let attempt = self.state.write().record_attempt();
            warn!(attempt, url = %self.url, "Attempting reconnect");

            match self.connect(true).await {
                Ok(generation) => {
                    MESSAGING_METRICS
                        .reconnect_attempts
                        .with_label_values(&["success"])
                        .inc();
                    let (replayed, failed) = self.replay(generation).await;
                    info!(generation, replayed, failed, "Reconnected");
                    let _ = self.events.send(ConsumerEvent::Reconnected {
                        generation,
                        replayed,
                        failed,
                    });
                    return;
                }
                Err(MessagingError::Shutdown) => return,
                Err(err) => {
                    MESSAGING_METRICS
                        .reconnect_attempts
                        .with_label_values(&["failure"])
                        .inc();
                    warn!(attempt, error = %err, "Reconnect failed");
                    let _ = self.events.send(ConsumerEvent::ReconnectFailed {
                        attempt,
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    /// Re-run the registration path for a snapshot of the registry.
    ///
    /// Must be called with the topology lock held.
    async fn replay(&self, generation: u64) -> (usize, usize) {
        let Some(session) = self.usable_session() else {
            return (0, 0);
        };

        let mut replayed = 0;
        let mut failed = 0;

        for subscription in self.registry.snapshot() {
            match self.bind(&session, &subscription).await {
                Ok(handle) => {
                    match self.registry.rebind(
                        &subscription.queue,
                        subscription.registration_id,
                        handle,
                        generation,
                    ) {
                        Ok(previous) => {
                            if let Some(previous) = previous {
                                previous.stop();
                            }
                            replayed += 1;
                            debug!(queue = %subscription.queue, generation, "Subscription replayed");
                        }
                        Err(rejected) => rejected.stop(),
                    }
                }
                Err(err) => {
                    failed += 1;
                    error!(
                        queue = %subscription.queue,
                        generation,
                        error = %err,
                        "Failed to replay subscription"
                    );
                    MESSAGING_METRICS
                        .replay_failures
                        .with_label_values(&[&subscription.queue])
                        .inc();
                    let _ = self.events.send(ConsumerEvent::ReplayFailed {
                        queue: subscription.queue.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        (replayed, failed)
    }

    /// Open the subscription's own channel, declare, bind and consume, then
    /// spawn the dispatcher that owns the channel
    async fn bind(
        &self,
        session: &Session,
        subscription: &Subscription,
    ) -> MessagingResult<DispatcherHandle> {
        let channel = session
            .connection
            .open_channel()
            .await
            .map_err(into_declare)?;

        let (queue, stream) = match self.declare_and_consume(&channel, subscription).await {
            Ok(declared) => declared,
            Err(err) => {
                if let Err(close) = channel.close().await {
                    debug!(queue = %subscription.queue, error = %close, "Channel close failed");
                }
                return Err(err);
            }
        };

        let dispatcher = DeliveryDispatcher::new(
            queue,
            subscription.options.clone(),
            subscription.handler.clone(),
            self.events.clone(),
        )
        .with_channel(channel);
        Ok(dispatcher.spawn(stream, self.cancel.child_token()))
    }

    async fn declare_and_consume(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        subscription: &Subscription,
    ) -> MessagingResult<(String, Box<dyn DeliveryStream>)> {
        let options = &subscription.options;

        let queue = channel
            .declare_queue(&subscription.queue, options)
            .await
            .map_err(into_declare)?;
        channel
            .bind_queue(&queue, &queue, &self.exchange, options.no_wait)
            .await
            .map_err(into_declare)?;
        let stream = channel
            .consume(&queue, options)
            .await
            .map_err(into_declare)?;
        Ok((queue, stream))
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn into_connect(err: MessagingError, step: &str) -> MessagingError {
    match err {
        MessagingError::Connect(_) => err,
        other => MessagingError::Connect(format!("{}: {}", step, other)),
    }
}

fn into_declare(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::Declare(_) => err,
        other => MessagingError::Declare(other.to_string()),
    }
}
