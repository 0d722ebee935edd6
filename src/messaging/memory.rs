//! In-process broker with direct-exchange routing.
//!
//! Implements the transport traits without any network I/O so the recovery
//! and dispatch paths can be exercised deterministically. Besides routing it
//! models the broker behaviour the consumer core depends on:
//!
//! - deliveries taken without auto-ack stay unacknowledged until acked, and
//!   are requeued (flagged redelivered) when their channel closes
//! - a channel error (inequivalent redeclare, locked exclusive queue, missing
//!   queue or exchange, unknown delivery tag) closes that channel only
//! - an unsolicited close fires the close notification of the connection and
//!   of every channel on it
//!
//! Fault injection: [`InMemoryBroker::sever_connections`] drops every open
//! connection, [`InMemoryBroker::sever_channels`] closes every channel while
//! leaving connections up, [`InMemoryBroker::set_reachable`] makes dials fail.

use crate::messaging::delivery::{Acknowledger, Delivery};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::options::ConsumeOptions;
use crate::messaging::traits::{BrokerChannel, BrokerConnection, BrokerGateway, DeliveryStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::debug;

type CloseSender = Arc<watch::Sender<Option<String>>>;
type CloseReceiver = watch::Receiver<Option<String>>;

/// In-process broker; clones share the same state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    dials: AtomicU64,
    acks: AtomicU64,
    published: AtomicU64,
    next_connection: AtomicU64,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
    next_stream: AtomicU64,
}

impl Default for BrokerInner {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            reachable: AtomicBool::new(true),
            dials: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            published: AtomicU64::new(0),
            next_connection: AtomicU64::new(1),
            next_channel: AtomicU64::new(1),
            next_tag: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    /// exchange -> routing key -> bound queues
    exchanges: HashMap<String, HashMap<String, Vec<String>>>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, CloseSender>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<u64, Unacked>,
}

struct ChannelState {
    connection: u64,
    closer: CloseSender,
}

struct QueueState {
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    /// stream id -> owning channel
    consumers: HashMap<u64, u64>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(durable: bool, auto_delete: bool, exclusive_owner: Option<u64>) -> Self {
        Self {
            durable,
            auto_delete,
            exclusive_owner,
            messages: VecDeque::new(),
            consumers: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: StoredMessage,
}

enum Popped {
    Message(u64, StoredMessage),
    Empty,
    Gone,
}

impl InMemoryBroker {
    /// Create an empty, reachable broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent dials succeed or fail
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Check if dials currently succeed
    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Drop every open connection as if the broker went away.
    ///
    /// Returns the number of connections closed.
    pub fn sever_connections(&self) -> usize {
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            close_connection_locked(&mut state, *id, "connection reset by broker");
        }
        ids.len()
    }

    /// Close every open channel while keeping connections up.
    ///
    /// Returns the number of channels closed.
    pub fn sever_channels(&self) -> usize {
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in &ids {
            close_channel_locked(&mut state, *id, "CHANNEL_ERROR - channel closed by broker");
        }
        ids.len()
    }

    /// Declare a queue out of band, as an operator would
    pub fn declare_queue(&self, queue: &str, durable: bool) {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(durable, false, None));
    }

    /// Delete a queue out of band, dropping its messages and bindings.
    ///
    /// Streams consuming it end. Returns false if the queue did not exist.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(removed) = state.queues.remove(queue) else {
            return false;
        };
        for bindings in state.exchanges.values_mut() {
            for bound in bindings.values_mut() {
                bound.retain(|name| name != queue);
            }
        }
        state.unacked.retain(|_, unacked| unacked.queue != queue);
        removed.notify.notify_waiters();
        true
    }

    /// Number of dial attempts, successful or not
    pub fn dial_count(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Number of successful acknowledgments
    pub fn ack_count(&self) -> u64 {
        self.inner.acks.load(Ordering::SeqCst)
    }

    /// Number of messages accepted by an exchange
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of open connections
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Number of open channels across all connections
    pub fn open_channels(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    /// Check if a queue exists
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Messages waiting in `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Active broker-side consumers on `queue`
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out and not yet acknowledged
    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }
}

fn close_connection_locked(state: &mut BrokerState, connection: u64, reason: &str) {
    let Some(closer) = state.connections.remove(&connection) else {
        return;
    };
    closer.send_replace(Some(reason.to_string()));

    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, channel)| channel.connection == connection)
        .map(|(id, _)| *id)
        .collect();
    for channel in channels {
        close_channel_locked(state, channel, reason);
    }

    state
        .queues
        .retain(|_, queue| queue.exclusive_owner != Some(connection));

    debug!(connection, reason, "In-memory connection closed");
}

fn close_channel_locked(state: &mut BrokerState, channel: u64, reason: &str) {
    let Some(closed) = state.channels.remove(&channel) else {
        return;
    };
    closed.closer.send_replace(Some(reason.to_string()));

    let mut tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, unacked)| unacked.channel == channel)
        .map(|(tag, _)| *tag)
        .collect();
    // push_front in reverse so requeued messages keep their original order
    tags.sort_unstable_by(|a, b| b.cmp(a));
    for tag in tags {
        if let Some(unacked) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }

    let mut deleted = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        let had_consumers = !queue.consumers.is_empty();
        queue.consumers.retain(|_, owner| *owner != channel);
        if queue.auto_delete && had_consumers && queue.consumers.is_empty() {
            deleted.push(name.clone());
        }
        queue.notify.notify_waiters();
    }
    for name in deleted {
        state.queues.remove(&name);
    }

    debug!(channel, connection = closed.connection, reason, "In-memory channel closed");
}

impl BrokerInner {
    fn close_connection(&self, connection: u64, reason: &str) {
        close_connection_locked(&mut self.state.lock(), connection, reason);
    }

    fn close_channel(&self, channel: u64, reason: &str) {
        close_channel_locked(&mut self.state.lock(), channel, reason);
    }

    fn pop(&self, queue: &str, channel: u64, no_ack: bool) -> Popped {
        let mut state = self.state.lock();
        let message = match state.queues.get_mut(queue) {
            None => return Popped::Gone,
            Some(q) => match q.messages.pop_front() {
                Some(message) => message,
                None => return Popped::Empty,
            },
        };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if !no_ack {
            state.unacked.insert(
                tag,
                Unacked {
                    channel,
                    queue: queue.to_string(),
                    message: message.clone(),
                },
            );
        }
        Popped::Message(tag, message)
    }

    fn ack(&self, channel: u64, tag: u64) -> MessagingResult<()> {
        let mut state = self.state.lock();
        if !state.channels.contains_key(&channel) {
            return Err(MessagingError::Acknowledge("channel closed".to_string()));
        }
        let owned = state
            .unacked
            .get(&tag)
            .map(|unacked| unacked.channel == channel)
            .unwrap_or(false);
        if !owned {
            let reason = format!("PRECONDITION_FAILED - unknown delivery tag {}", tag);
            close_channel_locked(&mut state, channel, &reason);
            return Err(MessagingError::Acknowledge(reason));
        }

        state.unacked.remove(&tag);
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_consumer(&self, queue: &str, stream: u64) {
        let mut state = self.state.lock();
        let delete = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumers.remove(&stream).is_some() && q.auto_delete && q.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            state.queues.remove(queue);
        }
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    async fn dial(&self, url: &str) -> MessagingResult<Arc<dyn BrokerConnection>> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if !self.is_reachable() {
            return Err(MessagingError::Connect(format!(
                "dial {}: connection refused",
                url
            )));
        }

        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let (closer, closed_rx) = watch::channel(None);
        self.inner
            .state
            .lock()
            .connections
            .insert(id, Arc::new(closer));

        debug!(connection = id, url, "In-memory connection opened");
        Ok(Arc::new(MemoryConnection {
            id,
            inner: self.inner.clone(),
            closed_rx,
        }))
    }
}

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

struct MemoryConnection {
    id: u64,
    inner: Arc<BrokerInner>,
    closed_rx: CloseReceiver,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let (closer, closed_rx) = watch::channel(None);
        {
            let mut state = self.inner.state.lock();
            if !state.connections.contains_key(&self.id) {
                return Err(MessagingError::Connect("connection closed".to_string()));
            }
            state.channels.insert(
                id,
                ChannelState {
                    connection: self.id,
                    closer: Arc::new(closer),
                },
            );
        }

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            inner: self.inner.clone(),
            closed_rx,
        }))
    }

    async fn closed(&self) -> String {
        wait_closed(&self.closed_rx).await
    }

    fn is_open(&self) -> bool {
        self.closed_rx.borrow().is_none()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.inner.close_connection(self.id, "closed by client");
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    inner: Arc<BrokerInner>,
    closed_rx: CloseReceiver,
}

impl MemoryChannel {
    /// Lock broker state, failing if this channel is no longer open
    fn open_state(
        &self,
        fail: fn(String) -> MessagingError,
    ) -> MessagingResult<parking_lot::MutexGuard<'_, BrokerState>> {
        let state = self.inner.state.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(fail("channel closed".to_string()))
        }
    }

    /// Channel-level error: the broker closes the channel with `reason`
    fn fail(
        &self,
        state: &mut BrokerState,
        kind: fn(String) -> MessagingError,
        reason: String,
    ) -> MessagingError {
        close_channel_locked(state, self.id, &reason);
        kind(reason)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> MessagingResult<()> {
        let mut state = self.open_state(MessagingError::Declare)?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, options: &ConsumeOptions) -> MessagingResult<String> {
        let mut state = self.open_state(MessagingError::Declare)?;

        let name = if queue.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            queue.to_string()
        };

        let existing = state
            .queues
            .get(&name)
            .map(|q| (q.durable, q.exclusive_owner));
        if let Some((durable, exclusive_owner)) = existing {
            let conflict = if durable != options.durable {
                Some(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    name
                ))
            } else {
                match exclusive_owner {
                    Some(owner) if owner != self.connection => Some(format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                        name
                    )),
                    _ => None,
                }
            };
            return match conflict {
                Some(reason) => Err(self.fail(&mut state, MessagingError::Declare, reason)),
                None => Ok(name),
            };
        }

        state.queues.insert(
            name.clone(),
            QueueState::new(
                options.durable,
                options.auto_delete,
                options.exclusive.then_some(self.connection),
            ),
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _no_wait: bool,
    ) -> MessagingResult<()> {
        let mut state = self.open_state(MessagingError::Declare)?;

        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{}'", queue);
            return Err(self.fail(&mut state, MessagingError::Declare, reason));
        }
        if !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{}'", exchange);
            return Err(self.fail(&mut state, MessagingError::Declare, reason));
        }

        let bound = state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .entry(routing_key.to_string())
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> MessagingResult<Box<dyn DeliveryStream>> {
        let tag = if options.consumer.is_empty() {
            format!("ctag-{}", uuid::Uuid::new_v4().simple())
        } else {
            options.consumer.clone()
        };
        let id = self.inner.next_stream.fetch_add(1, Ordering::SeqCst);

        let notify = {
            let mut state = self.open_state(MessagingError::Declare)?;
            let registered = state.queues.get_mut(queue).map(|q| {
                q.consumers.insert(id, self.id);
                q.notify.clone()
            });
            match registered {
                Some(notify) => notify,
                None => {
                    let reason = format!("NOT_FOUND - no queue '{}'", queue);
                    return Err(self.fail(&mut state, MessagingError::Declare, reason));
                }
            }
        };

        Ok(Box::new(MemoryDeliveryStream {
            id,
            inner: self.inner.clone(),
            channel: self.id,
            queue: queue.to_string(),
            tag,
            no_ack: options.auto_ack,
            notify,
            closed_rx: self.closed_rx.clone(),
            cancelled: false,
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _content_type: &str,
        body: &[u8],
    ) -> MessagingResult<()> {
        let mut state = self.open_state(MessagingError::Publish)?;

        if !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{}'", exchange);
            return Err(self.fail(&mut state, MessagingError::Publish, reason));
        }
        let targets = state
            .exchanges
            .get(exchange)
            .and_then(|bindings| bindings.get(routing_key).cloned())
            .unwrap_or_default();

        // non-mandatory: unroutable messages are dropped
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    body: body.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }

        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn closed(&self) -> String {
        wait_closed(&self.closed_rx).await
    }

    async fn close(&self) -> MessagingResult<()> {
        self.inner.close_channel(self.id, "closed by client");
        Ok(())
    }
}

struct MemoryDeliveryStream {
    id: u64,
    inner: Arc<BrokerInner>,
    channel: u64,
    queue: String,
    tag: String,
    no_ack: bool,
    notify: Arc<Notify>,
    closed_rx: CloseReceiver,
    cancelled: bool,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<MessagingResult<Delivery>> {
        let notify = self.notify.clone();
        loop {
            if self.cancelled || self.closed_rx.borrow().is_some() {
                return None;
            }

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.pop(&self.queue, self.channel, self.no_ack) {
                Popped::Message(tag, message) => {
                    let acker = MemoryAcker {
                        inner: self.inner.clone(),
                        channel: self.channel,
                    };
                    return Some(Ok(Delivery::new(
                        message.body,
                        tag,
                        message.redelivered,
                        message.routing_key,
                        Box::new(acker),
                    )));
                }
                Popped::Gone => return None,
                Popped::Empty => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = self.closed_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn cancel(&mut self) -> MessagingResult<()> {
        self.cancelled = true;
        if self.closed_rx.borrow().is_some() {
            return Err(MessagingError::Declare("channel closed".to_string()));
        }
        self.inner.remove_consumer(&self.queue, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<BrokerInner>,
    channel: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.inner.ack(self.channel, delivery_tag)
    }
}
