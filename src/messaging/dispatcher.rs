//! Worker pool draining one subscription's delivery stream.
//!
//! `threads` workers share a single stream (competing consumers). Each worker
//! pulls one delivery at a time, runs the handler on the blocking pool and,
//! unless the broker acknowledges on send, acknowledges that single delivery
//! once the handler has returned successfully. A failing or panicking handler
//! is reported and its delivery is left unacknowledged.
//!
//! Stopping cancels the broker-side consumer first, then waits for in-flight
//! handlers, then closes the subscription's channel. Closing the channel hands
//! any delivery the broker pushed but no worker pulled back to the queue.

use crate::messaging::delivery::Delivery;
use crate::messaging::error::MessagingError;
use crate::messaging::events::ConsumerEvent;
use crate::messaging::handler::MessageHandler;
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::options::ConsumeOptions;
use crate::messaging::traits::{BrokerChannel, DeliveryStream};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type SharedStream = Arc<Mutex<Box<dyn DeliveryStream>>>;

/// Spawns the worker pool for one subscription
pub struct DeliveryDispatcher {
    queue: String,
    options: Arc<ConsumeOptions>,
    handler: Arc<dyn MessageHandler>,
    events: broadcast::Sender<ConsumerEvent>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl DeliveryDispatcher {
    /// Create a dispatcher for `queue`
    pub fn new(
        queue: impl Into<String>,
        options: Arc<ConsumeOptions>,
        handler: Arc<dyn MessageHandler>,
        events: broadcast::Sender<ConsumerEvent>,
    ) -> Self {
        Self {
            queue: queue.into(),
            options,
            handler,
            events,
            channel: None,
        }
    }

    /// Hand the channel the stream was opened on to the dispatcher.
    ///
    /// The channel is closed once the pool has stopped.
    pub fn with_channel(mut self, channel: Arc<dyn BrokerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Spawn exactly `options.threads` workers over `stream`.
    ///
    /// Workers stop when the stream closes or `cancel` fires.
    pub fn spawn(self, stream: Box<dyn DeliveryStream>, cancel: CancellationToken) -> DispatcherHandle {
        let consumer_tag = stream.consumer_tag().to_string();
        let stream: SharedStream = Arc::new(Mutex::new(stream));
        let threads = self.options.threads;

        let context = Arc::new(WorkerContext {
            queue: self.queue.clone(),
            auto_ack: self.options.auto_ack,
            handler: self.handler,
            events: self.events,
        });

        let workers = (0..threads)
            .map(|worker| {
                tokio::spawn(run_worker(
                    context.clone(),
                    worker,
                    stream.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        debug!(
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            threads,
            "Dispatcher started"
        );

        DispatcherHandle {
            queue: self.queue,
            consumer_tag,
            cancel,
            workers,
            stream,
            channel: self.channel,
        }
    }
}

/// Handle to a running worker pool.
///
/// Dropping the handle cancels the workers; use [`DispatcherHandle::shutdown`]
/// to also wait for them and cancel the broker-side consumer.
pub struct DispatcherHandle {
    queue: String,
    consumer_tag: String,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    stream: SharedStream,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl DispatcherHandle {
    /// Consumer tag of the underlying stream
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Number of workers spawned
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Check if every worker has exited
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|worker| worker.is_finished())
    }

    /// Stop the pool without waiting for in-flight handlers.
    ///
    /// Workers never pull another delivery once this returns. The broker-side
    /// consumer is cancelled in the background right away; the channel is
    /// closed after the last in-flight handler has finished.
    pub fn stop(self) {
        self.cancel.cancel();
        tokio::spawn(async move {
            let mut handle = self;
            handle.drain().await;
        });
    }

    /// Stop the pool, wait for every worker and cancel the broker-side consumer
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.drain().await;
    }

    async fn drain(&mut self) {
        // cancelled workers release the stream without waiting for their handlers
        {
            let mut stream = self.stream.lock().await;
            if let Err(err) = stream.cancel().await {
                // expected when the connection is already gone
                debug!(
                    queue = %self.queue,
                    consumer_tag = %self.consumer_tag,
                    error = %err,
                    "Consumer cancel failed"
                );
            }
        }

        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                warn!(queue = %self.queue, error = %err, "Worker terminated abnormally");
            }
        }

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(queue = %self.queue, error = %err, "Channel close failed");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WorkerContext {
    queue: String,
    auto_ack: bool,
    handler: Arc<dyn MessageHandler>,
    events: broadcast::Sender<ConsumerEvent>,
}

async fn run_worker(
    context: Arc<WorkerContext>,
    worker: usize,
    stream: SharedStream,
    cancel: CancellationToken,
) {
    let gauge = MESSAGING_METRICS
        .active_workers
        .with_label_values(&[&context.queue]);
    gauge.inc();
    debug!(queue = %context.queue, worker, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = async {
                let mut stream = stream.lock().await;
                stream.next().await
            } => next,
        };

        match next {
            Some(Ok(delivery)) => context.process(worker, delivery).await,
            Some(Err(err)) => {
                warn!(queue = %context.queue, worker, error = %err, "Delivery stream failed");
                break;
            }
            None => {
                debug!(queue = %context.queue, worker, "Delivery stream closed");
                break;
            }
        }
    }

    gauge.dec();
    debug!(queue = %context.queue, worker, "Worker stopped");
}

impl WorkerContext {
    async fn process(&self, worker: usize, delivery: Delivery) {
        MESSAGING_METRICS
            .deliveries_received
            .with_label_values(&[&self.queue])
            .inc();

        let (payload, pending) = delivery.into_parts();
        let delivery_tag = pending.delivery_tag();
        let handler = self.handler.clone();

        let start = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || handler.handle(&payload)).await;
        MESSAGING_METRICS
            .handler_latency
            .with_label_values(&[&self.queue])
            .observe(start.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(("error", format!("{:#}", err))),
            Err(err) if err.is_panic() => Some(("panic", panic_message(err.into_panic()))),
            Err(err) => Some(("cancelled", err.to_string())),
        };

        if let Some((kind, message)) = failure {
            let err = MessagingError::Handler(message);
            error!(
                queue = %self.queue,
                worker,
                delivery_tag,
                kind,
                error = %err,
                "Handler failed, delivery left unacknowledged"
            );
            MESSAGING_METRICS
                .handler_failures
                .with_label_values(&[&self.queue, kind])
                .inc();
            let _ = self.events.send(ConsumerEvent::HandlerFailed {
                queue: self.queue.clone(),
                delivery_tag,
                error: err.to_string(),
            });
            return;
        }

        if self.auto_ack {
            return;
        }

        match pending.ack().await {
            Ok(()) => {
                MESSAGING_METRICS
                    .deliveries_acked
                    .with_label_values(&[&self.queue])
                    .inc();
            }
            Err(err) => {
                warn!(
                    queue = %self.queue,
                    worker,
                    delivery_tag,
                    error = %err,
                    "Acknowledgment failed"
                );
                MESSAGING_METRICS
                    .ack_failures
                    .with_label_values(&[&self.queue])
                    .inc();
                let _ = self.events.send(ConsumerEvent::AckFailed {
                    queue: self.queue.clone(),
                    delivery_tag,
                    error: err.to_string(),
                });
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
