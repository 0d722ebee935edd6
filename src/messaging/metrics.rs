//! Prometheus metrics for messaging

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

/// Messaging metrics
pub struct MessagingMetrics {
    /// Messages published counter
    pub messages_published: CounterVec,

    /// Message publish failures
    pub publish_failures: CounterVec,

    /// Deliveries pulled from a stream
    pub deliveries_received: CounterVec,

    /// Deliveries acknowledged after their handler succeeded
    pub deliveries_acked: CounterVec,

    /// Handler errors and panics
    pub handler_failures: CounterVec,

    /// Acknowledgments the transport rejected
    pub ack_failures: CounterVec,

    /// Handler latency
    pub handler_latency: HistogramVec,

    /// Reconnect attempts, labelled by outcome
    pub reconnect_attempts: CounterVec,

    /// Subscriptions that could not be replayed
    pub replay_failures: CounterVec,

    /// Running dispatcher workers
    pub active_workers: GaugeVec,

    /// Connection state (see `ConnectionState::to_metric_value`)
    pub connection_state: Gauge,
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_published: register_counter_vec!(
            "sneaker_messages_published_total",
            "Total number of messages published",
            &["exchange"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "sneaker_publish_failures_total",
            "Total number of publish failures",
            &["exchange", "error"]
        )
        .unwrap(),

        deliveries_received: register_counter_vec!(
            "sneaker_deliveries_received_total",
            "Total number of deliveries pulled by workers",
            &["queue"]
        )
        .unwrap(),

        deliveries_acked: register_counter_vec!(
            "sneaker_deliveries_acked_total",
            "Total number of deliveries acknowledged",
            &["queue"]
        )
        .unwrap(),

        handler_failures: register_counter_vec!(
            "sneaker_handler_failures_total",
            "Total number of failed handler invocations",
            &["queue", "kind"]
        )
        .unwrap(),

        ack_failures: register_counter_vec!(
            "sneaker_ack_failures_total",
            "Total number of failed acknowledgments",
            &["queue"]
        )
        .unwrap(),

        handler_latency: register_histogram_vec!(
            "sneaker_handler_latency_seconds",
            "Handler latency in seconds",
            &["queue"]
        )
        .unwrap(),

        reconnect_attempts: register_counter_vec!(
            "sneaker_reconnect_attempts_total",
            "Total number of reconnect attempts",
            &["outcome"]
        )
        .unwrap(),

        replay_failures: register_counter_vec!(
            "sneaker_replay_failures_total",
            "Total number of subscriptions that failed to replay",
            &["queue"]
        )
        .unwrap(),

        active_workers: register_gauge_vec!(
            "sneaker_active_workers",
            "Number of running dispatcher workers",
            &["queue"]
        )
        .unwrap(),

        connection_state: register_gauge!(
            "sneaker_connection_state",
            "Connection state: 0 disconnected, 1 connecting, 2 connected, 3 closing, 4 closed"
        )
        .unwrap(),
    };
}

/// Initialize messaging metrics
pub fn init_messaging_metrics() {
    lazy_static::initialize(&MESSAGING_METRICS);
}
