//! Common test utilities for consumer and metrics tests
//!
//! Every consumer built here runs on an [`InMemoryBroker`] with a short
//! reconnect interval.

#![allow(dead_code)]

use parking_lot::Mutex;
use sneaker::messaging::{Consumer, ConsumerConfig, ConsumerEvent, InMemoryBroker, MessageHandler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Reconnect back-off used by the tests
pub const INTERVAL_MS: u64 = 100;

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(5);

/// Consumer config pointing at the in-memory broker
pub fn config() -> ConsumerConfig {
    ConsumerConfig {
        url: "memory://test".to_string(),
        exchange: String::new(),
        reconnect_interval_ms: INTERVAL_MS,
        ..Default::default()
    }
}

/// Connect a consumer to `broker`
pub async fn connect(broker: &InMemoryBroker) -> Consumer {
    Consumer::with_config(config(), Arc::new(broker.clone()))
        .await
        .expect("initial connect")
}

/// Poll `condition` until it holds, panicking after [`WAIT`]
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let reached = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

/// Receive events until one matches `predicate`
pub async fn next_event<P>(events: &mut broadcast::Receiver<ConsumerEvent>, predicate: P) -> ConsumerEvent
where
    P: Fn(&ConsumerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Records every payload a handler sees
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler appending each payload
    pub fn handler(&self) -> impl MessageHandler {
        let seen = self.seen.clone();
        move |payload: &[u8]| -> anyhow::Result<()> {
            seen.lock().push(payload.to_vec());
            Ok(())
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Payloads as strings, in the order they were handled
    pub fn payloads(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }
}

/// Parse Prometheus exposition format into metric name -> lines
pub fn parse_prometheus_output(output: &str) -> HashMap<String, Vec<String>> {
    let mut metrics = HashMap::new();
    let mut current_metric = String::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("# HELP") || line.starts_with("# TYPE") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                current_metric = parts[2].to_string();
                metrics
                    .entry(current_metric.clone())
                    .or_insert_with(Vec::new)
                    .push(line.to_string());
            }
        } else if !line.starts_with('#') && !current_metric.is_empty() {
            metrics
                .entry(current_metric.clone())
                .or_insert_with(Vec::new)
                .push(line.to_string());
        }
    }

    metrics
}

/// Check a metric name follows Prometheus conventions
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Extract the sample value from an exposition line
pub fn extract_metric_value(line: &str) -> Option<f64> {
    line.split_whitespace().last()?.parse::<f64>().ok()
}
