//! # Sneaker
//!
//! Self-healing AMQP consumer. A [`messaging::Consumer`] keeps one connection
//! and channel to the broker, fans every queue's deliveries out to a pool of
//! workers and, after the broker drops the connection, reconnects on a fixed
//! interval and replays every registered subscription.
//!
//! See [`messaging`] for the architecture and an example.

pub mod config;
pub mod error;
pub mod messaging;

pub use config::Config;
pub use error::{AppError, Result};
pub use messaging::{
    ConnectionState, ConsumeOptions, ConsumeOverrides, Consumer, ConsumerConfig, ConsumerEvent,
    MessageHandler, MessagingError, MessagingResult, Publisher,
};
