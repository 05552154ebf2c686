//! # Task Queue Worker
//! A RabbitMQ consumer for a single task queue, with bounded connection retry,
//! explicit acknowledgement and graceful shutdown.

pub mod amqp;
pub mod broker;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod memory;
pub mod retry;
pub mod shutdown;
pub mod worker;

// Re-export key components for easy access
pub use amqp::AmqpBroker;
pub use broker::{Acker, Broker, Delivery, DeliveryStream, Message, Session};
pub use config::{AckMode, ConnectionParams, QueueSpec, WorkerConfig, DEFAULT_QUEUE_NAME};
pub use connector::{Connected, Connector};
pub use consumer::ConsumerLoop;
pub use error::{ConnectError, WorkerError};
pub use handler::{LoggingHandler, MessageHandler};
pub use memory::InMemoryBroker;
pub use retry::{Backoff, RetryPolicy};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use worker::{exit_status, Worker};
