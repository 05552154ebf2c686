//! The seam between the worker and a message broker.
//!
//! `AmqpBroker` implements these traits on top of `lapin`; `InMemoryBroker` implements them
//! without a network so the connect and consume logic can be exercised in tests.

use crate::config::{AckMode, ConnectionParams, QueueSpec};
use crate::error::{ConnectError, WorkerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::borrow::Cow;

/// A message as handed to a `MessageHandler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw payload; no schema is imposed.
    pub payload: Vec<u8>,
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Set by the broker when the message was delivered before and not acked.
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, delivery_tag: u64, redelivered: bool) -> Self {
        Self {
            payload: payload.into(),
            delivery_tag,
            redelivered,
            received_at: Utc::now(),
        }
    }

    /// The payload decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), WorkerError>;

    /// Negative acknowledgement. With `requeue` the broker delivers the message again,
    /// otherwise it is discarded.
    async fn nack(&self, requeue: bool) -> Result<(), WorkerError>;
}

/// A delivered message together with the handle used to settle it.
pub struct Delivery {
    pub message: Message,
    pub acker: Box<dyn Acker>,
}

/// Deliveries in broker order. An `Err` item or the end of the stream means the session is gone.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, WorkerError>>;

/// An open, authenticated connection with one channel.
#[async_trait]
pub trait Session: Send {
    /// Declares the queue. Repeating the declaration with the same properties is a no-op.
    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), WorkerError>;

    /// Limits how many unacked deliveries the broker pushes at once.
    async fn set_prefetch(&mut self, count: u16) -> Result<(), WorkerError>;

    /// Registers a consumer on `queue` and returns its deliveries.
    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, WorkerError>;

    /// Closes the channel and the connection.
    async fn close(&mut self) -> Result<(), WorkerError>;
}

/// Opens sessions. One call is one connection attempt; retrying is the connector's job.
#[async_trait]
pub trait Broker: Send + Sync {
    type Session: Session + 'static;

    async fn connect(&self, params: &ConnectionParams) -> Result<Self::Session, ConnectError>;
}
