//! Defines the core trait for message handling logic.

use crate::broker::Message;
use crate::error::WorkerError;
use async_trait::async_trait;

/// A trait for processing messages from the task queue.
///
/// Implement this trait with your business logic. Payloads are handed over as raw bytes;
/// decoding them is up to the handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single delivered message.
    ///
    /// # Returns
    /// `Ok(())` if the message was processed successfully, or a `WorkerError` if not.
    /// What happens to a failed message depends on the worker's `AckMode`.
    async fn handle_message(&self, message: &Message) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Logs every payload, decoded as UTF-8.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), WorkerError> {
        log::info!("Received: {}", message.text());
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "LoggingHandler"
    }
}
