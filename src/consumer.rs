//! The consume loop: declare the queue, subscribe, and dispatch deliveries one at a time.

use crate::broker::{Delivery, Session};
use crate::config::{AckMode, QueueSpec, WorkerConfig};
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::shutdown::ShutdownToken;
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Runs a handler against one queue on an already open session.
pub struct ConsumerLoop<H: MessageHandler + ?Sized> {
    handler: Arc<H>,
    queue: QueueSpec,
    consumer_tag: String,
    ack_mode: AckMode,
    prefetch_count: u16,
}

impl<H: MessageHandler + ?Sized> ConsumerLoop<H> {
    pub fn new(config: &WorkerConfig, handler: Arc<H>) -> Self {
        Self {
            handler,
            queue: config.queue.clone(),
            consumer_tag: config.consumer_tag.clone(),
            ack_mode: config.ack_mode,
            prefetch_count: config.prefetch_count,
        }
    }

    /// Declares the queue, starts consuming and handles deliveries in order until
    /// `shutdown` fires or the session goes away.
    ///
    /// Returns `Ok(())` only on shutdown. A failed or ended delivery stream yields
    /// `WorkerError::SessionLost`; handler failures never end the loop.
    pub async fn run<S>(&self, session: &mut S, shutdown: &ShutdownToken) -> Result<(), WorkerError>
    where
        S: Session + ?Sized,
    {
        self.queue.validate()?;

        session.declare_queue(&self.queue).await.map_err(setup_error)?;

        if self.ack_mode == AckMode::Manual {
            session
                .set_prefetch(self.prefetch_count)
                .await
                .map_err(setup_error)?;
        }

        let mut deliveries = session
            .consume(&self.queue.name, &self.consumer_tag, self.ack_mode)
            .await
            .map_err(setup_error)?;

        log::info!(
            "Waiting for messages on '{}' with handler '{}' ({:?} ack)...",
            self.queue.name,
            self.handler.handler_name(),
            self.ack_mode
        );

        let mut shutdown = shutdown.clone();
        let mut handled: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    log::info!(
                        "Shutdown requested. Consumer on '{}' stopped after {} messages.",
                        self.queue.name,
                        handled
                    );
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.dispatch(delivery).await?;
                        handled += 1;
                    }
                    Some(Err(e)) => return Err(into_session_lost(e)),
                    None => {
                        return Err(WorkerError::SessionLost(
                            "delivery stream closed by the broker".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Hands one delivery to the handler and settles it according to the ack mode.
    async fn dispatch(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let Delivery { message, acker } = delivery;
        let tag = message.delivery_tag;
        log::debug!(
            "Delivery {} ({} bytes, redelivered: {})",
            tag,
            message.payload.len(),
            message.redelivered
        );

        let result = match AssertUnwindSafe(self.handler.handle_message(&message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(WorkerError::handler(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match (self.ack_mode, result) {
            (AckMode::Auto, Ok(())) => {}
            (AckMode::Auto, Err(e)) => {
                log::error!(
                    "Failed to process message, it is lost (auto-ack). Tag: {}, Error: {}",
                    tag,
                    e
                );
            }
            (AckMode::Manual, Ok(())) => {
                acker.ack().await.map_err(into_session_lost)?;
                log::debug!("Message processed successfully. Tag: {}", tag);
            }
            (AckMode::Manual, Err(e)) => {
                // Requeue once; a message that already came back is dropped to avoid a hot loop.
                let requeue = !message.redelivered;
                acker.nack(requeue).await.map_err(into_session_lost)?;
                if requeue {
                    log::warn!("Failed to process message, requeued. Tag: {}, Error: {}", tag, e);
                } else {
                    log::error!(
                        "Failed to process redelivered message, dropping it. Tag: {}, Error: {}",
                        tag,
                        e
                    );
                }
            }
        }

        Ok(())
    }
}

/// Any failure to talk to the broker mid-consume means the session is unusable.
fn into_session_lost(err: WorkerError) -> WorkerError {
    match err {
        WorkerError::SessionLost(_) => err,
        other => WorkerError::SessionLost(other.to_string()),
    }
}

/// A dropped connection during setup is session loss; a broker refusal stays as it is.
fn setup_error(err: WorkerError) -> WorkerError {
    if err.is_connection_loss() {
        into_session_lost(err)
    } else {
        err
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
