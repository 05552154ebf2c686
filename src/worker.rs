//! The worker: connect, consume, reconnect on session loss, shut down cleanly.

use crate::amqp::AmqpBroker;
use crate::broker::{Broker, Session};
use crate::connector::{Connected, Connector};
use crate::consumer::ConsumerLoop;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::shutdown::ShutdownToken;
use std::sync::Arc;

/// Process exit status for a worker run: `0` on clean shutdown, `1` otherwise.
pub fn exit_status(result: &Result<(), WorkerError>) -> u8 {
    match result {
        Ok(()) | Err(WorkerError::Shutdown) => 0,
        Err(_) => 1,
    }
}

/// A task-queue worker bound to one broker, one queue and one handler.
///
/// The worker owns everything it needs; at most one broker session is open at any time.
pub struct Worker<B: Broker, H: MessageHandler + ?Sized> {
    connector: Connector<B>,
    consumer: ConsumerLoop<H>,
    config: WorkerConfig,
}

impl<H: MessageHandler + ?Sized + 'static> Worker<AmqpBroker, H> {
    /// Creates a worker that talks to RabbitMQ.
    pub fn amqp(handler: Arc<H>, config: WorkerConfig) -> Self {
        Self::new(AmqpBroker::new(), handler, config)
    }
}

impl<B: Broker, H: MessageHandler + ?Sized + 'static> Worker<B, H> {
    /// Creates a new worker.
    pub fn new(broker: B, handler: Arc<H>, config: WorkerConfig) -> Self {
        let connector = Connector::new(broker, config.connection.clone(), config.retry_policy.clone());
        let consumer = ConsumerLoop::new(&config, handler);
        Self {
            connector,
            consumer,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Connects and consumes until `shutdown` fires.
    ///
    /// A lost session, including a connection that drops while the queue is being declared,
    /// is replaced using the same retry policy as the initial connect, unless reconnecting
    /// is disabled. Returns `Ok(())` on shutdown; `ConnectionFailure` once a
    /// connect or reconnect runs out of attempts.
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<(), WorkerError> {
        self.config.validate()?;
        log::info!(
            "Starting worker for queue '{}' on {}",
            self.config.queue.name,
            self.config.connection.address()
        );

        loop {
            let Connected {
                mut session,
                attempts_used,
            } = match self.connector.connect(&shutdown).await {
                Ok(connected) => connected,
                Err(WorkerError::Shutdown) => {
                    log::info!("Worker stopped before a session was established.");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            log::debug!("Session established after {} attempt(s).", attempts_used);

            match self.consumer.run(&mut session, &shutdown).await {
                Ok(()) => {
                    close_session(&mut session).await;
                    log::info!("Worker has shut down.");
                    return Ok(());
                }
                Err(WorkerError::SessionLost(reason)) if self.config.reconnect => {
                    log::warn!("Broker session lost ({}). Reconnecting...", reason);
                    // Release the dead session before opening its replacement.
                    drop(session);
                }
                Err(e) => {
                    log::error!("Worker failed: {}", e);
                    close_session(&mut session).await;
                    return Err(e);
                }
            }
        }
    }
}

async fn close_session<S: Session>(session: &mut S) {
    if let Err(e) = session.close().await {
        log::warn!("Failed to close broker session cleanly: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliveryStream, Message};
    use crate::config::{AckMode, ConnectionParams, QueueSpec};
    use crate::error::ConnectError;
    use crate::memory::{InMemoryBroker, MemorySession};
    use crate::retry::RetryPolicy;
    use crate::shutdown::shutdown_channel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const QUEUE: &str = "task-queue";

    struct Forward(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle_message(&self, message: &Message) -> Result<(), WorkerError> {
            let _ = self.0.send(message.payload.clone());
            Ok(())
        }

        fn handler_name(&self) -> &str {
            "Forward"
        }
    }

    fn config(policy: RetryPolicy) -> WorkerConfig {
        WorkerConfig::builder(QUEUE, ConnectionParams::default())
            .retry_policy(policy)
            .build()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler was not invoked in time")
            .expect("handler channel closed")
    }

    /// Wraps the in-memory broker so that the first session loses its connection while
    /// declaring the queue, the way lapin reports a socket closed mid-setup.
    #[derive(Clone)]
    struct DropsDuringDeclare {
        inner: InMemoryBroker,
        armed: Arc<AtomicBool>,
    }

    impl DropsDuringDeclare {
        fn new(inner: InMemoryBroker) -> Self {
            Self {
                inner,
                armed: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    struct DeclareGuard {
        inner: MemorySession,
        fail_declare: bool,
    }

    #[async_trait]
    impl Broker for DropsDuringDeclare {
        type Session = DeclareGuard;

        async fn connect(&self, params: &ConnectionParams) -> Result<DeclareGuard, ConnectError> {
            let inner = self.inner.connect(params).await?;
            Ok(DeclareGuard {
                inner,
                fail_declare: self.armed.swap(false, Ordering::SeqCst),
            })
        }
    }

    #[async_trait]
    impl Session for DeclareGuard {
        async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), WorkerError> {
            if self.fail_declare {
                return Err(WorkerError::Lapin(lapin::Error::InvalidConnectionState(
                    lapin::ConnectionState::Closed,
                )));
            }
            self.inner.declare_queue(queue).await
        }

        async fn set_prefetch(&mut self, count: u16) -> Result<(), WorkerError> {
            self.inner.set_prefetch(count).await
        }

        async fn consume(
            &mut self,
            queue: &str,
            consumer_tag: &str,
            ack_mode: AckMode,
        ) -> Result<DeliveryStream, WorkerError> {
            self.inner.consume(queue, consumer_tag, ack_mode).await
        }

        async fn close(&mut self) -> Result<(), WorkerError> {
            self.inner.close().await
        }
    }

    async fn wait_for_sessions(broker: &InMemoryBroker, opened: u32) {
        while broker.sessions_opened() < opened || broker.open_sessions() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(&Ok(())), 0);
        assert_eq!(exit_status(&Err(WorkerError::Shutdown)), 0);
        let exhausted = Err(WorkerError::ConnectionFailure {
            attempts: 20,
            last_error: ConnectError::Transient("refused".into()),
        });
        assert_eq!(exit_status(&exhausted), 1);
        assert_eq!(exit_status(&Err(WorkerError::SessionLost("gone".into()))), 1);
    }

    #[tokio::test]
    async fn test_run_fails_when_retries_exhausted() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(u32::MAX);
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = Worker::new(broker.clone(), Arc::new(Forward(tx)), config(RetryPolicy::immediate(3)));
        let (_sender, token) = shutdown_channel();

        let result = worker.run(token).await;
        assert!(matches!(result, Err(WorkerError::ConnectionFailure { attempts: 3, .. })));
        assert_eq!(exit_status(&result), 1);
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::new(broker.clone(), Arc::new(Forward(tx)), config(RetryPolicy::immediate(3)));
        let (sender, token) = shutdown_channel();
        let task = tokio::spawn(async move { worker.run(token).await });

        wait_for_sessions(&broker, 1).await;
        broker.publish(QUEUE, "job");
        assert_eq!(recv(&mut rx).await, b"job");

        sender.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.acked(QUEUE), vec![b"job".to_vec()]);
    }

    #[tokio::test]
    async fn test_reconnects_after_session_loss() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::new(broker.clone(), Arc::new(Forward(tx)), config(RetryPolicy::immediate(5)));
        let (sender, token) = shutdown_channel();
        let task = tokio::spawn(async move { worker.run(token).await });

        wait_for_sessions(&broker, 1).await;
        broker.publish(QUEUE, "before");
        assert_eq!(recv(&mut rx).await, b"before");

        // The broker goes away and refuses the first two reconnect attempts.
        broker.refuse_connections(2);
        broker.drop_sessions();
        broker.publish(QUEUE, "after");
        assert_eq!(recv(&mut rx).await, b"after");

        sender.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(broker.sessions_opened(), 2);
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(broker.max_concurrent_sessions(), 1);
    }

    #[tokio::test]
    async fn test_session_loss_is_fatal_without_reconnect() {
        let broker = InMemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WorkerConfig::builder(QUEUE, ConnectionParams::default())
            .retry_policy(RetryPolicy::immediate(5))
            .ack_mode(AckMode::Auto)
            .reconnect(false)
            .build();
        let worker = Worker::new(broker.clone(), Arc::new(Forward(tx)), config);
        let (_sender, token) = shutdown_channel();
        let task = tokio::spawn(async move { worker.run(token).await });

        wait_for_sessions(&broker, 1).await;
        broker.drop_sessions();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(WorkerError::SessionLost(_))));
        assert_eq!(broker.sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_initial_backoff_is_clean() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(u32::MAX);
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            broker.clone(),
            Arc::new(Forward(tx)),
            config(RetryPolicy::fixed(20, Duration::from_secs(5))),
        );
        let (sender, token) = shutdown_channel();
        let task = tokio::spawn(async move { worker.run(token).await });

        tokio::time::sleep(Duration::from_secs(12)).await;
        sender.shutdown();

        let result = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_connection_closed_during_declare_reconnects() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            DropsDuringDeclare::new(broker.clone()),
            Arc::new(Forward(tx)),
            config(RetryPolicy::immediate(20)),
        );
        let (sender, token) = shutdown_channel();
        let task = tokio::spawn(async move { worker.run(token).await });

        wait_for_sessions(&broker, 2).await;
        broker.publish(QUEUE, "job");
        assert_eq!(recv(&mut rx).await, b"job");

        sender.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.sessions_opened(), 2);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_blank_queue_name_fails_before_connecting() {
        let broker = InMemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WorkerConfig::builder("", ConnectionParams::default()).build();
        let worker = Worker::new(broker.clone(), Arc::new(Forward(tx)), config);
        let (_sender, token) = shutdown_channel();

        let result = worker.run(token).await;
        assert!(matches!(result, Err(WorkerError::Config { .. })));
        assert_eq!(exit_status(&result), 1);
        assert_eq!(broker.connect_attempts(), 0);
    }
}
