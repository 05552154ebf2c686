//! Bounded-retry connection establishment.

use crate::broker::Broker;
use crate::config::ConnectionParams;
use crate::error::{ConnectError, WorkerError};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownToken;

/// A freshly opened session and how many attempts it took.
pub struct Connected<S> {
    pub session: S,
    pub attempts_used: u32,
}

/// Opens broker sessions, retrying transient failures according to a `RetryPolicy`.
pub struct Connector<B: Broker> {
    broker: B,
    params: ConnectionParams,
    policy: RetryPolicy,
}

impl<B: Broker> Connector<B> {
    pub fn new(broker: B, params: ConnectionParams, policy: RetryPolicy) -> Self {
        Self {
            broker,
            params,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Tries to open a session up to `policy.max_attempts` times.
    ///
    /// Returns as soon as one attempt succeeds. A fatal `ConnectError` ends the loop at once;
    /// transient ones are logged and retried after the policy's delay. A shutdown signal
    /// interrupts both the attempt and the delay and yields `WorkerError::Shutdown`.
    pub async fn connect(&self, shutdown: &ShutdownToken) -> Result<Connected<B::Session>, WorkerError> {
        let mut shutdown = shutdown.clone();
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if shutdown.is_shutdown() {
                return Err(WorkerError::Shutdown);
            }

            log::info!(
                "Attempt {} to connect to RabbitMQ at {}",
                attempt,
                self.params.host
            );

            let outcome = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    log::info!("Shutdown requested while connecting to RabbitMQ.");
                    return Err(WorkerError::Shutdown);
                }
                outcome = self.broker.connect(&self.params) => outcome,
            };

            match outcome {
                Ok(session) => {
                    log::info!(
                        "Connected to RabbitMQ at {} after {} attempt(s).",
                        self.params.address(),
                        attempt
                    );
                    return Ok(Connected {
                        session,
                        attempts_used: attempt,
                    });
                }
                Err(ConnectError::Fatal(reason)) => {
                    log::error!("Cannot connect to RabbitMQ: {}", reason);
                    return Err(WorkerError::Connect(ConnectError::Fatal(reason)));
                }
                Err(err) => {
                    log::warn!("RabbitMQ not ready, retrying... ({})", err);
                    last_error = Some(err);
                }
            }

            if !self.policy.should_retry(attempt) {
                break;
            }

            if let Some(delay) = self.policy.delay_after(attempt) {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => {
                            log::info!("Shutdown requested while waiting to reconnect.");
                            return Err(WorkerError::Shutdown);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        log::error!(
            "Could not connect to RabbitMQ after {} attempts.",
            max_attempts
        );
        Err(WorkerError::ConnectionFailure {
            attempts: max_attempts,
            last_error: last_error
                .unwrap_or_else(|| ConnectError::Transient("no attempt was made".to_string())),
        })
    }
}
