//! In-memory broker for testing and local development.
//!
//! `InMemoryBroker` implements `Broker` without any network I/O. It behaves like a single
//! RabbitMQ node closely enough to exercise the connect and consume paths:
//! - it can refuse the next N connection attempts, or reject bad credentials
//! - queue declaration is idempotent and rejects conflicting redeclaration
//! - messages are handed out in publish order, honouring the prefetch limit in manual ack mode
//! - nack with requeue puts the message back at the head of the queue, flagged as redelivered
//! - `drop_sessions()` simulates the broker going away: delivery streams end and unacked
//!   messages return to the queue
//!
//! ## Example
//!
//! ```
//! use task_queue_worker::{Broker, ConnectionParams, InMemoryBroker};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let broker = InMemoryBroker::new();
//! broker.refuse_connections(1);
//!
//! let params = ConnectionParams::default();
//! assert!(broker.connect(&params).await.is_err());
//! assert!(broker.connect(&params).await.is_ok());
//! assert_eq!(broker.connect_attempts(), 2);
//! # });
//! ```

use crate::broker::{Acker, Broker, Delivery, DeliveryStream, Message, Session};
use crate::config::{AckMode, ConnectionParams, QueueSpec};
use crate::error::{ConnectError, WorkerError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// In-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    refuse_next: u32,
    credentials: Option<(String, String)>,
    connect_attempts: u32,
    sessions_opened: u32,
    next_session_id: u64,
    live_sessions: HashSet<u64>,
    max_concurrent_sessions: usize,
    next_tag: u64,
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Unacked>,
    consumer: Option<ConsumerSlot>,
    handed_out: Vec<Message>,
    acked: Vec<Vec<u8>>,
    dropped: Vec<Vec<u8>>,
}

struct Stored {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    payload: Vec<u8>,
    session: u64,
}

struct ConsumerSlot {
    session: u64,
    ack_mode: AckMode,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections with these credentials; others are refused like
    /// ACCESS_REFUSED.
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        lock(&self.state).credentials = Some((username.into(), password.into()));
        self
    }

    /// Refuse the next `attempts` connection attempts as if the broker were not up yet.
    pub fn refuse_connections(&self, attempts: u32) {
        lock(&self.state).refuse_next = attempts;
    }

    /// Number of `connect` calls so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Number of successfully opened sessions so far.
    pub fn sessions_opened(&self) -> u32 {
        lock(&self.state).sessions_opened
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        lock(&self.state).live_sessions.len()
    }

    /// Highest number of sessions that were open at the same time.
    pub fn max_concurrent_sessions(&self) -> usize {
        lock(&self.state).max_concurrent_sessions
    }

    /// Publishes to the default exchange with `queue` as routing key. An undeclared queue is
    /// created on the fly, non-durable.
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = lock(&self.state);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Stored {
                payload: payload.into(),
                redelivered: false,
            });
        state.pump(queue, &self.state);
    }

    /// Simulates losing the broker: every open session is closed from the broker side.
    pub fn drop_sessions(&self) {
        let mut state = lock(&self.state);
        let sessions: Vec<u64> = state.live_sessions.iter().copied().collect();
        for session in sessions {
            state.release_session(session, &self.state);
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.state).queues.len()
    }

    /// Messages waiting in `queue`, not yet handed to a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len()).unwrap_or(0)
    }

    /// Messages handed out in manual ack mode and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len()).unwrap_or(0)
    }

    /// Every message handed to a consumer on `queue`, in hand-out order, redeliveries included.
    pub fn handed_out(&self, queue: &str) -> Vec<Message> {
        self.with_queue(queue, |q| q.handed_out.clone()).unwrap_or_default()
    }

    /// Payloads acked on `queue`.
    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.acked.clone()).unwrap_or_default()
    }

    /// Payloads nacked without requeue on `queue`.
    pub fn dropped(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.dropped.clone()).unwrap_or_default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> Option<T> {
        lock(&self.state).queues.get(queue).map(f)
    }
}

impl State {
    /// Hands ready messages to the queue's consumer while it has prefetch room.
    fn pump(&mut self, queue: &str, shared: &Arc<Mutex<State>>) {
        let State { queues, next_tag, .. } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        loop {
            let Some(slot) = q.consumer.as_ref() else {
                return;
            };
            if slot.ack_mode == AckMode::Manual && slot.prefetch > 0 {
                let in_flight = q.unacked.values().filter(|u| u.session == slot.session).count();
                if in_flight >= slot.prefetch as usize {
                    return;
                }
            }
            let Some(stored) = q.ready.pop_front() else {
                return;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let message = Message::new(stored.payload.clone(), tag, stored.redelivered);
            let delivery = Delivery {
                message: message.clone(),
                acker: Box::new(MemoryAcker {
                    state: Arc::clone(shared),
                    queue: queue.to_string(),
                    session: slot.session,
                    tag,
                    ack_mode: slot.ack_mode,
                }),
            };

            let session = slot.session;
            let manual = slot.ack_mode == AckMode::Manual;
            if slot.tx.send(delivery).is_err() {
                // Receiver gone: the consumer was cancelled without the session noticing.
                q.ready.push_front(stored);
                q.consumer = None;
                return;
            }

            q.handed_out.push(message);
            if manual {
                q.unacked.insert(
                    tag,
                    Unacked {
                        payload: stored.payload,
                        session,
                    },
                );
            }
        }
    }

    /// Closes `session`: its consumers go away and its unacked messages are requeued.
    fn release_session(&mut self, session: u64, shared: &Arc<Mutex<State>>) {
        if !self.live_sessions.remove(&session) {
            return;
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            if let Some(q) = self.queues.get_mut(name) {
                if q.consumer.as_ref().is_some_and(|slot| slot.session == session) {
                    q.consumer = None;
                }

                let mut tags: Vec<u64> = q
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.session == session)
                    .map(|(tag, _)| *tag)
                    .collect();
                tags.sort_unstable();
                for tag in tags.into_iter().rev() {
                    if let Some(unacked) = q.unacked.remove(&tag) {
                        q.ready.push_front(Stored {
                            payload: unacked.payload,
                            redelivered: true,
                        });
                    }
                }
            }
        }

        for name in &names {
            self.pump(name, shared);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Session = MemorySession;

    async fn connect(&self, params: &ConnectionParams) -> Result<MemorySession, ConnectError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;

        if params.host.trim().is_empty() {
            return Err(ConnectError::Fatal("broker host is empty".to_string()));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(ConnectError::Transient(format!(
                "connection refused by {}",
                params.address()
            )));
        }
        if let Some((username, password)) = &state.credentials {
            if *username != params.username || *password != params.password {
                return Err(ConnectError::Transient(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    params.username
                )));
            }
        }

        state.next_session_id += 1;
        let id = state.next_session_id;
        state.live_sessions.insert(id);
        state.sessions_opened += 1;
        state.max_concurrent_sessions = state.max_concurrent_sessions.max(state.live_sessions.len());

        Ok(MemorySession {
            state: Arc::clone(&self.state),
            id,
            prefetch: 0,
        })
    }
}

/// A session on an `InMemoryBroker`. Dropping it closes it.
pub struct MemorySession {
    state: Arc<Mutex<State>>,
    id: u64,
    prefetch: u16,
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession").field("id", &self.id).finish()
    }
}

impl MemorySession {
    fn ensure_live(&self, state: &State) -> Result<(), WorkerError> {
        if state.live_sessions.contains(&self.id) {
            Ok(())
        } else {
            Err(WorkerError::SessionLost(format!("session {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), WorkerError> {
        let mut state = lock(&self.state);
        self.ensure_live(&state)?;

        if let Some(existing) = state.queues.get(&queue.name) {
            if existing.durable != queue.durable {
                return Err(WorkerError::MessagingError {
                    message: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                        queue.name
                    ),
                });
            }
            return Ok(());
        }

        state.queues.insert(
            queue.name.clone(),
            QueueState {
                durable: queue.durable,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), WorkerError> {
        let state = lock(&self.state);
        self.ensure_live(&state)?;
        self.prefetch = count;
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        _consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, WorkerError> {
        let mut state = lock(&self.state);
        self.ensure_live(&state)?;

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(WorkerError::MessagingError {
                message: format!("NOT_FOUND - no queue '{}'", queue),
            });
        };
        if q.consumer.is_some() {
            return Err(WorkerError::MessagingError {
                message: format!("queue '{}' already has a consumer", queue),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumer = Some(ConsumerSlot {
            session: self.id,
            ack_mode,
            prefetch: self.prefetch,
            tx,
        });
        state.pump(queue, &self.state);

        let deliveries = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        lock(&self.state).release_session(self.id, &self.state);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        lock(&self.state).release_session(self.id, &self.state);
    }
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    queue: String,
    session: u64,
    tag: u64,
    ack_mode: AckMode,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), WorkerError> {
        let mut state = lock(&self.state);
        if !state.live_sessions.contains(&self.session) {
            return Err(WorkerError::SessionLost(format!("session {} is closed", self.session)));
        }
        if self.ack_mode == AckMode::Auto {
            return Err(WorkerError::MessagingError {
                message: format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag),
            });
        }

        let Some(q) = state.queues.get_mut(&self.queue) else {
            return Err(WorkerError::MessagingError {
                message: format!("NOT_FOUND - no queue '{}'", self.queue),
            });
        };
        let Some(unacked) = q.unacked.remove(&self.tag) else {
            return Err(WorkerError::MessagingError {
                message: format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag),
            });
        };

        match outcome {
            Settle::Ack => q.acked.push(unacked.payload),
            Settle::Requeue => q.ready.push_front(Stored {
                payload: unacked.payload,
                redelivered: true,
            }),
            Settle::Drop => q.dropped.push(unacked.payload),
        }
        state.pump(&self.queue, &self.state);
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Drop,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), WorkerError> {
        self.settle(if requeue { Settle::Requeue } else { Settle::Drop })
    }
}
