use thiserror::Error;

/// Outcome of a single failed connection attempt.
///
/// The connector retries `Transient` failures until its attempt budget runs out and
/// stops immediately on `Fatal` ones.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Broker unreachable, handshake refused, channel could not be opened, etc.
    #[error("broker not ready: {0}")]
    Transient(String),

    /// The connection parameters themselves are unusable; retrying cannot help.
    #[error("invalid connection parameters: {0}")]
    Fatal(String),
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectError::Transient(_))
    }
}

/// Error type for the task-queue worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Every connection attempt allowed by the retry policy failed.
    #[error("could not connect to the broker after {attempts} attempts: {last_error}")]
    ConnectionFailure { attempts: u32, last_error: ConnectError },

    /// A connection attempt failed in a way that is not worth retrying.
    #[error(transparent)]
    Connect(ConnectError),

    /// The broker connection dropped or the delivery stream ended while consuming.
    #[error("broker session lost: {0}")]
    SessionLost(String),

    /// Custom messaging-related error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError { message: String },

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {key}: {message}")]
    Config { key: String, message: String },

    /// A shutdown was requested before the worker reached the consume loop.
    #[error("shutdown requested")]
    Shutdown,
}

impl WorkerError {
    /// Builds a `HandlerError` from anything printable.
    pub fn handler<E: std::fmt::Display>(err: E) -> Self {
        WorkerError::HandlerError(err.to_string().into())
    }

    /// True when the error means the broker connection or channel is gone, as opposed to
    /// the broker rejecting a request on a healthy connection.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            WorkerError::SessionLost(_) => true,
            WorkerError::Lapin(err) => matches!(
                err,
                lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::IOError(_)
                    | lapin::Error::MissingHeartbeatError
            ),
            _ => false,
        }
    }
}
