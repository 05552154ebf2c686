//! Worker configuration: connection parameters, queue, acknowledgement and retry settings.

use crate::error::WorkerError;
use crate::retry::{Backoff, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Queue consumed when `BROKER_QUEUE` is not set.
pub const DEFAULT_QUEUE_NAME: &str = "task-queue";

const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Where and as whom to connect.
#[derive(Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// `host:port/vhost`, safe to put in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    fn vhost_path(&self) -> String {
        if self.vhost.starts_with('/') {
            self.vhost.clone()
        } else {
            format!("/{}", self.vhost)
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

// Hand-written so the password never ends up in a log line.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The queue to declare and consume from.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Must match how the producer declares the queue, otherwise the broker rejects
    /// the declaration with PRECONDITION_FAILED.
    pub durable: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
        }
    }

    /// Rejects names the broker would treat as a request for a server-named queue.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.name.trim().is_empty() {
            return Err(WorkerError::Config {
                key: "queue".to_string(),
                message: "queue name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// When a delivered message counts as consumed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The broker forgets the message as soon as it is handed over (at-most-once).
    /// A handler failure or crash loses the message.
    Auto,
    /// The message is acked after the handler succeeds and nacked otherwise (at-least-once).
    Manual,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "manual" => Ok(AckMode::Manual),
            other => Err(format!("expected `auto` or `manual`, got `{}`", other)),
        }
    }
}

/// Shape of the delay between connection attempts, as named in `BROKER_RETRY_BACKOFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("expected `fixed` or `exponential`, got `{}`", other)),
        }
    }
}

/// Configuration for a `Worker`.
///
/// Use `WorkerConfig::builder()` or `WorkerConfig::from_env()` to construct this struct.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    /// Broker address and credentials.
    pub connection: ConnectionParams,
    /// The queue to consume messages from.
    pub queue: QueueSpec,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// Acknowledgement mode for deliveries.
    pub ack_mode: AckMode,
    /// The number of unacknowledged messages the broker may push at a time (manual ack only).
    pub prefetch_count: u16,
    /// Attempt budget and backoff used for the initial connect and every reconnect.
    pub retry_policy: RetryPolicy,
    /// Whether to reconnect when the session drops while consuming.
    pub reconnect: bool,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the queue to consume from.
    /// * `connection` - Broker address and credentials.
    pub fn builder(queue_name: impl Into<String>, connection: ConnectionParams) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name.into(), connection)
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    ///
    /// `BROKER_*` names take precedence; the `RABBITMQ_*` names are accepted as fallbacks
    /// for the connection settings.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = ConnectionParams::default();

        let connection = ConnectionParams {
            host: env.string(&["BROKER_HOST", "RABBITMQ_HOST"]).unwrap_or(defaults.host),
            port: env.parse::<u16>(&["BROKER_PORT", "RABBITMQ_PORT"])?.unwrap_or(defaults.port),
            vhost: env.string(&["BROKER_VHOST", "RABBITMQ_VHOST"]).unwrap_or(defaults.vhost),
            username: env.string(&["BROKER_USER", "RABBITMQ_USER"]).unwrap_or(defaults.username),
            password: env.string(&["BROKER_PASS", "RABBITMQ_PASS"]).unwrap_or(defaults.password),
        };

        let queue_name = env
            .string(&["BROKER_QUEUE"])
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());

        let max_attempts = env.parse::<u32>(&["BROKER_CONNECT_ATTEMPTS"])?.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(WorkerError::Config {
                key: "BROKER_CONNECT_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let delay = env
            .parse::<u64>(&["BROKER_RETRY_DELAY_MS"])?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_DELAY);
        let max_delay = env
            .parse::<u64>(&["BROKER_RETRY_MAX_DELAY_MS"])?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MAX_RETRY_DELAY);
        let backoff = match env
            .parse::<BackoffKind>(&["BROKER_RETRY_BACKOFF"])?
            .unwrap_or(BackoffKind::Fixed)
        {
            BackoffKind::Fixed => Backoff::Fixed(delay),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: delay,
                multiplier: 2.0,
                max: max_delay,
            },
        };

        let mut builder = Self::builder(queue_name, connection)
            .durable(env.parse::<bool>(&["BROKER_QUEUE_DURABLE"])?.unwrap_or(false))
            .retry_policy(RetryPolicy::new(max_attempts, backoff))
            .reconnect(env.parse::<bool>(&["BROKER_RECONNECT"])?.unwrap_or(true));

        if let Some(ack_mode) = env.parse::<AckMode>(&["BROKER_ACK_MODE"])? {
            builder = builder.ack_mode(ack_mode);
        }
        if let Some(prefetch) = env.parse::<u16>(&["BROKER_PREFETCH"])? {
            builder = builder.prefetch_count(prefetch);
        }
        if let Some(tag) = env.string(&["BROKER_CONSUMER_TAG"]) {
            builder = builder.consumer_tag(tag);
        }

        let config = builder.build();
        config.validate().map_err(|_| WorkerError::Config {
            key: "BROKER_QUEUE".to_string(),
            message: "queue name must not be empty".to_string(),
        })?;
        Ok(config)
    }

    /// Checks the settings that cannot be expressed in the types, such as a blank queue name.
    pub fn validate(&self) -> Result<(), WorkerError> {
        self.queue.validate()
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// First non-empty value among `keys`.
    fn string(&self, keys: &[&str]) -> Option<String> {
        self.entry(keys).map(|(_, value)| value)
    }

    fn parse<T>(&self, keys: &[&str]) -> Result<Option<T>, WorkerError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.entry(keys) {
            None => Ok(None),
            Some((key, value)) => value.trim().parse().map(Some).map_err(|e: T::Err| WorkerError::Config {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn entry<'k>(&self, keys: &[&'k str]) -> Option<(&'k str, String)> {
        keys.iter()
            .find_map(|key| (self.lookup)(key).filter(|v| !v.is_empty()).map(|v| (*key, v)))
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    connection: ConnectionParams,
    durable: Option<bool>,
    consumer_tag: Option<String>,
    ack_mode: Option<AckMode>,
    prefetch_count: Option<u16>,
    retry_policy: Option<RetryPolicy>,
    reconnect: Option<bool>,
}

impl WorkerConfigBuilder {
    /// Creates a new builder with the required fields.
    fn new(queue_name: String, connection: ConnectionParams) -> Self {
        Self {
            queue_name,
            connection,
            durable: None,
            consumer_tag: None,
            ack_mode: None,
            prefetch_count: None,
            retry_policy: None,
            reconnect: None,
        }
    }

    /// Declares the queue as durable. Defaults to `false`.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Sets the acknowledgement mode. Defaults to `AckMode::Manual`.
    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = Some(ack_mode);
        self
    }

    /// Sets a custom prefetch count (QoS). Only applied in manual ack mode.
    /// Defaults to 1.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Sets a custom retry policy.
    /// Defaults to `RetryPolicy::default()` (20 attempts, 3 seconds apart).
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Enables or disables reconnecting after a lost session. Defaults to `true`.
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        let queue_name = self.queue_name;
        WorkerConfig {
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", queue_name)),
            ack_mode: self.ack_mode.unwrap_or(AckMode::Manual),
            prefetch_count: self.prefetch_count.unwrap_or(1),
            retry_policy: self.retry_policy.unwrap_or_default(),
            reconnect: self.reconnect.unwrap_or(true),
            queue: QueueSpec {
                name: queue_name,
                durable: self.durable.unwrap_or(false),
            },
            connection: self.connection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_worker_config_builder_defaults() {
        let config = WorkerConfig::builder("test_queue", ConnectionParams::default()).build();

        assert_eq!(config.queue.name, "test_queue");
        assert!(!config.queue.durable);
        assert_eq!(config.consumer_tag, "test_queue_consumer");
        assert_eq!(config.ack_mode, AckMode::Manual);
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.retry_policy, RetryPolicy::default());
        assert!(config.reconnect);
    }

    #[test]
    fn test_worker_config_builder_custom_values() {
        let config = WorkerConfig::builder("test_queue", ConnectionParams::new("localhost", "app", "secret"))
            .durable(true)
            .consumer_tag("custom_consumer")
            .ack_mode(AckMode::Auto)
            .prefetch_count(10)
            .retry_policy(RetryPolicy::immediate(5))
            .reconnect(false)
            .build();

        assert!(config.queue.durable);
        assert_eq!(config.consumer_tag, "custom_consumer");
        assert_eq!(config.ack_mode, AckMode::Auto);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert!(!config.reconnect);
        assert_eq!(config.connection.host, "localhost");
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.connection.host, "rabbitmq");
        assert_eq!(config.connection.username, "guest");
        assert_eq!(config.connection.password, "guest");
        assert_eq!(config.connection.port, 5672);
        assert_eq!(config.queue.name, "task-queue");
        assert_eq!(config.retry_policy.max_attempts, 20);
        assert_eq!(config.ack_mode, AckMode::Manual);
    }

    #[test]
    fn test_from_lookup_prefers_broker_names_over_rabbitmq_names() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("BROKER_HOST", "broker.internal"),
            ("RABBITMQ_HOST", "ignored"),
            ("RABBITMQ_USER", "legacy-user"),
            ("BROKER_PASS", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.connection.host, "broker.internal");
        assert_eq!(config.connection.username, "legacy-user");
        assert_eq!(config.connection.password, "s3cret");
    }

    #[test]
    fn test_from_lookup_retry_and_ack_settings() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("BROKER_CONNECT_ATTEMPTS", "5"),
            ("BROKER_RETRY_DELAY_MS", "100"),
            ("BROKER_RETRY_BACKOFF", "exponential"),
            ("BROKER_RETRY_MAX_DELAY_MS", "800"),
            ("BROKER_ACK_MODE", "AUTO"),
            ("BROKER_PREFETCH", "4"),
            ("BROKER_RECONNECT", "false"),
        ]))
        .unwrap();

        assert_eq!(
            config.retry_policy,
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(800))
        );
        assert_eq!(config.ack_mode, AckMode::Auto);
        assert_eq!(config.prefetch_count, 4);
        assert!(!config.reconnect);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = WorkerConfig::from_lookup(lookup(&[("BROKER_PORT", "amqp")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config { ref key, .. } if key == "BROKER_PORT"));

        let err = WorkerConfig::from_lookup(lookup(&[("BROKER_CONNECT_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config { ref key, .. } if key == "BROKER_CONNECT_ATTEMPTS"));

        let err = WorkerConfig::from_lookup(lookup(&[("BROKER_ACK_MODE", "sometimes")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config { ref key, .. } if key == "BROKER_ACK_MODE"));
    }

    #[test]
    fn test_backoff_kind_ignores_case_and_whitespace() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("BROKER_RETRY_BACKOFF", "Exponential "),
            ("BROKER_RETRY_DELAY_MS", "100"),
        ]))
        .unwrap();
        assert!(matches!(config.retry_policy.backoff, Backoff::Exponential { .. }));

        let config = WorkerConfig::from_lookup(lookup(&[("BROKER_RETRY_BACKOFF", " FIXED")])).unwrap();
        assert_eq!(config.retry_policy.backoff, Backoff::Fixed(DEFAULT_RETRY_DELAY));

        let err = WorkerConfig::from_lookup(lookup(&[("BROKER_RETRY_BACKOFF", "linear")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config { ref key, .. } if key == "BROKER_RETRY_BACKOFF"));
    }

    #[test]
    fn test_blank_queue_name_is_rejected() {
        let config = WorkerConfig::builder("", ConnectionParams::default()).build();
        assert!(matches!(config.validate(), Err(WorkerError::Config { .. })));

        let config = WorkerConfig::builder("  ", ConnectionParams::default()).build();
        assert!(config.validate().is_err());

        let err = WorkerConfig::from_lookup(lookup(&[("BROKER_QUEUE", "   ")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config { ref key, .. } if key == "BROKER_QUEUE"));

        assert!(WorkerConfig::builder("jobs", ConnectionParams::default())
            .build()
            .validate()
            .is_ok());
    }

    #[test]
    fn test_debug_and_json_hide_password() {
        let params = ConnectionParams::new("localhost", "app", "hunter2");
        assert!(!format!("{:?}", params).contains("hunter2"));

        let config = WorkerConfig::builder("q", params).build();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"ack_mode\":\"manual\""));
    }

    #[test]
    fn test_address_formats_vhost() {
        let mut params = ConnectionParams::new("localhost", "guest", "guest");
        assert_eq!(params.address(), "localhost:5672/");
        params.vhost = "jobs".to_string();
        assert_eq!(params.address(), "localhost:5672/jobs");
    }
}
