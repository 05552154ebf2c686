//! `Broker` implementation for RabbitMQ on top of `lapin`.

use crate::broker::{Acker, Broker, Delivery, DeliveryStream, Message, Session};
use crate::config::{AckMode, ConnectionParams, QueueSpec};
use crate::error::{ConnectError, WorkerError};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    uri::{AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};

const REPLY_SUCCESS: u16 = 200;

/// Connects to a RabbitMQ broker over AMQP 0-9-1.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom `lapin` connection properties (executor, reactor, client properties).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Session = AmqpSession;

    async fn connect(&self, params: &ConnectionParams) -> Result<AmqpSession, ConnectError> {
        let uri = amqp_uri(params)?;

        let connection = Connection::connect_uri(uri, self.properties.clone())
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        // A connection without a channel is useless to the caller; don't leak it.
        match connection.create_channel().await {
            Ok(channel) => Ok(AmqpSession { connection, channel }),
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "channel setup failed").await {
                    log::debug!("Closing half-open connection failed: {}", close_err);
                }
                Err(ConnectError::Transient(format!("could not open channel: {}", e)))
            }
        }
    }
}

/// Builds the URI field by field so credentials never need percent-encoding.
fn amqp_uri(params: &ConnectionParams) -> Result<AMQPUri, ConnectError> {
    if params.host.trim().is_empty() {
        return Err(ConnectError::Fatal("broker host is empty".to_string()));
    }
    if params.username.is_empty() {
        return Err(ConnectError::Fatal("broker username is empty".to_string()));
    }

    let mut uri = AMQPUri::default();
    uri.authority.host = params.host.clone();
    uri.authority.port = params.port;
    uri.authority.userinfo = AMQPUserInfo {
        username: params.username.clone(),
        password: params.password.clone(),
    };
    uri.vhost = if params.vhost.is_empty() {
        "/".to_string()
    } else {
        params.vhost.clone()
    };
    Ok(uri)
}

/// An open `lapin` connection and the channel used for consuming.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), WorkerError> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Queue '{}' declared ({} messages ready, {} consumers).",
            queue.name,
            declared.message_count(),
            declared.consumer_count()
        );
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), WorkerError> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        log::info!("QoS prefetch count set to {}", count);
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, WorkerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        log::info!("Consumer started with tag '{}'.", consumer.tag().as_str());

        let deliveries = consumer.map(|item| match item {
            Ok(delivery) => {
                let lapin::message::Delivery {
                    delivery_tag,
                    redelivered,
                    data,
                    acker,
                    ..
                } = delivery;
                Ok(Delivery {
                    message: Message {
                        payload: data,
                        delivery_tag,
                        redelivered,
                        received_at: Utc::now(),
                    },
                    acker: Box::new(AmqpAcker(acker)) as Box<dyn Acker>,
                })
            }
            Err(e) => Err(WorkerError::SessionLost(e.to_string())),
        });

        Ok(deliveries.boxed())
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "worker shutting down").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "worker shutting down").await?;
        }
        Ok(())
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), WorkerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
