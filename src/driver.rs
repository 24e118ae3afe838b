// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Driver
//!
//! Implements the [`protocol`](crate::protocol) traits on top of `lapin`,
//! running on the current Tokio runtime.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    protocol::{
        Acker, DeclaredQueue, Delivery, DeliveryStream, Dialer, ProtocolChannel,
        ProtocolConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinDialer {
    connection_name: Option<String>,
}

impl LapinDialer {
    pub fn new(connection_name: Option<String>) -> Self {
        Self { connection_name }
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn ProtocolConnection>, AmqpError> {
        debug!("creating amqp connection...");

        let mut options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect(url, options).await {
            Ok(connection) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { connection }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl ProtocolConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError> {
        debug!("creating amqp channel...");

        match self.connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn notify_close(&self) -> UnboundedReceiver<AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        self.connection.on_error(move |err| {
            let _ = sender.send(AmqpError::ConnectionLost(err.to_string()));
        });

        receiver
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.connection.close(REPLY_SUCCESS, "OK").await {
            Ok(()) | Err(LapinError::InvalidConnectionState(_)) => Ok(()),
            Err(err) => Err(AmqpError::ConnectionError(err.to_string())),
        }
    }

    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl ProtocolChannel for LapinChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind.into(), options, args)
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(name.to_owned(), err.to_string()))
    }

    async fn exchange_delete(
        &self,
        name: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, options)
            .await
            .map_err(|err| AmqpError::DeleteExchangeError(name.to_owned(), err.to_string()))
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<DeclaredQueue, AmqpError> {
        let queue = self
            .channel
            .queue_declare(name, options, args)
            .await
            .map_err(|err| AmqpError::DeclareQueueError(name.to_owned(), err.to_string()))?;

        Ok(DeclaredQueue::new(
            queue.name().as_str(),
            queue.message_count(),
            queue.consumer_count(),
        ))
    }

    async fn queue_delete(
        &self,
        name: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, options)
            .await
            .map_err(|err| AmqpError::DeleteQueueError(name.to_owned(), err.to_string()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, args)
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                    err.to_string(),
                )
            })
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, args)
            .await
            .map_err(|err| {
                AmqpError::UnbindingExchangeFromQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                    err.to_string(),
                )
            })
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, options)
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, args)
            .await
            .map_err(|err| {
                AmqpError::BindingConsumerError(
                    queue.to_owned(),
                    consumer_tag.to_owned(),
                    err.to_string(),
                )
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.redelivered,
                    delivery.properties,
                    delivery.data,
                    Box::new(LapinAcker {
                        acker: delivery.acker,
                    }),
                )),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        Ok(())
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, options)
            .await
            .map_err(|err| AmqpError::CancelConsumerError(consumer_tag.to_owned(), err.to_string()))
    }

    fn notify_close(&self) -> UnboundedReceiver<AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        self.channel.on_error(move |err| {
            let _ = sender.send(AmqpError::ChannelError(err.to_string()));
        });

        receiver
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.channel.close(REPLY_SUCCESS, "OK").await {
            Ok(())
            | Err(LapinError::InvalidChannelState(_))
            | Err(LapinError::InvalidConnectionState(_)) => Ok(()),
            Err(err) => Err(AmqpError::ChannelError(err.to_string())),
        }
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.acker
            .ack(options)
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, options: BasicNackOptions) -> Result<(), AmqpError> {
        self.acker
            .nack(options)
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn reject(&self, options: BasicRejectOptions) -> Result<(), AmqpError> {
        self.acker
            .reject(options)
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}
