// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Protocol Abstraction
//!
//! The recovering [`Connection`](crate::connection::Connection) and
//! [`Channel`](crate::channel::Channel) never talk to the AMQP client library
//! directly. They go through the traits of this module, which expose exactly
//! what the recovery layer needs: dialing, channel creation, the declare/bind
//! /consume/publish family, and a close notification. The production
//! implementation lives in [`driver`](crate::driver) and is backed by `lapin`.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;

/// Stream of deliveries produced by a broker-side consumer.
///
/// The stream ends when the consumer is cancelled or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Establishes protocol connections to a broker URL.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn ProtocolConnection>, AmqpError>;
}

/// A live protocol connection.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    /// Opens a new protocol channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError>;

    /// Returns a receiver that yields once the connection is closed by the
    /// broker or lost. Meant to be called once per connection.
    fn notify_close(&self) -> UnboundedReceiver<AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_closed(&self) -> bool;
}

/// A live protocol channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProtocolChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn exchange_delete(
        &self,
        name: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<DeclaredQueue, AmqpError>;

    async fn queue_delete(&self, name: &str, options: QueueDeleteOptions)
        -> Result<u32, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError>;

    /// Returns a receiver that yields when the broker closes this channel
    /// while its connection stays up. Meant to be called once per channel.
    fn notify_close(&self) -> UnboundedReceiver<AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_closed(&self) -> bool;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, options: BasicAckOptions) -> Result<(), AmqpError>;

    async fn nack(&self, options: BasicNackOptions) -> Result<(), AmqpError>;

    async fn reject(&self, options: BasicRejectOptions) -> Result<(), AmqpError>;
}

/// Result of a queue declaration, carrying the effective (possibly
/// server-generated) queue name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredQueue {
    name: String,
    message_count: u32,
    consumer_count: u32,
}

impl DeclaredQueue {
    pub fn new(name: &str, message_count: u32, consumer_count: u32) -> Self {
        Self {
            name: name.to_owned(),
            message_count,
            consumer_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }
}

/// A message delivered by the broker to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
            acker,
        }
    }

    /// Headers table of the message, if any.
    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.acker.ack(BasicAckOptions { multiple }).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(BasicRejectOptions { requeue }).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &String::from_utf8_lossy(&self.data))
            .finish_non_exhaustive()
    }
}
