// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ exchanges
//! through a recovering [`Channel`], supporting OpenTelemetry tracing for
//! distributed request tracking.

use crate::{channel::Channel, errors::AmqpError, otel};
use chrono::Utc;
use lapin::{
    options::BasicPublishOptions,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties,
};
use opentelemetry::Context;
use std::collections::{BTreeMap, HashMap};
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A typed AMQP header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// A message to publish, with its destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub headers: HashMap<String, HeaderValue>,
    pub persistent: bool,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, data: Vec<u8>) -> Self {
        Self {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data,
            ..Self::default()
        }
    }

    /// Defaults to `application/json`.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Asks the broker to store the message on disk.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Publishes messages on a recovering channel.
///
/// Publishing while the connection is reconnecting waits for the recovery.
#[derive(Clone)]
pub struct Publisher {
    channel: Channel,
}

impl Publisher {
    pub fn new(channel: &Channel) -> Self {
        Self {
            channel: channel.clone(),
        }
    }

    /// Publishes a message and waits for the broker confirmation.
    ///
    /// The trace context of `ctx` travels in the message headers; every
    /// message gets a fresh message id and the current timestamp.
    pub async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        otel::inject_context(ctx, &mut headers);

        for (key, value) in &msg.headers {
            headers.insert(ShortString::from(key.clone()), value.clone().into());
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(
                msg.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE),
            ))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .with_headers(FieldTable::from(headers));

        if let Some(msg_type) = &msg.msg_type {
            properties = properties.with_type(ShortString::from(msg_type.clone()));
        }

        if msg.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = msg.exchange,
                    routing_key = msg.routing_key,
                    "error publishing message"
                );
                Err(err)
            }
            _ => Ok(()),
        }
    }
}
