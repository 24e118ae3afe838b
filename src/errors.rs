// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient AMQP Layer
//!
//! This module provides the error type shared by every operation of the crate.
//! The `AmqpError` enum represents all failure scenarios that can occur while
//! dialing, creating channels, declaring topology, consuming, publishing and
//! handling delayed messages. Errors coming from the protocol library are
//! carried as their textual reason.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant identifies the failed operation and, where it applies, the
/// broker entity the operation targeted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection was explicitly closed or gave up recovering
    #[error("connection is closed")]
    ConnectionClosed,

    /// The broker (or the network) closed the connection
    #[error("connection was closed by the broker: {0}")]
    ConnectionLost(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was explicitly closed
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete an exchange `{0}`: {1}")]
    DeleteExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`: {1}")]
    DeleteQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error removing the binding between an exchange and a queue
    #[error("failure to unbind exchange `{0}` from queue `{1}`: {2}")]
    UnbindingExchangeFromQueueError(String, String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{1}` on queue `{0}`: {2}")]
    BindingConsumerError(String, String, String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`: {1}")]
    CancelConsumerError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error received from the delivery stream of a consumer
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),
}
