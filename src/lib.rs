// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqpx
//!
//! A self-healing layer over AMQP 0-9-1. A [`Connection`](connection::Connection)
//! redials the broker when the link drops and hands out
//! [`Channel`](channel::Channel)s that record the topology declared through
//! them, replaying it after every reconnect. On top of that sits a
//! [`DelayQueue`](delay_queue::DelayQueue): a durable work queue with delayed
//! redelivery and bounded retries.

mod otel;

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delay_queue;
pub mod driver;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod recorded;
pub mod topology;

#[cfg(test)]
mod testing;
