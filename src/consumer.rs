// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consumer side of a recovering channel: the
//! [`Consumer`] trait implemented by applications, process-unique consumer
//! tag generation, and the delivery loop that feeds one broker-side consumer
//! into its handler.

use crate::protocol::{Delivery, DeliveryStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Upper bound of an AMQP short string, which carries the consumer tag
const CONSUMER_TAG_LENGTH_MAX: usize = 0xFF;
const CONSUMER_TAG_PREFIX: &str = "ctag-";
const CONSUMER_TAG_FALLBACK_INFIX: &str = "amqpx";

static CONSUMER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Handles deliveries of one consumer.
///
/// Deliveries are handed over one at a time: the next delivery is pulled only
/// once `handle_delivery` returns. Acknowledging is the handler's job unless
/// the consumer was registered with `no_ack`.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn handle_delivery(&self, delivery: Delivery);
}

/// Generates a process-unique consumer tag: `ctag-<argv0>-<sequence>`.
pub fn unique_consumer_tag() -> String {
    let command = std::env::args().next().unwrap_or_default();

    command_name_based_unique_consumer_tag(&command)
}

fn command_name_based_unique_consumer_tag(command: &str) -> String {
    let suffix = format!("-{}", CONSUMER_SEQ.fetch_add(1, Ordering::Relaxed) + 1);

    let infix = if CONSUMER_TAG_PREFIX.len() + command.len() + suffix.len()
        > CONSUMER_TAG_LENGTH_MAX
    {
        CONSUMER_TAG_FALLBACK_INFIX
    } else {
        command
    };

    format!("{CONSUMER_TAG_PREFIX}{infix}{suffix}")
}

/// Spawns the task pulling deliveries of `consumer_tag` into `handler`.
///
/// The task stops when the delivery stream ends (consumer cancelled), or when
/// `shutdown` is cancelled (channel closed, connection lost, consumer
/// cancelled locally).
pub(crate) fn spawn_delivery_loop(
    consumer_tag: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn Consumer>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(consumer_tag, "begin consuming deliveries");

        loop {
            let next = select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(consumer_tag, "channel closed, stopping consumer");
                    return;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => handler.handle_delivery(delivery).await,
                Some(Err(err)) => {
                    error!(error = err.to_string(), consumer_tag, "errors consume msg")
                }
                None => {
                    warn!(consumer_tag, "delivery stream closed, consumer cancelled");
                    return;
                }
            }
        }
    })
}
