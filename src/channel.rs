// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering AMQP Channel
//!
//! A [`Channel`] wraps one protocol channel of a recovering
//! [`Connection`](crate::connection::Connection). Every mutating call is
//! forwarded to the broker and, once the broker accepted it, written to the
//! channel's [`RecordedTopology`]. When the connection comes back after a
//! failure, the connection hands a fresh protocol channel to [`Channel::recover`],
//! which replays the ledger. The same happens when the broker closes only this
//! channel, e.g. after a failed passive declare or a precondition error.
//!
//! Calls issued while the connection is reconnecting wait for the recovery to
//! complete instead of failing.

use crate::{
    connection::ConnectionState,
    consumer::{spawn_delivery_loop, unique_consumer_tag, Consumer},
    errors::AmqpError,
    exchange::ExchangeKind,
    protocol::{DeclaredQueue, ProtocolChannel},
    recorded::{
        RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQos, RecordedQueue,
        RecordedTopology,
    },
};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::{select, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One logical AMQP channel whose topology survives reconnects.
///
/// Cloning is cheap; clones share the same underlying channel and ledger.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    raw: RwLock<Arc<dyn ProtocolChannel>>,
    topology: Mutex<RecordedTopology>,
    state: watch::Receiver<ConnectionState>,
    /// Fired once, on explicit close.
    closed: CancellationToken,
    closing: AtomicBool,
    /// Child of `closed`, replaced for every protocol channel this channel
    /// runs on. Cancelled as soon as that protocol channel is known dead.
    generation: Mutex<CancellationToken>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
}

/// Outcome of a topology replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub failed: usize,
}

impl Channel {
    pub(crate) fn new(
        raw: Arc<dyn ProtocolChannel>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        let closed = CancellationToken::new();
        let generation = closed.child_token();

        Channel {
            inner: Arc::new(ChannelInner {
                raw: RwLock::new(raw),
                topology: Mutex::new(RecordedTopology::default()),
                state,
                closed,
                closing: AtomicBool::new(false),
                generation: Mutex::new(generation),
                consumers: Mutex::new(HashMap::default()),
            }),
        }
    }

    /// Returns the live protocol channel, waiting out a reconnect in progress.
    async fn raw(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelClosed);
        }

        let mut state = self.inner.state.clone();
        let settled = select! {
            _ = self.inner.closed.cancelled() => return Err(AmqpError::ChannelClosed),
            settled = state.wait_for(|state| *state != ConnectionState::Reconnecting) => {
                settled.map(|state| *state)
            }
        };

        match settled {
            Ok(ConnectionState::Connected) => Ok(self.inner.raw.read().clone()),
            _ => Err(AmqpError::ConnectionClosed),
        }
    }

    /// Declares an exchange and records it unless the declaration is passive.
    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.raw().await?;

        if let Err(err) = raw
            .exchange_declare(name, kind.clone(), options, args.clone())
            .await
        {
            error!(error = err.to_string(), name, "error to declare the exchange");
            return Err(err);
        }

        if !options.passive {
            self.inner.topology.lock().record_exchange(
                name,
                RecordedExchange {
                    kind,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    args,
                },
            );
        }

        debug!(name, "exchange declared");
        Ok(())
    }

    /// Deletes an exchange. The record is dropped whatever the broker answers.
    pub async fn exchange_delete(
        &self,
        name: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.inner.topology.lock().delete_exchange(name);

        self.raw().await?.exchange_delete(name, options).await
    }

    /// Declares a queue and records it, under its effective name, unless the
    /// declaration is passive.
    pub async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<DeclaredQueue, AmqpError> {
        let raw = self.raw().await?;

        let queue = match raw.queue_declare(name, options, args.clone()).await {
            Ok(queue) => queue,
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                return Err(err);
            }
        };

        if !options.passive {
            self.inner.topology.lock().record_queue(
                queue.name(),
                RecordedQueue {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    args,
                },
            );
        }

        debug!(name = queue.name(), "queue declared");
        Ok(queue)
    }

    /// Deletes a queue. The record, and the bindings and consumers depending
    /// on it, are dropped whatever the broker answers.
    pub async fn queue_delete(
        &self,
        name: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        let cancelled: Vec<String> = {
            let mut topology = self.inner.topology.lock();
            let tags = topology
                .consumers()
                .iter()
                .filter(|consumer| consumer.queue == name)
                .map(|consumer| consumer.consumer_tag.clone())
                .collect();
            topology.delete_queue(name);
            tags
        };

        for tag in cancelled {
            self.stop_consumer(&tag);
        }

        self.raw().await?.queue_delete(name, options).await
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.raw().await?;

        if let Err(err) = raw
            .queue_bind(queue, exchange, routing_key, options, args.clone())
            .await
        {
            error!(
                error = err.to_string(),
                queue, exchange, routing_key, "error to bind queue to exchange"
            );
            return Err(err);
        }

        self.inner.topology.lock().record_binding(RecordedBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            args,
        });

        debug!(queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    /// Removes a binding. The record is dropped whatever the broker answers.
    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.topology.lock().delete_binding(&RecordedBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            args: args.clone(),
        });

        self.raw()
            .await?
            .queue_unbind(queue, exchange, routing_key, args)
            .await
    }

    pub async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        let raw = self.raw().await?;

        if let Err(err) = raw.basic_qos(prefetch_count, options).await {
            error!(error = err.to_string(), prefetch_count, "error to configure qos");
            return Err(err);
        }

        self.inner.topology.lock().record_qos(RecordedQos {
            prefetch_count,
            global: options.global,
        });

        Ok(())
    }

    /// Starts a consumer and records it. An empty `consumer_tag` is replaced by
    /// a generated one; the effective tag is returned.
    ///
    /// Deliveries are handed to `handler` one at a time, on a dedicated task.
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
        handler: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        let consumer_tag = match consumer_tag {
            "" => unique_consumer_tag(),
            tag => tag.to_owned(),
        };

        let record = RecordedConsumer {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.clone(),
            auto_ack: options.no_ack,
            exclusive: options.exclusive,
            no_local: options.no_local,
            no_wait: options.nowait,
            args,
            handler,
        };

        let raw = self.raw().await?;
        let generation = self.inner.generation.lock().clone();

        if let Err(err) = self.start_consumer(&raw, &generation, &record).await {
            error!(
                error = err.to_string(),
                queue,
                consumer_tag = consumer_tag.as_str(),
                "error to create the consumer"
            );
            return Err(err);
        }

        self.inner.topology.lock().record_consumer(record);

        Ok(consumer_tag)
    }

    /// Cancels a consumer. The record is dropped and the local delivery loop
    /// stopped whatever the broker answers.
    pub async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.inner.topology.lock().delete_consumer(consumer_tag);
        self.stop_consumer(consumer_tag);

        self.raw().await?.basic_cancel(consumer_tag, options).await
    }

    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.raw()
            .await?
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
    }

    /// Closes the channel. Repeated calls are no-ops.
    ///
    /// Stops every delivery loop of this channel; in-flight handler calls are
    /// not waited for.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let raw = self.inner.raw.read().clone();
        let result = match raw.is_closed() {
            true => Ok(()),
            false => raw.close().await,
        };

        self.inner.closed.cancel();
        self.inner.consumers.lock().clear();

        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel is explicitly closed.
    pub(crate) async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Whether `raw` is still the protocol channel this channel runs on.
    pub(crate) fn runs_on(&self, raw: &Weak<dyn ProtocolChannel>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&*self.inner.raw.read()), raw.as_ptr())
    }

    /// Snapshot of what this channel will replay after a reconnect.
    pub fn recorded_topology(&self) -> RecordedTopology {
        self.inner.topology.lock().clone()
    }

    /// Stops the delivery loops bound to the current protocol channel.
    pub(crate) fn interrupt(&self) {
        self.inner.generation.lock().cancel();
    }

    /// Switches to `raw` and replays the recorded topology on it: QoS, then
    /// exchanges, queues, bindings and consumers. A failing record is logged
    /// and skipped.
    pub(crate) async fn recover(&self, raw: Arc<dyn ProtocolChannel>) -> RecoveryReport {
        let generation = {
            let mut generation = self.inner.generation.lock();
            generation.cancel();
            *generation = self.inner.closed.child_token();
            generation.clone()
        };
        *self.inner.raw.write() = raw.clone();
        self.inner.consumers.lock().clear();

        let topology = self.recorded_topology();
        let mut report = RecoveryReport::default();

        if let Some(qos) = topology.qos() {
            let result = raw
                .basic_qos(
                    qos.prefetch_count,
                    BasicQosOptions {
                        global: qos.global,
                    },
                )
                .await;
            report.tally(result.map_err(|err| {
                error!(error = err.to_string(), "failed to set qos");
            }));
        }

        for (name, exchange) in topology.exchanges() {
            let result = raw
                .exchange_declare(
                    name,
                    exchange.kind.clone(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exchange.durable,
                        auto_delete: exchange.auto_delete,
                        internal: exchange.internal,
                        nowait: false,
                    },
                    exchange.args.clone(),
                )
                .await;
            report.tally(result.map_err(|err| {
                error!(error = err.to_string(), name = name.as_str(), "failed to declare exchange");
            }));
        }

        for (name, queue) in topology.queues() {
            let result = raw
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: queue.durable,
                        exclusive: queue.exclusive,
                        auto_delete: queue.auto_delete,
                        nowait: false,
                    },
                    queue.args.clone(),
                )
                .await;
            report.tally(result.map(|_| ()).map_err(|err| {
                error!(error = err.to_string(), name = name.as_str(), "failed to declare queue");
            }));
        }

        for binding in topology.bindings() {
            let result = raw
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    binding.args.clone(),
                )
                .await;
            report.tally(result.map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = binding.queue.as_str(),
                    exchange = binding.exchange.as_str(),
                    routing_key = binding.routing_key.as_str(),
                    "failed to bind queue"
                );
            }));
        }

        for consumer in topology.consumers() {
            let result = self.start_consumer(&raw, &generation, consumer).await;
            report.tally(result.map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = consumer.queue.as_str(),
                    consumer_tag = consumer.consumer_tag.as_str(),
                    "failed to consume"
                );
            }));
        }

        info!(
            replayed = report.replayed,
            failed = report.failed,
            "channel topology recovered"
        );

        report
    }

    async fn start_consumer(
        &self,
        raw: &Arc<dyn ProtocolChannel>,
        generation: &CancellationToken,
        record: &RecordedConsumer,
    ) -> Result<(), AmqpError> {
        let deliveries = raw
            .basic_consume(
                &record.queue,
                &record.consumer_tag,
                BasicConsumeOptions {
                    no_local: record.no_local,
                    no_ack: record.auto_ack,
                    exclusive: record.exclusive,
                    nowait: false,
                },
                record.args.clone(),
            )
            .await?;

        let shutdown = generation.child_token();
        if let Some(previous) = self
            .inner
            .consumers
            .lock()
            .insert(record.consumer_tag.clone(), shutdown.clone())
        {
            previous.cancel();
        }

        spawn_delivery_loop(
            record.consumer_tag.clone(),
            deliveries,
            record.handler.clone(),
            shutdown,
        );

        Ok(())
    }

    fn stop_consumer(&self, consumer_tag: &str) {
        if let Some(shutdown) = self.inner.consumers.lock().remove(consumer_tag) {
            shutdown.cancel();
        }
    }
}

impl RecoveryReport {
    fn tally(&mut self, result: Result<(), ()>) {
        match result {
            Ok(()) => self.replayed += 1,
            Err(()) => self.failed += 1,
        }
    }
}
