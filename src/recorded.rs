// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recorded Topology
//!
//! In-memory ledger of everything a [`Channel`](crate::channel::Channel) has
//! successfully declared on the broker: exchanges, queues, bindings, consumers
//! and the QoS setting. After a reconnect the ledger is replayed in the order
//! QoS, exchanges, queues, bindings, consumers, so that bindings and consumers
//! always find the entities they depend on.
//!
//! Entries keep their first insertion position; re-recording an existing key
//! updates it in place.

use crate::{consumer::Consumer, exchange::ExchangeKind};
use lapin::types::FieldTable;
use std::{fmt, sync::Arc};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExchange {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub args: FieldTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQueue {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub args: FieldTable,
}

/// A binding is identified by all of its fields, arguments included.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub args: FieldTable,
}

#[derive(Clone)]
pub struct RecordedConsumer {
    pub queue: String,
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub args: FieldTable,
    pub handler: Arc<dyn Consumer>,
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("auto_ack", &self.auto_ack)
            .field("exclusive", &self.exclusive)
            .field("no_local", &self.no_local)
            .field("no_wait", &self.no_wait)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordedQos {
    pub prefetch_count: u16,
    pub global: bool,
}

/// The per-channel ledger.
#[derive(Debug, Default, Clone)]
pub struct RecordedTopology {
    exchanges: Vec<(String, RecordedExchange)>,
    queues: Vec<(String, RecordedQueue)>,
    bindings: Vec<RecordedBinding>,
    consumers: Vec<RecordedConsumer>,
    qos: Option<RecordedQos>,
}

impl RecordedTopology {
    pub fn record_exchange(&mut self, name: &str, exchange: RecordedExchange) {
        upsert(&mut self.exchanges, name, exchange);
    }

    /// Forgets the exchange and every binding that routes from it.
    pub fn delete_exchange(&mut self, name: &str) {
        self.exchanges.retain(|(recorded, _)| recorded != name);
        self.bindings.retain(|binding| binding.exchange != name);
    }

    pub fn record_queue(&mut self, name: &str, queue: RecordedQueue) {
        upsert(&mut self.queues, name, queue);
    }

    /// Forgets the queue together with its bindings and consumers.
    pub fn delete_queue(&mut self, name: &str) {
        self.queues.retain(|(recorded, _)| recorded != name);
        self.bindings.retain(|binding| binding.queue != name);
        self.consumers.retain(|consumer| consumer.queue != name);
    }

    pub fn record_binding(&mut self, binding: RecordedBinding) {
        match self.bindings.iter_mut().find(|recorded| **recorded == binding) {
            Some(recorded) => *recorded = binding,
            None => self.bindings.push(binding),
        }
    }

    pub fn delete_binding(&mut self, binding: &RecordedBinding) {
        self.bindings.retain(|recorded| recorded != binding);
    }

    pub fn record_consumer(&mut self, consumer: RecordedConsumer) {
        match self
            .consumers
            .iter_mut()
            .find(|recorded| recorded.consumer_tag == consumer.consumer_tag)
        {
            Some(recorded) => *recorded = consumer,
            None => self.consumers.push(consumer),
        }
    }

    pub fn delete_consumer(&mut self, consumer_tag: &str) {
        self.consumers
            .retain(|recorded| recorded.consumer_tag != consumer_tag);
    }

    pub fn record_qos(&mut self, qos: RecordedQos) {
        self.qos = Some(qos);
    }

    pub fn exchanges(&self) -> &[(String, RecordedExchange)] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[(String, RecordedQueue)] {
        &self.queues
    }

    pub fn bindings(&self) -> &[RecordedBinding] {
        &self.bindings
    }

    pub fn consumers(&self) -> &[RecordedConsumer] {
        &self.consumers
    }

    pub fn consumer(&self, consumer_tag: &str) -> Option<&RecordedConsumer> {
        self.consumers
            .iter()
            .find(|recorded| recorded.consumer_tag == consumer_tag)
    }

    pub fn qos(&self) -> Option<RecordedQos> {
        self.qos
    }

    /// Total number of replayable records, QoS excluded.
    pub fn len(&self) -> usize {
        self.exchanges.len() + self.queues.len() + self.bindings.len() + self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.qos.is_none()
    }
}

fn upsert<T>(entries: &mut Vec<(String, T)>, name: &str, value: T) {
    match entries.iter_mut().find(|(recorded, _)| recorded == name) {
        Some((_, recorded)) => *recorded = value,
        None => entries.push((name.to_owned(), value)),
    }
}
