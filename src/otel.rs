// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! It includes utilities for propagating trace context through RabbitMQ message headers,
//! extracting context from incoming messages, and creating trace spans for message processing.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// This struct implements the OpenTelemetry `Injector` and `Extractor` traits,
/// allowing trace context to be propagated through RabbitMQ message headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Wraps a headers table.
    ///
    /// # Parameters
    /// * `headers` - The AMQP headers the trace context is written to or read from
    ///
    /// # Returns
    /// A propagator borrowing `headers` for its whole lifetime
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores one trace context entry as a long string header.
    ///
    /// Header keys are lower-cased, as W3C trace-context expects.
    ///
    /// # Parameters
    /// * `key` - The propagation field name, e.g. `traceparent`
    /// * `value` - The encoded field value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Reads one trace context entry.
    ///
    /// Only long string headers are considered; anything else, such as the
    /// numeric `x-delay`, is not a propagation field.
    ///
    /// # Parameters
    /// * `key` - The propagation field name
    ///
    /// # Returns
    /// The header value, or `None` for a missing header or one that is not a
    /// UTF-8 long string
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// # Returns
    /// Every header key of the message, propagation fields or not
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers` with the globally
/// installed propagator.
///
/// # Parameters
/// * `ctx` - The context of the operation publishing the message
/// * `headers` - The headers of the outgoing message
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Creates a consumer span for processing a message, child of the trace
/// context carried by the message headers.
///
/// # Parameters
/// * `props` - Properties of the delivered message
/// * `tracer` - The tracer starting the span
/// * `name` - Span name, the queue the message was consumed from
///
/// # Returns
/// The extracted parent context and the started span, which the caller ends
pub(crate) fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|headers| headers.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
