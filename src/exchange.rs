// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchanges
//!
//! Exchange kinds, `x-delayed-message` included, and the [`ExchangeDefinition`]
//! builder consumed by [`AmqpTopology`](crate::topology::AmqpTopology).

use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::{collections::BTreeMap, fmt};

/// Argument naming how a delayed exchange routes once the delay elapsed
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Exchange type provided by the delayed message exchange plugin
pub const X_DELAYED_MESSAGE: &str = "x-delayed-message";

/// Exchange type. `Custom` carries any type name the broker knows beyond the
/// built-in ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XDelayedMessage,
    Custom(String),
}

impl ExchangeKind {
    /// Returns the exchange type as it is named on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XDelayedMessage => X_DELAYED_MESSAGE,
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            X_DELAYED_MESSAGE => ExchangeKind::XDelayedMessage,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XDelayedMessage => {
                lapin::ExchangeKind::Custom(X_DELAYED_MESSAGE.to_owned())
            }
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind),
        }
    }
}

/// Declaration parameters of one exchange. Starts as a transient `direct`
/// exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            auto_delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            args: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// `x-delayed-message` exchange routing like `direct` once the
    /// `x-delay` of a message elapsed. Needs the delayed message plugin.
    pub fn direct_delayed(self) -> Self {
        self.delayed(ExchangeKind::Direct)
    }

    /// Same as [`direct_delayed`](Self::direct_delayed), routing like `fanout`.
    pub fn fanout_delayed(self) -> Self {
        self.delayed(ExchangeKind::Fanout)
    }

    fn delayed(self, routing: ExchangeKind) -> Self {
        let routing = LongString::from(routing.as_str());

        self.kind(ExchangeKind::XDelayedMessage).arg(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(routing),
        )
    }

    pub fn args(mut self, args: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.args.insert(key, value);
        self
    }

    /// Removed by the broker once its last binding goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks that the exchange exists. Passive declarations are never
    /// replayed after a reconnect.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.args.clone())
    }
}
