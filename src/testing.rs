// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Test doubles: an in-memory broker implementing the protocol traits, and
//! small helpers shared by the unit tests of the crate.

use crate::{
    consumer::Consumer,
    errors::AmqpError,
    exchange::ExchangeKind,
    protocol::{
        Acker, DeclaredQueue, Delivery, DeliveryStream, Dialer, ProtocolChannel,
        ProtocolConnection,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const PATIENCE: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PATIENCE;

    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met in {PATIENCE:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self, _options: BasicAckOptions) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _options: BasicNackOptions) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn reject(&self, _options: BasicRejectOptions) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// A delivery of `body` that nobody settles.
pub fn delivery(body: &[u8]) -> Delivery {
    Delivery::new(
        1,
        "",
        "",
        false,
        BasicProperties::default(),
        body.to_vec(),
        Box::new(NoopAcker),
    )
}

/// Consumer remembering the bodies it was handed.
#[derive(Default)]
pub struct Recorder {
    bodies: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) {
        eventually(|| self.bodies.lock().len() >= count).await
    }
}

#[async_trait]
impl Consumer for Recorder {
    async fn handle_delivery(&self, delivery: Delivery) {
        self.bodies
            .lock()
            .push(String::from_utf8_lossy(&delivery.data).into_owned());
    }
}

/// Broker-visible operations, in the order the broker received them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Dial,
    CreateChannel,
    ExchangeDeclare(String),
    ExchangeDelete(String),
    QueueDeclare(String),
    QueueDelete(String),
    QueueBind(String, String, String),
    QueueUnbind(String, String, String),
    Qos(u16),
    Consume(String, String),
    Publish(String, String),
    Cancel(String),
    CloseChannel,
    CloseConnection,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

/// In-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    calls: Vec<Call>,
    dials: usize,
    failing_dials: usize,
    failing_exchanges: HashSet<String>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, FakeQueue>,
    bindings: Vec<(String, String, String)>,
    published: Vec<Published>,
    acked: usize,
    rejected: usize,
    next_id: u64,
    links: Vec<Arc<Link>>,
    channels: Vec<Weak<ChannelSide>>,
}

#[derive(Default)]
struct FakeQueue {
    pending: VecDeque<Published>,
    consumers: Vec<FakeConsumer>,
    next: usize,
}

struct FakeConsumer {
    tag: String,
    channel: u64,
    sender: UnboundedSender<Result<Delivery, AmqpError>>,
}

/// Broker side of one connection.
struct Link {
    closed: AtomicBool,
    notify: Mutex<Option<UnboundedSender<AmqpError>>>,
}

/// Broker side of one channel.
struct ChannelSide {
    id: u64,
    link: Arc<Link>,
    closed: AtomicBool,
    notify: Mutex<Option<UnboundedSender<AmqpError>>>,
}

impl ChannelSide {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.link.closed.load(Ordering::SeqCst)
    }
}

impl FakeBroker {
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(self.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.state.lock().failing_dials = count;
    }

    pub fn fail_exchange(&self, name: &str) {
        self.state.lock().failing_exchanges.insert(name.to_owned());
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn acked(&self) -> usize {
        self.state.lock().acked
    }

    pub fn rejected(&self) -> usize {
        self.state.lock().rejected
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| {
                queue
                    .consumers
                    .iter()
                    .filter(|consumer| !consumer.sender.is_closed())
                    .count()
            })
            .unwrap_or_default()
    }

    /// Drops every live connection as a network failure would: consumers are
    /// gone and close notifications fire. Declared entities survive.
    pub fn sever(&self) {
        let links = {
            let mut state = self.state.lock();
            for queue in state.queues.values_mut() {
                queue.consumers.clear();
            }
            std::mem::take(&mut state.links)
        };

        for link in links {
            link.closed.store(true, Ordering::SeqCst);
            if let Some(notify) = link.notify.lock().take() {
                let _ = notify.send(AmqpError::ConnectionLost(
                    "CONNECTION_FORCED - broker forced connection closure".to_owned(),
                ));
            }
        }
    }

    /// Closes every open channel from the broker side, as a channel-level
    /// exception would. Connections stay up.
    pub fn close_channels(&self) {
        let sides: Vec<Arc<ChannelSide>> = {
            let mut state = self.state.lock();
            state.channels.retain(|side| side.strong_count() > 0);
            let sides: Vec<_> = state
                .channels
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|side| !side.is_closed())
                .collect();

            for queue in state.queues.values_mut() {
                queue
                    .consumers
                    .retain(|consumer| sides.iter().all(|side| side.id != consumer.channel));
            }
            sides
        };

        for side in sides {
            side.closed.store(true, Ordering::SeqCst);
            if let Some(notify) = side.notify.lock().take() {
                let _ = notify.send(AmqpError::ChannelError(
                    "PRECONDITION_FAILED - unknown delivery tag 42".to_owned(),
                ));
            }
        }
    }

    /// Publishes from outside of any connection.
    pub fn inject(&self, exchange: &str, routing_key: &str, data: &[u8]) {
        let message = Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            properties: BasicProperties::default(),
        };
        let mut state = self.state.lock();
        self.route(&mut state, message);
    }

    fn route(&self, state: &mut BrokerState, message: Published) {
        let targets: Vec<String> = match message.exchange.as_str() {
            "" => vec![message.routing_key.clone()],
            exchange => {
                let fanout = state.exchanges.get(exchange) == Some(&ExchangeKind::Fanout);
                state
                    .bindings
                    .iter()
                    .filter(|(_, bound, key)| {
                        bound == exchange && (fanout || *key == message.routing_key)
                    })
                    .map(|(queue, _, _)| queue.clone())
                    .collect()
            }
        };

        for target in targets {
            state.next_id += 1;
            let delivery_tag = state.next_id;
            if let Some(queue) = state.queues.get_mut(&target) {
                self.enqueue(queue, delivery_tag, message.clone());
            }
        }
    }

    fn enqueue(&self, queue: &mut FakeQueue, delivery_tag: u64, message: Published) {
        queue.consumers.retain(|consumer| !consumer.sender.is_closed());

        if queue.consumers.is_empty() {
            queue.pending.push_back(message);
            return;
        }

        let index = queue.next % queue.consumers.len();
        queue.next += 1;
        let _ = queue.consumers[index]
            .sender
            .send(Ok(self.delivery(delivery_tag, message)));
    }

    fn delivery(&self, delivery_tag: u64, message: Published) -> Delivery {
        Delivery::new(
            delivery_tag,
            &message.exchange,
            &message.routing_key,
            false,
            message.properties,
            message.data,
            Box::new(FakeAcker {
                state: self.state.clone(),
            }),
        )
    }
}

#[async_trait]
impl Dialer for FakeBroker {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn ProtocolConnection>, AmqpError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Dial);
        state.dials += 1;

        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let link = Arc::new(Link {
            closed: AtomicBool::new(false),
            notify: Mutex::new(None),
        });
        state.links.push(link.clone());

        Ok(Arc::new(FakeConnection {
            broker: self.clone(),
            link,
        }))
    }
}

struct FakeConnection {
    broker: FakeBroker,
    link: Arc<Link>,
}

#[async_trait]
impl ProtocolConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let mut state = self.broker.state.lock();
        state.calls.push(Call::CreateChannel);
        state.next_id += 1;

        let side = Arc::new(ChannelSide {
            id: state.next_id,
            link: self.link.clone(),
            closed: AtomicBool::new(false),
            notify: Mutex::new(None),
        });
        state.channels.push(Arc::downgrade(&side));

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            side,
        }))
    }

    fn notify_close(&self) -> UnboundedReceiver<AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.link.notify.lock() = Some(sender);
        receiver
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().calls.push(Call::CloseConnection);
        self.link.closed.store(true, Ordering::SeqCst);
        self.link.notify.lock().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

struct FakeChannel {
    broker: FakeBroker,
    side: Arc<ChannelSide>,
}

impl FakeChannel {
    fn check(&self) -> Result<(), AmqpError> {
        match self.is_closed() {
            true => Err(AmqpError::ChannelClosed),
            false => Ok(()),
        }
    }
}

fn not_found(what: &str, name: &str) -> String {
    format!("NOT_FOUND - no {what} '{name}'")
}

#[async_trait]
impl ProtocolChannel for FakeChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::ExchangeDeclare(name.to_owned()));

        if state.failing_exchanges.contains(name) {
            return Err(AmqpError::DeclareExchangeError(
                name.to_owned(),
                "PRECONDITION_FAILED - inequivalent arg 'type'".to_owned(),
            ));
        }

        if options.passive {
            return match state.exchanges.contains_key(name) {
                true => Ok(()),
                false => Err(AmqpError::DeclareExchangeError(
                    name.to_owned(),
                    not_found("exchange", name),
                )),
            };
        }

        state.exchanges.insert(name.to_owned(), kind);
        Ok(())
    }

    async fn exchange_delete(
        &self,
        name: &str,
        _options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::ExchangeDelete(name.to_owned()));
        state.exchanges.remove(name);
        state.bindings.retain(|(_, exchange, _)| exchange != name);
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        _args: FieldTable,
    ) -> Result<DeclaredQueue, AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::QueueDeclare(name.to_owned()));

        let name = match name {
            "" => {
                state.next_id += 1;
                format!("amq.gen-{}", state.next_id)
            }
            name => name.to_owned(),
        };

        if options.passive && !state.queues.contains_key(&name) {
            return Err(AmqpError::DeclareQueueError(
                name.clone(),
                not_found("queue", &name),
            ));
        }

        let queue = state.queues.entry(name.clone()).or_default();
        Ok(DeclaredQueue::new(
            &name,
            queue.pending.len() as u32,
            queue.consumers.len() as u32,
        ))
    }

    async fn queue_delete(
        &self,
        name: &str,
        _options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::QueueDelete(name.to_owned()));
        state.bindings.retain(|(queue, _, _)| queue != name);
        Ok(state
            .queues
            .remove(name)
            .map(|queue| queue.pending.len() as u32)
            .unwrap_or_default())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::QueueBind(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
                not_found("queue", queue),
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
                not_found("exchange", exchange),
            ));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::QueueUnbind(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        state
            .bindings
            .retain(|binding| *binding != (queue.to_owned(), exchange.to_owned(), routing_key.to_owned()));
        Ok(())
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        _options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.check()?;
        self.broker
            .state
            .lock()
            .calls
            .push(Call::Qos(prefetch_count));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
        _args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state
            .calls
            .push(Call::Consume(queue.to_owned(), consumer_tag.to_owned()));

        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = match state.queues.get_mut(queue) {
            Some(target) => {
                target.consumers.push(FakeConsumer {
                    tag: consumer_tag.to_owned(),
                    channel: self.side.id,
                    sender,
                });
                std::mem::take(&mut target.pending)
            }
            None => {
                return Err(AmqpError::BindingConsumerError(
                    queue.to_owned(),
                    consumer_tag.to_owned(),
                    not_found("queue", queue),
                ))
            }
        };

        for message in pending {
            state.next_id += 1;
            let delivery_tag = state.next_id;
            if let Some(target) = state.queues.get_mut(queue) {
                self.broker.enqueue(target, delivery_tag, message);
            }
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state
            .calls
            .push(Call::Publish(exchange.to_owned(), routing_key.to_owned()));

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(not_found("exchange", exchange)));
        }

        let message = Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: payload.to_vec(),
            properties,
        };
        state.published.push(message.clone());
        self.broker.route(&mut state, message);
        Ok(())
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        _options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.check()?;
        let mut state = self.broker.state.lock();
        state.calls.push(Call::Cancel(consumer_tag.to_owned()));
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
        }
        Ok(())
    }

    fn notify_close(&self) -> UnboundedReceiver<AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.side.notify.lock() = Some(sender);
        receiver
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.side.closed.store(true, Ordering::SeqCst);
        self.side.notify.lock().take();
        let mut state = self.broker.state.lock();
        state.calls.push(Call::CloseChannel);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel != self.side.id);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.side.is_closed()
    }
}

struct FakeAcker {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Acker for FakeAcker {
    async fn ack(&self, _options: BasicAckOptions) -> Result<(), AmqpError> {
        self.state.lock().acked += 1;
        Ok(())
    }

    async fn nack(&self, _options: BasicNackOptions) -> Result<(), AmqpError> {
        self.state.lock().rejected += 1;
        Ok(())
    }

    async fn reject(&self, _options: BasicRejectOptions) -> Result<(), AmqpError> {
        self.state.lock().rejected += 1;
        Ok(())
    }
}
