// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A brokerless implementation of the broker traits that keeps exchanges,
//! queues and bindings in memory and applies the same routing rules a
//! RabbitMQ server does:
//!
//! - default exchange routing by queue name
//! - direct, topic, fanout and headers exchanges
//! - server named, exclusive and auto-delete queues
//! - per consumer prefetch windows with ack / nack
//! - unacknowledged deliveries return to their queue when a channel closes
//!
//! Message TTLs are accepted but not enforced. Useful for tests and for
//! running services without a broker.

use crate::{
    broker::{AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryReceiver},
    envelope::Envelope,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    routing::{headers_match, topic_matches},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type ConsumerKey = (u64, String);

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    envelope: Envelope,
}

impl Message {
    fn delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            envelope: self.envelope.clone(),
        }
    }
}

struct QueueState {
    def: QueueDefinition,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerKey>,
    cursor: usize,
}

struct ConsumerState {
    queue: String,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    queue: String,
    consumer: ConsumerKey,
    message: Message,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, ChannelState>,
    connections: HashSet<u64>,
    connections_opened: usize,
    next_id: u64,
    next_tag: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_connection(&self, channel: u64) -> Result<u64, AmqpError> {
        self.channels
            .get(&channel)
            .map(|state| state.connection)
            .ok_or_else(|| AmqpError::ChannelError(format!("channel {channel} is closed")))
    }

    fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.kind == ExchangeKind::None {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        match self.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind => Err(AmqpError::DeclareExchangeError(
                format!("inequivalent type for exchange `{}`", def.name),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, channel: u64, def: &QueueDefinition) -> Result<String, AmqpError> {
        let connection = self.channel_connection(channel)?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        if let Some(queue) = self.queues.get(&name) {
            return match queue.owner {
                Some(owner) if owner != connection => Err(AmqpError::DeclareQueueError(format!(
                    "queue `{name}` is exclusive to another connection"
                ))),
                _ => Ok(name),
            };
        }

        let mut def = def.clone();
        def.name = name.clone();

        self.queues.insert(
            name.clone(),
            QueueState {
                owner: def.exclusive.then_some(connection),
                def,
                ready: VecDeque::new(),
                consumers: vec![],
                cursor: 0,
            },
        );

        Ok(name)
    }

    fn bind_queue(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        if !self.queues.contains_key(&binding.queue_name)
            || !self.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !self.bindings.contains(binding) {
            self.bindings.push(binding.clone());
        }

        Ok(())
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(format!("no exchange `{exchange}`")));
        };

        let mut targets = self
            .bindings
            .iter()
            .filter(|binding| binding.exchange_name == exchange)
            .filter(|binding| match def.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => headers_match(&binding.arguments, &envelope.headers),
                ExchangeKind::None => false,
            })
            .map(|binding| binding.queue_name.clone())
            .collect::<Vec<_>>();

        targets.sort();
        targets.dedup();

        Ok(targets)
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let targets = self.route(exchange, routing_key, envelope)?;

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        for queue_name in targets {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_back(Message {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    envelope: envelope.clone(),
                });
            }
            self.dispatch(&queue_name);
        }

        Ok(())
    }

    fn consume(
        &mut self,
        channel: u64,
        queue_name: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryReceiver, AmqpError> {
        let connection = self.channel_connection(channel)?;
        let prefetch = self
            .channels
            .get(&channel)
            .map(|state| state.prefetch)
            .unwrap_or_default();

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };
        let key = (channel, tag);

        if self.consumers.contains_key(&key) {
            return Err(AmqpError::ConsumerDeclarationError(format!(
                "consumer tag `{}` already in use",
                key.1
            )));
        }

        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(AmqpError::ConsumerDeclarationError(format!(
                "no queue `{queue_name}`"
            )));
        };

        if queue.owner.is_some_and(|owner| owner != connection) {
            return Err(AmqpError::ConsumerDeclarationError(format!(
                "queue `{queue_name}` is exclusive to another connection"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(key.clone());
        self.consumers.insert(
            key,
            ConsumerState {
                queue: queue_name.to_owned(),
                auto_ack,
                prefetch,
                in_flight: 0,
                tx,
            },
        );

        self.dispatch(queue_name);

        Ok(rx)
    }

    fn next_consumer(&mut self, queue_name: &str) -> Option<ConsumerKey> {
        let queue = self.queues.get_mut(queue_name)?;
        if queue.ready.is_empty() {
            return None;
        }

        let count = queue.consumers.len();
        for offset in 0..count {
            let idx = (queue.cursor + offset) % count;
            let key = &queue.consumers[idx];

            if self
                .consumers
                .get(key)
                .is_some_and(ConsumerState::has_capacity)
            {
                queue.cursor = (idx + 1) % count;
                return Some(key.clone());
            }
        }

        None
    }

    /// Hands ready messages to consumers with free prefetch slots, round robin.
    fn dispatch(&mut self, queue_name: &str) {
        while let Some(key) = self.next_consumer(queue_name) {
            let Some(message) = self
                .queues
                .get_mut(queue_name)
                .and_then(|queue| queue.ready.pop_front())
            else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;

            let sent = self
                .consumers
                .get(&key)
                .is_some_and(|consumer| consumer.tx.send(message.delivery(tag)).is_ok());

            if !sent {
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.ready.push_front(message);
                }
                self.remove_consumer(&key);
                continue;
            }

            if let Some(consumer) = self.consumers.get_mut(&key) {
                if !consumer.auto_ack {
                    consumer.in_flight += 1;
                    self.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.to_owned(),
                            consumer: key,
                            message,
                        },
                    );
                }
            }
        }
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64) -> Option<Unacked> {
        if !self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|entry| entry.consumer.0 == channel)
        {
            return None;
        }

        let entry = self.unacked.remove(&delivery_tag)?;
        if let Some(consumer) = self.consumers.get_mut(&entry.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        Some(entry)
    }

    fn ack(&mut self, channel: u64, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel_connection(channel)?;

        let Some(entry) = self.settle(channel, delivery_tag) else {
            return Err(AmqpError::AckMessageError(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        self.dispatch(&entry.queue);
        Ok(())
    }

    fn nack(&mut self, channel: u64, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel_connection(channel)?;

        let Some(entry) = self.settle(channel, delivery_tag) else {
            return Err(AmqpError::NackMessageError(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        if requeue {
            self.requeue(entry);
        } else {
            debug!(queue = %entry.queue, "message rejected, dropped");
            self.dispatch(&entry.queue);
        }

        Ok(())
    }

    fn requeue(&mut self, entry: Unacked) {
        let Unacked {
            queue: queue_name,
            mut message,
            ..
        } = entry;

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        self.dispatch(&queue_name);
    }

    fn remove_consumer(&mut self, key: &ConsumerKey) {
        let Some(consumer) = self.consumers.remove(key) else {
            return;
        };

        let Some(queue) = self.queues.get_mut(&consumer.queue) else {
            return;
        };

        queue.consumers.retain(|existing| existing != key);
        if queue.cursor >= queue.consumers.len() {
            queue.cursor = 0;
        }

        if queue.def.delete && queue.consumers.is_empty() {
            debug!(queue = %consumer.queue, "auto-delete queue lost its last consumer");
            self.remove_queue(&consumer.queue);
        }
    }

    fn remove_queue(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.remove(queue_name) else {
            return;
        };

        self.bindings
            .retain(|binding| binding.queue_name != queue_name);
        for key in queue.consumers {
            self.consumers.remove(&key);
        }
        self.unacked.retain(|_, entry| entry.queue != queue_name);
    }

    fn cancel(&mut self, channel: u64, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel_connection(channel)?;

        let key = (channel, consumer_tag.to_owned());
        if !self.consumers.contains_key(&key) {
            return Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()));
        }

        self.remove_consumer(&key);
        Ok(())
    }

    fn close_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let mut tags = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.consumer.0 == channel)
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                let Unacked {
                    queue: queue_name,
                    mut message,
                    ..
                } = entry;
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }

        let keys = self
            .consumers
            .keys()
            .filter(|key| key.0 == channel)
            .cloned()
            .collect::<Vec<_>>();
        for key in &keys {
            self.remove_consumer(key);
        }

        let queue_names = self.queues.keys().cloned().collect::<Vec<_>>();
        for queue_name in queue_names {
            self.dispatch(&queue_name);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }

        let channels = self
            .channels
            .iter()
            .filter(|(_, state)| state.connection == connection)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for queue_name in exclusive {
            self.remove_queue(&queue_name);
        }
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector dialing this broker.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Opens a connection directly, bypassing any connector.
    pub fn open_connection(&self) -> Arc<MemoryConnection> {
        let mut state = self.state();
        let id = state.next_id();
        state.connections.insert(id);
        state.connections_opened += 1;

        Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    /// Number of connections ever opened against this broker.
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Names of existing queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names = self.state().queues.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(exchange).map(|def| def.kind)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|queue| queue.ready.len())
    }

    /// Messages of `queue` delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .unacked
            .values()
            .filter(|entry| entry.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.len())
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let connection: Arc<dyn AmqpConnection> = self.broker.open_connection();
        Ok(connection)
    }
}

/// A connection to a `MemoryBroker`.
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryConnection {
    /// Opens a channel with its concrete type.
    pub fn open_channel(&self) -> Result<Arc<MemoryChannel>, AmqpError> {
        let mut state = self.broker.state();
        if !state.connections.contains(&self.id) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel: Arc<dyn AmqpChannel> = self.open_channel()?;
        Ok(channel)
    }

    fn is_connected(&self) -> bool {
        self.broker.state().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_connection(self.id);
        Ok(())
    }
}

/// A channel on a `MemoryBroker`.
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_connection(self.id)?;
        state.declare_exchange(def)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.broker.state().declare_queue(self.id, def)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_connection(self.id)?;
        state.bind_queue(binding)
    }

    async fn qos(&self, prefetch_count: u16, _global: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = prefetch_count;
                Ok(())
            }
            None => Err(AmqpError::QoSDeclarationError(format!(
                "channel {} is closed",
                self.id
            ))),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state
            .channel_connection(self.id)
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;
        state.publish(exchange, routing_key, envelope)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryReceiver, AmqpError> {
        self.broker
            .state()
            .consume(self.id, queue, consumer_tag, auto_ack)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.broker.state().ack(self.id, delivery_tag)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.broker.state().nack(self.id, delivery_tag, requeue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.broker.state().cancel(self.id, consumer_tag)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state
            .channel_connection(self.id)
            .map_err(|err| AmqpError::DeleteQueueError(err.to_string()))?;
        state.remove_queue(queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}
