// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A small broker implementing the transport traits without a network, for tests and
//! local development. It models what the core relies on: exchanges (direct, fanout,
//! topic; headers exchanges behave like fanout), queues with dead-letter arguments,
//! bindings, prefetch-limited dispatch, ack/nack with requeue, `x-delivery-count` on
//! quorum queues, confirm mode, and connection loss with requeue of unacknowledged
//! deliveries.
//!
//! Fault injection hooks (`refuse_host`, `kill_connections`, `hold_confirms`,
//! `reject_publishes`, `delay_consume`) and an operation journal make failure scenarios reproducible.

use crate::{
    config::Credentials,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{
        HeaderValue, InboundDelivery, MessageProperties, OutboundMessage,
        AMQP_HEADERS_DELIVERY_COUNT,
    },
    queue::{QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
    transport::{
        BrokerChannel, BrokerConnection, ConfirmFuture, Confirmation, DeliveryStream, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

type ConfirmSender = oneshot::Sender<Result<Confirmation, AmqpError>>;
type DeliverySender = mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>;

/// Operations recorded by the broker, in the order it processed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { host: String },
    ConnectionsKilled,
    ExchangeDeclared { name: String },
    QueueDeclared { name: String },
    QueueBound { queue: String, exchange: String, routing_key: String },
    ConsumerRegistered { queue: String, consumer_tag: String },
    ConsumerCancelled { consumer_tag: String },
    Delivered { queue: String, delivery_tag: u64, message_id: Option<String> },
    Acked { delivery_tag: u64 },
    Nacked { delivery_tag: u64, requeue: bool },
    Published { exchange: String, routing_key: String, message_id: Option<String> },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    delivery_count: u32,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    tx: DeliverySender,
}

struct QueueState {
    def: QueueDefinition,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    confirm: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    held: Vec<ConfirmSender>,
}

struct ConnectionState {
    closed: watch::Sender<bool>,
    channels: HashSet<u64>,
}

#[derive(Default)]
struct BrokerState {
    refused: HashSet<String>,
    attempts: Vec<String>,
    next_id: u64,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    journal: Vec<BrokerEvent>,
    hold_confirms: bool,
    reject_publishes: bool,
    consume_delay: Option<Duration>,
    published: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState, AmqpError> {
        self.channels.get_mut(&id).ok_or(AmqpError::ChannelLost)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return match self.queues.contains_key(routing_key) {
                true => vec![routing_key.to_owned()],
                false => vec![],
            };
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return vec![];
        };

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match def.kind {
                ExchangeKind::Direct | ExchangeKind::XMessageDelayed => {
                    binding.routing_key == routing_key
                }
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.delivery_count += 1;
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_front(message);
        }
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (state.next_consumer + offset) % count;
                let slot = &state.consumers[index];
                let Some(channel) = self.channels.get(&slot.channel) else {
                    continue;
                };
                let in_flight = channel
                    .unacked
                    .values()
                    .filter(|u| u.consumer_tag == slot.tag)
                    .count();
                if channel.prefetch == 0 || in_flight < usize::from(channel.prefetch) {
                    chosen = Some((index, slot.tag.clone(), slot.channel, slot.tx.clone()));
                    break;
                }
            }

            let Some((index, tag, channel_id, tx)) = chosen else {
                return;
            };

            let quorum = state.def.quorum;
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            state.next_consumer = index + 1;
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;

            let mut properties = message.properties.clone();
            if quorum && message.delivery_count > 0 {
                properties.headers.insert(
                    AMQP_HEADERS_DELIVERY_COUNT.to_owned(),
                    HeaderValue::LongLongInt(i64::from(message.delivery_count)),
                );
            }

            let delivery = InboundDelivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.delivery_count > 0,
                properties,
                body: message.body.clone(),
            };

            if tx.send(Ok(delivery)).is_err() {
                // consumer went away without cancelling
                if let Some(state) = self.queues.get_mut(queue) {
                    state.ready.push_front(message);
                    state.consumers.retain(|c| !(c.tag == tag && c.channel == channel_id));
                }
                continue;
            }

            self.journal.push(BrokerEvent::Delivered {
                queue: queue.to_owned(),
                delivery_tag,
                message_id: message.properties.message_id.clone(),
            });
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_owned(),
                    consumer_tag: tag,
                    message,
                },
            );
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        if let Some(conn) = self.connections.get_mut(&channel.connection) {
            conn.channels.remove(&id);
        }

        for state in self.queues.values_mut() {
            state.consumers.retain(|c| c.channel != id);
        }

        for (_, unacked) in channel.unacked.into_iter().rev() {
            self.requeue(&unacked.queue, unacked.message);
        }

        // held confirms are dropped: their futures fail with ChannelLost
        drop(channel.held);
        self.dispatch_all();
    }

    fn close_connection(&mut self, id: u64) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        for channel in conn.channels {
            self.close_channel(channel);
        }

        self.queues.retain(|_, q| q.owner != Some(id));
        conn.closed.send_replace(true);
    }
}

/// Matches a routing key against a topic pattern (`*` one word, `#` zero or more).
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn queue_compatible(existing: &QueueDefinition, requested: &QueueDefinition) -> bool {
    existing.durable == requested.durable
        && existing.exclusive == requested.exclusive
        && existing.delete == requested.delete
        && existing.arguments() == requested.arguments()
}

/// An in-process broker shared by every connection opened through its transport.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport opening connections to this broker.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
        })
    }

    /// Makes connection attempts to `host` fail.
    pub fn refuse_host(&self, host: &str) {
        self.lock().refused.insert(host.to_owned());
    }

    pub fn accept_host(&self, host: &str) {
        self.lock().refused.remove(host);
    }

    /// Hosts of every connection attempt, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.lock().attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Drops every open connection, as a network partition would.
    ///
    /// Unacknowledged deliveries return to their queues and unconfirmed publishes
    /// never get their confirm.
    pub fn kill_connections(&self) {
        let mut state = self.lock();
        state.journal.push(BrokerEvent::ConnectionsKilled);
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Withholds publisher confirms until `release_confirms` (messages are still routed).
    pub fn hold_confirms(&self, hold: bool) {
        self.lock().hold_confirms = hold;
    }

    /// Acknowledges every withheld confirm.
    pub fn release_confirms(&self) {
        let mut state = self.lock();
        for channel in state.channels.values_mut() {
            for confirm in channel.held.drain(..) {
                let _ = confirm.send(Ok(Confirmation::Ack));
            }
        }
    }

    /// Answers every following publish with a negative confirm.
    pub fn reject_publishes(&self, reject: bool) {
        self.lock().reject_publishes = reject;
    }

    /// Publishes on behalf of another client, through the default exchange or a named one.
    ///
    /// # Returns
    /// Number of queues the message was routed to
    pub fn inject(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> usize {
        let mut state = self.lock();
        let targets = state.route(exchange, routing_key);
        for queue in &targets {
            state.enqueue(
                queue,
                StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                    delivery_count: 0,
                },
            );
        }
        targets.len()
    }

    /// Makes every consumer registration wait `delay` before reaching the broker,
    /// as a slow network round trip would.
    pub fn delay_consume(&self, delay: Option<Duration>) {
        self.lock().consume_delay = delay;
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Bodies of the messages waiting in `queue`, in order.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries of `queue` handed out and not yet acknowledged.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .map(|c| c.unacked.values().filter(|u| u.queue == queue).count())
            .sum()
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Number of publishes received over client channels.
    pub fn published(&self) -> usize {
        self.lock().published
    }

    pub fn journal(&self) -> Vec<BrokerEvent> {
        self.lock().journal.clone()
    }
}

struct MemoryTransport {
    broker: MemoryBroker,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        host: &str,
        _name: &str,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.broker.lock();
        state.attempts.push(host.to_owned());

        if state.refused.contains(host) {
            return Err(AmqpError::ConnectionError(host.to_owned()));
        }

        let id = state.next_id();
        let (closed, closed_rx) = watch::channel(false);
        state.connections.insert(
            id,
            ConnectionState {
                closed,
                channels: HashSet::new(),
            },
        );
        state.journal.push(BrokerEvent::Connected {
            host: host.to_owned(),
        });

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            closed: closed_rx,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(AmqpError::ChannelError);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                confirm: false,
                next_tag: 0,
                unacked: BTreeMap::new(),
                held: vec![],
            },
        );
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.channels.insert(id);
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) {
        self.broker.lock().close_connection(self.id);
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?.prefetch = prefetch;
        state.dispatch_all();
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.broker.lock().channel(self.id)?.confirm = true;
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        match state.exchanges.get(&def.name) {
            Some(existing) if !existing.compatible_with(def) => {
                state.close_channel(self.id);
                return Err(AmqpError::TopologyConflict(def.name.clone()));
            }
            Some(_) => {}
            None if def.passive => {
                state.close_channel(self.id);
                return Err(AmqpError::DeclareExchangeError(def.name.clone()));
            }
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
            }
        }

        state.journal.push(BrokerEvent::ExchangeDeclared {
            name: def.name.clone(),
        });
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        match state.queues.get(&def.name) {
            Some(existing) if !queue_compatible(&existing.def, def) => {
                state.close_channel(self.id);
                return Err(AmqpError::TopologyConflict(def.name.clone()));
            }
            Some(_) => {}
            None if def.passive => {
                state.close_channel(self.id);
                return Err(AmqpError::DeclareQueueError(def.name.clone()));
            }
            None => {
                let owner = def.exclusive.then_some(self.connection);
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        owner,
                        ready: VecDeque::new(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
            }
        }

        state.journal.push(BrokerEvent::QueueDeclared {
            name: def.name.clone(),
        });
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            state.close_channel(self.id);
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        state.journal.push(BrokerEvent::QueueBound {
            queue: binding.queue_name.clone(),
            exchange: binding.exchange_name.clone(),
            routing_key: binding.routing_key.clone(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let delay = self.broker.lock().consume_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.lock();
        state.channel(self.id)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        if queue_state.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()));
        }

        queue_state.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            channel: self.id,
            tx,
        });
        state.journal.push(BrokerEvent::ConsumerRegistered {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
        });
        state.dispatch(queue);

        Ok(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        let id = self.id;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel == id));
        }
        state.journal.push(BrokerEvent::ConsumerCancelled {
            consumer_tag: consumer_tag.to_owned(),
        });
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let unacked = state
            .channel(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;

        state.journal.push(BrokerEvent::Acked { delivery_tag });
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let unacked = state
            .channel(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        state.journal.push(BrokerEvent::Nacked {
            delivery_tag,
            requeue,
        });

        if requeue {
            state.requeue(&unacked.queue, unacked.message);
            state.dispatch(&unacked.queue);
            return Ok(());
        }

        let dead_letter = state.queues.get(&unacked.queue).and_then(|q| {
            q.def
                .arguments()
                .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                .and_then(|v| v.as_str().map(str::to_owned))
        });

        match dead_letter {
            Some(dlq) => {
                debug!(queue = dlq.as_str(), "dead-lettering message");
                state.enqueue(&dlq, unacked.message);
            }
            None => debug!(queue = unacked.queue.as_str(), "dropping rejected message"),
        }
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<ConfirmFuture, AmqpError> {
        let mut state = self.broker.lock();
        let confirm_mode = state.channel(self.id)?.confirm;

        state.published += 1;
        state.journal.push(BrokerEvent::Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message_id: message.properties.message_id.clone(),
        });

        let targets = state.route(exchange, routing_key);
        let verdict = if state.reject_publishes {
            Confirmation::Nack
        } else if message.mandatory && targets.is_empty() {
            Confirmation::Returned
        } else {
            for queue in &targets {
                state.enqueue(
                    queue,
                    StoredMessage {
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        properties: message.properties.clone(),
                        body: message.body.clone(),
                        delivery_count: 0,
                    },
                );
            }
            Confirmation::Ack
        };

        if !confirm_mode {
            return Ok(Box::pin(async { Ok(Confirmation::Ack) }));
        }

        if state.hold_confirms {
            let (tx, rx) = oneshot::channel();
            state.channel(self.id)?.held.push(tx);
            // a held nack still resolves as a nack once released
            return Ok(Box::pin(async move {
                match rx.await {
                    Ok(Ok(_)) => Ok(verdict),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(AmqpError::ChannelLost),
                }
            }));
        }

        Ok(Box::pin(async move { Ok(verdict) }))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) {
        self.broker.lock().close_channel(self.id);
    }
}
