// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for describing and applying RabbitMQ topology:
//! exchanges, queues, and the bindings between them. A `Binding` is an immutable
//! description that is re-applied on every channel the crate acquires, so that a
//! broker which lost its state (or a queue that was exclusive to a dead connection)
//! is rebuilt before any traffic resumes.
//!
//! The main components are:
//! - `Binding`: declarative queue/exchange/routing description
//! - `TopologyBinder`: idempotent application of a binding onto a channel
//! - `Topology`: the set of bindings a publisher has to restore after a reconnect

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Declarative description of a queue and/or exchange and the rule joining them.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) routing_key: String,
}

impl Binding {
    /// Creates a binding around a queue.
    ///
    /// Without an exchange, messages reach the queue through the default exchange
    /// configured for the publisher (the broker's default exchange unless set).
    ///
    /// # Parameters
    /// * `queue` - The queue definition
    ///
    /// # Returns
    /// A new binding
    pub fn queue(queue: QueueDefinition) -> Self {
        Binding {
            exchange: None,
            queue: Some(queue),
            routing_key: String::new(),
        }
    }

    /// Creates a binding around an exchange only, as used by pure publishers.
    pub fn exchange(exchange: ExchangeDefinition) -> Self {
        Binding {
            exchange: Some(exchange),
            queue: None,
            routing_key: String::new(),
        }
    }

    /// Routes the queue through the given exchange.
    pub fn with_exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets the routing key, or the pattern for topic exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_ref().map(QueueDefinition::name)
    }

    pub fn exchange_name(&self) -> Option<&str> {
        self.exchange.as_ref().map(ExchangeDefinition::name)
    }

    /// Exchange and routing key a message published through this binding uses.
    ///
    /// # Parameters
    /// * `default_exchange` - Exchange used when the binding names none
    ///
    /// # Returns
    /// A tuple of (exchange, routing key)
    pub fn route<'b>(&'b self, default_exchange: &'b str) -> (&'b str, &'b str) {
        let exchange = self.exchange_name().unwrap_or(default_exchange);

        let routing_key = if !self.routing_key.is_empty() {
            self.routing_key.as_str()
        } else if exchange.is_empty() {
            self.queue_name().unwrap_or_default()
        } else {
            ""
        };

        (exchange, routing_key)
    }

    /// Queue-to-exchange binding implied by this description, if any.
    pub(crate) fn queue_binding(&self, default_exchange: &str) -> Option<QueueBinding> {
        let queue = self.queue_name()?;
        let (exchange, _) = self.route(default_exchange);
        if exchange.is_empty() {
            return None;
        }

        let key = if self.routing_key.is_empty() {
            queue
        } else {
            self.routing_key.as_str()
        };

        Some(QueueBinding::new(queue).exchange(exchange).routing_key(key))
    }
}

/// Applies bindings onto channels.
#[derive(Debug, Clone, Default)]
pub struct TopologyBinder {
    default_exchange: String,
}

impl TopologyBinder {
    /// Creates a binder.
    ///
    /// # Parameters
    /// * `default_exchange` - Exchange queues are bound to when a binding names none;
    ///   the empty string (the broker's default exchange) needs no binding
    pub fn new(default_exchange: &str) -> Self {
        TopologyBinder {
            default_exchange: default_exchange.to_owned(),
        }
    }

    pub fn default_exchange(&self) -> &str {
        &self.default_exchange
    }

    /// Issues the declarations described by `binding` onto `channel`.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares the exchange
    /// 2. Declares the dead letter queue, if configured
    /// 3. Declares the queue
    /// 4. Binds the queue to the exchange
    ///
    /// Declaring an identical entity twice is a no-op on the broker; conflicting
    /// parameters fail with `TopologyConflict`, which callers must not retry.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn apply(&self, binding: &Binding, channel: &Channel) -> Result<(), AmqpError> {
        if let Some(exchange) = &binding.exchange {
            debug!("creating exchange: {}", exchange.name);
            channel.declare_exchange(exchange).await.map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exchange.name.as_str(),
                    "error to declare the exchange"
                );
                err
            })?;
        }

        if let Some(queue) = &binding.queue {
            if let Some(dlq) = queue.dlq_definition() {
                debug!("creating dlq: {}", dlq.name);
                channel.declare_queue(&dlq).await.map_err(|err| {
                    error!(error = err.to_string(), name = dlq.name.as_str(), "failure to declare dlq");
                    err
                })?;
            }

            debug!("creating queue: {}", queue.name);
            channel.declare_queue(queue).await.map_err(|err| {
                error!(error = err.to_string(), name = queue.name.as_str(), "failure to declare queue");
                err
            })?;
        }

        if let Some(queue_binding) = binding.queue_binding(&self.default_exchange) {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue_binding.queue_name, queue_binding.exchange_name, queue_binding.routing_key
            );
            channel.bind_queue(&queue_binding).await.map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                err
            })?;
        }

        debug!(generation = channel.generation(), "topology applied");
        Ok(())
    }
}

/// Set of bindings applied together, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    bindings: Vec<Binding>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Adds a binding to the set; identical bindings are kept once.
    pub fn binding(mut self, binding: Binding) -> Self {
        self.insert(&binding);
        self
    }

    /// Adds a binding unless an identical one is already present.
    ///
    /// # Returns
    /// true when the binding is new
    pub fn insert(&mut self, binding: &Binding) -> bool {
        if self.contains(binding) {
            return false;
        }
        self.bindings.push(binding.clone());
        true
    }

    pub fn contains(&self, binding: &Binding) -> bool {
        self.bindings.iter().any(|b| b == binding)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Applies every binding onto `channel`.
    pub async fn install(&self, binder: &TopologyBinder, channel: &Channel) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            binder.apply(binding, channel).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelMode,
        config::ConnectionOptions,
        connection::ConnectionSupervisor,
        memory::{BrokerEvent, MemoryBroker},
    };
    use std::time::Duration;

    #[test]
    fn queue_only_binding_routes_through_default_exchange() {
        let binding = Binding::queue(QueueDefinition::new("orders"));
        assert_eq!(binding.route(""), ("", "orders"));
        assert!(binding.queue_binding("").is_none());

        let bound = binding.queue_binding("events").unwrap();
        assert_eq!(bound, QueueBinding::new("orders").exchange("events").routing_key("orders"));
        assert_eq!(binding.route("events"), ("events", ""));
    }

    #[test]
    fn explicit_exchange_and_pattern() {
        let binding = Binding::queue(QueueDefinition::new("audit"))
            .with_exchange(ExchangeDefinition::new("events").topic())
            .routing_key("orders.*");

        assert_eq!(binding.route("ignored"), ("events", "orders.*"));
        assert_eq!(
            binding.queue_binding("ignored").unwrap(),
            QueueBinding::new("audit").exchange("events").routing_key("orders.*")
        );
    }

    #[test]
    fn topology_keeps_bindings_once() {
        let binding = Binding::queue(QueueDefinition::new("orders"));
        let mut topology = Topology::new().binding(binding.clone());
        assert!(!topology.insert(&binding));
        assert!(topology.insert(&Binding::queue(QueueDefinition::new("payments"))));
        assert_eq!(topology.len(), 2);
    }

    #[tokio::test]
    async fn apply_is_ordered_idempotent_and_surfaces_conflicts() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(
            broker.transport(),
            ConnectionOptions::new(["rabbit:5672"]).backoff(Duration::from_millis(5), Duration::from_millis(5)),
        );
        let channel = supervisor.acquire_channel(ChannelMode::Plain).await.unwrap();

        let binding = Binding::queue(QueueDefinition::new("orders").durable().with_dlq())
            .with_exchange(ExchangeDefinition::new("events").direct().durable())
            .routing_key("order.created");

        let binder = TopologyBinder::default();
        binder.apply(&binding, &channel).await.unwrap();
        binder.apply(&binding, &channel).await.unwrap();

        let declarations: Vec<BrokerEvent> = broker
            .journal()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    BrokerEvent::ExchangeDeclared { .. }
                        | BrokerEvent::QueueDeclared { .. }
                        | BrokerEvent::QueueBound { .. }
                )
            })
            .take(4)
            .collect();

        assert_eq!(
            declarations,
            vec![
                BrokerEvent::ExchangeDeclared { name: "events".into() },
                BrokerEvent::QueueDeclared { name: "orders-dlq".into() },
                BrokerEvent::QueueDeclared { name: "orders".into() },
                BrokerEvent::QueueBound {
                    queue: "orders".into(),
                    exchange: "events".into(),
                    routing_key: "order.created".into()
                },
            ]
        );

        let conflicting = Binding::queue(QueueDefinition::new("orders"));
        let err = binder.apply(&conflicting, &channel).await.unwrap_err();
        assert!(matches!(err, AmqpError::TopologyConflict(_)));
        assert!(err.is_configuration());

        supervisor.shutdown().await;
    }
}
