// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ
//!
//! A RabbitMQ client that survives broker restarts. A single
//! [`ConnectionSupervisor`] owns the connection and reconnects with backoff;
//! subscriptions and publishers acquire channels from it and reapply their
//! topology whenever a new connection generation comes up.
//!
//! Consumers get at-least-once processing with a bounded retry ceiling based on
//! the broker's delivery count, and publishers only resolve a publish once the
//! broker has confirmed it.

mod otel;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod health;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod reporter;
pub mod serializer;
pub mod subscription;
pub mod topology;
pub mod transport;

pub use amqp::LapinTransport;
pub use config::{ConnectionOptions, PublisherOptions, RabbitMQConfigs, SubscriptionOptions};
pub use connection::{ConnectionState, ConnectionSupervisor};
pub use errors::AmqpError;
pub use handler::{ConsumerHandler, ConsumerMessage, HandlerOutcome};
pub use health::HealthGate;
pub use message::OutboundMessage;
pub use publisher::{GuaranteedPublisher, PublishCompletion};
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionState};
pub use topology::{Binding, Topology, TopologyBinder};
