// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The traits in this module describe the primitive operations the core needs from a
//! broker client: opening connections to a single host, multiplexing channels over
//! them, and the declare/consume/ack/publish operations issued on a channel. The
//! `amqp` module implements them on top of lapin, the `memory` module implements them
//! in-process.

use crate::{
    config::Credentials,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{InboundDelivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use std::sync::Arc;

/// Stream of deliveries produced by a registered consumer.
///
/// The stream ends when the consumer is cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Future resolved when the broker confirms a publish on a confirm-mode channel.
///
/// It fails with `ChannelLost` when the channel closes before the confirm arrives.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Broker verdict on a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// A mandatory publish matched no queue and was handed back
    Returned,
}

/// Opens connections to a single broker host.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects to `host` (`host:port`).
    ///
    /// # Parameters
    /// * `host` - Host to connect to
    /// * `name` - Connection name reported to the broker
    /// * `credentials` - Credentials and vhost
    async fn connect(
        &self,
        host: &str,
        name: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One live session to a broker host.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// A channel multiplexed over a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limits the unacknowledged deliveries of consumers on this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Switches the channel to confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Registers a consumer on `queue` under `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Publishes a message. The returned future resolves with the broker confirm;
    /// on channels without confirm mode it resolves immediately with `Ack`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<ConfirmFuture, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}
