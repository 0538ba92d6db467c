// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Channels are handed out by the connection supervisor and stamped with the
//! connection generation they were opened on. Every operation first checks that the
//! generation is still the current one: once the connection has been replaced, a
//! stale channel fails fast with `ChannelLost` instead of issuing work on a session
//! the broker no longer knows about.

use crate::{
    connection::ConnectionSnapshot,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::OutboundMessage,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, ConfirmFuture, DeliveryStream},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Kind of channel requested from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Plain,
    /// Publisher confirms enabled
    Confirm,
}

/// A channel owned by exactly one subscription or publisher.
pub struct Channel {
    inner: Arc<dyn BrokerChannel>,
    generation: u64,
    mode: ChannelMode,
    connection: watch::Receiver<ConnectionSnapshot>,
}

impl Channel {
    pub(crate) fn new(
        inner: Arc<dyn BrokerChannel>,
        generation: u64,
        mode: ChannelMode,
        connection: watch::Receiver<ConnectionSnapshot>,
    ) -> Self {
        Channel {
            inner,
            generation,
            mode,
            connection,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Whether the channel still belongs to the live connection generation.
    pub fn is_current(&self) -> bool {
        self.connection.borrow().serves(self.generation) && self.inner.is_open()
    }

    fn ensure_current(&self) -> Result<(), AmqpError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(AmqpError::ChannelLost)
        }
    }

    /// Resolves once the connection generation this channel belongs to is gone.
    pub async fn lost(&self) {
        let generation = self.generation;
        let mut rx = self.connection.clone();
        let _ = rx.wait_for(|snapshot| !snapshot.serves(generation)).await;
    }

    pub async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.qos(prefetch).await
    }

    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.declare_exchange(def).await
    }

    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.declare_queue(def).await
    }

    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.bind_queue(binding).await
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_current()?;
        self.inner.consume(queue, consumer_tag).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.cancel(consumer_tag).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.ack(delivery_tag).await
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_current()?;
        self.inner.nack(delivery_tag, requeue).await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<ConfirmFuture, AmqpError> {
        self.ensure_current()?;
        self.inner.publish(exchange, routing_key, message).await
    }

    /// Releases the channel. Closing a stale channel is a no-op.
    pub async fn close(self) {
        if self.is_current() {
            self.inner.close().await;
            debug!(generation = self.generation, "channel closed");
        }
    }
}
