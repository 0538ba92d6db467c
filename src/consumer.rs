// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Acknowledgment
//!
//! This module decides, per delivered message and handler outcome, whether the
//! delivery is acknowledged, requeued for another attempt, or rejected for good:
//!
//! 1. `Success` acknowledges the delivery tag
//! 2. `Failure` below the retry ceiling sends the message back for another attempt.
//!    Quorum queues count redeliveries themselves, so the delivery is
//!    negative-acknowledged with requeue. Classic queues only flag redeliveries, so a
//!    copy carrying the attempt count in `x-retry-count` is published back to the
//!    queue and the original is acknowledged
//! 3. `Failure` at or above the ceiling, and `PermanentFailure`, negative-acknowledge
//!    without requeue (the queue's dead-letter policy applies) and report the failure
//!    with the full delivery context
//!
//! In-flight tags are tracked per channel generation: a handler finishing after its
//! channel was replaced resolves as stale and is dropped, the broker redelivers the
//! message on its own.

use crate::{
    channel::Channel,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, HandlerOutcome},
    message::{
        DeliveryMetadata, HeaderValue, InboundDelivery, OutboundMessage, AMQP_HEADERS_RETRY_COUNT,
    },
    otel,
    queue::QueueDefinition,
    reporter::{ErrorContext, ErrorReporter},
    transport::Confirmation,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::BTreeSet, sync::Arc};
use tracing::{debug, error, warn};

/// What the engine does with a delivery for a given outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Requeue,
    Reject,
}

/// How a retryable failure goes back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryRoute {
    /// Negative-acknowledge with requeue; the queue stamps `x-delivery-count`
    Requeue,
    /// Publish a copy with an incremented `x-retry-count` to `queue` through the
    /// default exchange, then acknowledge the original
    Republish { queue: String },
}

impl RetryRoute {
    /// Route matching the way `queue` counts redeliveries.
    pub fn for_queue(queue: &QueueDefinition) -> Self {
        match queue.quorum {
            true => RetryRoute::Requeue,
            false => RetryRoute::Republish {
                queue: queue.name.clone(),
            },
        }
    }
}

/// How a delivery ended up being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Requeued,
    /// Negative-acknowledged without requeue and reported
    Rejected,
    /// The delivery belonged to a channel that no longer exists
    Stale,
}

/// Delivery tags handed to handlers and not yet resolved, for one channel generation.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    generation: u64,
    tags: BTreeSet<u64>,
}

impl InFlight {
    pub fn new(generation: u64) -> Self {
        InFlight {
            generation,
            tags: BTreeSet::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn track(&mut self, delivery_tag: u64) {
        self.tags.insert(delivery_tag);
    }

    pub fn contains(&self, delivery_tag: u64) -> bool {
        self.tags.contains(&delivery_tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Claims `delivery` for resolution.
    ///
    /// # Returns
    /// false when the delivery is unknown or belongs to another generation
    fn claim(&mut self, delivery: &DeliveryMetadata) -> bool {
        delivery.generation == self.generation && self.tags.remove(&delivery.delivery_tag)
    }
}

/// Resolves deliveries against the broker.
pub struct DeliveryAckEngine {
    consumer_name: String,
    retry_ceiling: u32,
    route: RetryRoute,
    reporter: Arc<dyn ErrorReporter>,
}

impl DeliveryAckEngine {
    /// Creates an engine.
    ///
    /// # Parameters
    /// * `consumer_name` - Name reported with terminal failures
    /// * `retry_ceiling` - Redelivery count from which a failure is terminal
    /// * `reporter` - Sink for terminal failures
    ///
    /// Retries are requeued until `retry_route` says otherwise.
    pub fn new(consumer_name: &str, retry_ceiling: u32, reporter: Arc<dyn ErrorReporter>) -> Self {
        DeliveryAckEngine {
            consumer_name: consumer_name.to_owned(),
            retry_ceiling,
            route: RetryRoute::Requeue,
            reporter,
        }
    }

    pub fn retry_route(mut self, route: RetryRoute) -> Self {
        self.route = route;
        self
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Decides what to do with a delivery seen `redelivery_count` times before.
    pub fn decide(&self, redelivery_count: u32, outcome: &HandlerOutcome) -> AckDecision {
        match outcome {
            HandlerOutcome::Success => AckDecision::Ack,
            HandlerOutcome::Failure(_) if redelivery_count < self.retry_ceiling => {
                AckDecision::Requeue
            }
            HandlerOutcome::Failure(_) | HandlerOutcome::PermanentFailure(_) => AckDecision::Reject,
        }
    }

    /// Resolves one delivery.
    ///
    /// # Parameters
    /// * `channel` - Channel the subscription currently owns
    /// * `in_flight` - In-flight tags of that channel
    /// * `msg` - The handled message
    /// * `outcome` - What the handler returned
    ///
    /// # Returns
    /// The resolution applied, or the ack/nack error
    pub async fn resolve(
        &self,
        channel: &Channel,
        in_flight: &mut InFlight,
        msg: &ConsumerMessage,
        outcome: &HandlerOutcome,
    ) -> Result<Resolution, AmqpError> {
        let tag = msg.delivery.delivery_tag;

        if channel.generation() != in_flight.generation() || !in_flight.claim(&msg.delivery) {
            debug!(
                delivery_tag = tag,
                generation = msg.delivery.generation,
                "dropping stale delivery resolution"
            );
            return Ok(Resolution::Stale);
        }

        match self.decide(msg.delivery.redelivery_count, outcome) {
            AckDecision::Ack => {
                debug!(delivery_tag = tag, "message successfully processed");
                settle(channel.ack(tag).await, Resolution::Acked, AmqpError::AckMessageError)
            }
            AckDecision::Requeue => {
                warn!(
                    delivery_tag = tag,
                    redelivery_count = msg.delivery.redelivery_count,
                    "error whiling handling msg, requeuing for latter"
                );
                match &self.route {
                    RetryRoute::Requeue => settle(
                        channel.nack(tag, true).await,
                        Resolution::Requeued,
                        AmqpError::NackMessageError,
                    ),
                    RetryRoute::Republish { queue } => self.republish(channel, queue, msg).await,
                }
            }
            AckDecision::Reject => {
                let resolution = settle(
                    channel.nack(tag, false).await,
                    Resolution::Rejected,
                    AmqpError::NackMessageError,
                )?;

                if resolution == Resolution::Rejected {
                    self.report(msg, outcome);
                }
                Ok(resolution)
            }
        }
    }

    /// Publishes a copy of `msg` with the next attempt count, then acknowledges the
    /// original. If the copy cannot be published the delivery is requeued instead.
    async fn republish(
        &self,
        channel: &Channel,
        queue: &str,
        msg: &ConsumerMessage,
    ) -> Result<Resolution, AmqpError> {
        let tag = msg.delivery.delivery_tag;
        let attempt = i64::from(msg.delivery.redelivery_count) + 1;

        let mut retry = OutboundMessage::new(msg.data.clone());
        retry.properties = msg.properties.clone();
        retry
            .properties
            .headers
            .insert(AMQP_HEADERS_RETRY_COUNT.to_owned(), HeaderValue::LongLongInt(attempt));

        let confirmation = match channel.publish("", queue, &retry).await {
            Ok(confirm) => confirm.await,
            Err(err) => Err(err),
        };

        match confirmation {
            Ok(Confirmation::Ack) => {
                debug!(delivery_tag = tag, attempt, queue, "message republished for retry");
                settle(channel.ack(tag).await, Resolution::Requeued, AmqpError::AckMessageError)
            }
            Err(AmqpError::ChannelLost) => Ok(Resolution::Stale),
            other => {
                warn!(
                    delivery_tag = tag,
                    queue,
                    outcome = ?other,
                    "failure to republish msg, requeuing"
                );
                settle(
                    channel.nack(tag, true).await,
                    Resolution::Requeued,
                    AmqpError::NackMessageError,
                )
            }
        }
    }

    /// Negative-acknowledges with requeue every delivery still in flight.
    ///
    /// # Returns
    /// The number of deliveries requeued
    pub async fn requeue_all(&self, channel: &Channel, in_flight: &mut InFlight) -> usize {
        if channel.generation() != in_flight.generation() {
            in_flight.tags.clear();
            return 0;
        }

        let mut requeued = 0;
        for tag in std::mem::take(&mut in_flight.tags) {
            match channel.nack(tag, true).await {
                Ok(_) => requeued += 1,
                Err(err) => {
                    warn!(error = err.to_string(), delivery_tag = tag, "failure to requeue message")
                }
            }
        }
        requeued
    }

    fn report(&self, msg: &ConsumerMessage, outcome: &HandlerOutcome) {
        let (message, reason) = match outcome {
            HandlerOutcome::PermanentFailure(reason) => ("permanent failure, rejecting message", reason),
            HandlerOutcome::Failure(reason) => ("too many attempts, rejecting message", reason),
            HandlerOutcome::Success => return,
        };

        error!(
            consumer = self.consumer_name.as_str(),
            delivery_tag = msg.delivery.delivery_tag,
            "{}",
            message
        );

        self.reporter.report(&ErrorContext {
            consumer_name: self.consumer_name.clone(),
            message: message.to_owned(),
            error: reason.clone(),
            delivery: msg.delivery.clone(),
            headers: msg.properties.headers.clone(),
            body: msg.data.clone(),
        });
    }
}

/// Maps an ack/nack result: losing the channel turns the resolution stale.
fn settle(
    result: Result<(), AmqpError>,
    resolution: Resolution,
    failure: AmqpError,
) -> Result<Resolution, AmqpError> {
    match result {
        Ok(_) => Ok(resolution),
        Err(AmqpError::ChannelLost) => Ok(Resolution::Stale),
        Err(err) => {
            error!(error = err.to_string(), "error whiling settling msg");
            Err(failure)
        }
    }
}

/// Builds the handler-facing message out of a raw delivery.
pub(crate) fn consumer_message(
    consumer_name: &str,
    delivery: InboundDelivery,
    generation: u64,
) -> ConsumerMessage {
    let metadata = DeliveryMetadata::new(&delivery, generation);
    let msg_type = delivery.properties.kind.clone().unwrap_or_default();

    ConsumerMessage {
        from: consumer_name.to_owned(),
        msg_type,
        data: delivery.body,
        properties: delivery.properties,
        delivery: metadata,
    }
}

/// Runs `handler` on `msg` inside a consumer span.
pub(crate) async fn handle(handler: Arc<dyn ConsumerHandler>, msg: &ConsumerMessage) -> HandlerOutcome {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&msg.properties.headers, &tracer, &msg.msg_type);

    debug!(
        "received: {} - exchange: {}",
        msg.msg_type, msg.delivery.exchange
    );

    let outcome = handler.exec(&ctx, msg).await;
    match &outcome {
        HandlerOutcome::Success => span.set_status(Status::Ok),
        HandlerOutcome::Failure(reason) | HandlerOutcome::PermanentFailure(reason) => {
            span.set_status(Status::Error {
                description: Cow::from(reason.clone()),
            })
        }
    }
    span.end();

    outcome
}
