// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Transport-neutral representations of headers, message properties, inbound
//! deliveries and outbound messages. The lapin adapter and the in-memory broker both
//! translate to and from these types, so the core never touches wire-level values.

use std::collections::BTreeMap;
use uuid::Uuid;

/// Header set by quorum queues with the number of previous delivery attempts
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";
/// Header carrying the attempt count of a message republished for retry
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Ordered header map attached to messages.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i32),
    LongLongInt(i64),
    LongString(String),
    Array(Vec<HeaderValue>),
    Table(Headers),
}

impl HeaderValue {
    /// Reads an integral header as `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(i64::from(*v)),
            HeaderValue::LongLongInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::LongString(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Basic properties carried next to a payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Application-level message type (AMQP `type` property)
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Headers,
}

/// One message handed over by the broker on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl InboundDelivery {
    /// Number of previous delivery attempts, as observed from broker metadata.
    ///
    /// Quorum queues report `x-delivery-count`; copies republished for retry carry
    /// `x-retry-count`; dead-letter cycles report the count of the first `x-death`
    /// entry; otherwise the redelivered flag only tells whether at least one attempt
    /// happened before.
    pub fn redelivery_count(&self) -> u32 {
        let headers = &self.properties.headers;

        let counted = [AMQP_HEADERS_DELIVERY_COUNT, AMQP_HEADERS_RETRY_COUNT]
            .into_iter()
            .find_map(|key| headers.get(key).and_then(HeaderValue::as_i64));
        if let Some(count) = counted {
            return clamp_count(count);
        }

        let death_count = match headers.get(AMQP_HEADERS_X_DEATH) {
            Some(HeaderValue::Array(deaths)) => match deaths.first() {
                Some(HeaderValue::Table(table)) => {
                    table.get(AMQP_HEADERS_COUNT).and_then(HeaderValue::as_i64)
                }
                _ => None,
            },
            _ => None,
        };

        match death_count {
            Some(count) => clamp_count(count),
            None if self.redelivered => 1,
            None => 0,
        }
    }
}

fn clamp_count(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

/// Delivery context kept alongside a message while its handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    /// Connection generation of the channel that received the delivery
    pub generation: u64,
    pub redelivery_count: u32,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
}

impl DeliveryMetadata {
    pub(crate) fn new(delivery: &InboundDelivery, generation: u64) -> Self {
        DeliveryMetadata {
            delivery_tag: delivery.delivery_tag,
            generation,
            redelivery_count: delivery.redelivery_count(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            message_id: delivery.properties.message_id.clone(),
        }
    }
}

/// An outbound message awaiting publication.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Ask the broker to return the message when no queue matches the route
    pub mandatory: bool,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        OutboundMessage {
            body: body.into(),
            properties: MessageProperties::default(),
            mandatory: false,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.properties.content_type = Some(content_type.to_owned());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.properties.kind = Some(kind.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.properties.message_id = Some(id.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.properties.correlation_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.properties.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Stamps a fresh message id unless one was set by the caller.
    pub(crate) fn ensure_message_id(&mut self) {
        if self.properties.message_id.is_none() {
            self.properties.message_id = Some(Uuid::new_v4().to_string());
        }
    }
}
