// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! Errors fall in four families: transient infrastructure failures that the core
//! absorbs and retries (connection and channel loss), configuration failures that
//! are surfaced immediately (topology conflicts), message-level failures handled
//! by the acknowledgment engine, and publish-level failures surfaced to the caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carry owned strings only, so the error can be cloned into every
/// completion handle or subscription observer that needs to see it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel (or its connection) went away, or belongs to a stale generation
    #[error("channel lost")]
    ChannelLost,

    /// A declaration conflicts with an existing entity on the broker
    #[error("topology conflict `{0}`")]
    TopologyConflict(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker refused a published message
    #[error("publish rejected `{0}`")]
    PublishRejected(String),

    /// Error encoding or decoding a payload
    #[error("serialization failure `{0}`")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// The component was shut down before the operation could complete
    #[error("shutdown")]
    Shutdown,
}

impl AmqpError {
    /// Whether the failure belongs to the infrastructure and should be retried
    /// inside the core instead of being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError
                | AmqpError::ChannelLost
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }

    /// Whether the failure points to a configuration bug. These are fatal to the
    /// owning subscription or binding, never to the whole process.
    pub fn is_configuration(&self) -> bool {
        matches!(self, AmqpError::TopologyConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_failures() {
        assert!(AmqpError::ChannelLost.is_transient());
        assert!(AmqpError::ConnectionError("localhost:5672".into()).is_transient());
        assert!(!AmqpError::TopologyConflict("orders".into()).is_transient());
        assert!(AmqpError::TopologyConflict("orders".into()).is_configuration());
        assert!(!AmqpError::PublishRejected("nack".into()).is_transient());
        assert!(!AmqpError::Shutdown.is_configuration());
    }

    #[test]
    fn renders_binding_names() {
        let err = AmqpError::BindingExchangeToQueueError("events".into(), "orders".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `events` to queue `orders`"
        );
    }
}
