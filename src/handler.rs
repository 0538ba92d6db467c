// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Application handlers receive one message per delivery and report how processing
//! went. The returned outcome, not the invocation, decides how the delivery is
//! resolved with the broker.

use crate::{
    message::{DeliveryMetadata, Headers, MessageProperties},
    serializer::Serializer,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData, sync::Arc};
use tracing::warn;

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Processing failed but may succeed on a later attempt
    Failure(String),
    /// Processing can never succeed for this message
    PermanentFailure(String),
}

/// A delivered message as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    /// Subscription (consumer) name
    pub from: String,
    /// Message type, from the AMQP `type` property
    pub msg_type: String,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery: DeliveryMetadata,
}

impl ConsumerMessage {
    pub fn headers(&self) -> &Headers {
        &self.properties.headers
    }

    /// Decodes the payload with `serializer`.
    pub fn decode<S, T>(&self, serializer: &S) -> Result<T, crate::errors::AmqpError>
    where
        S: Serializer,
        T: DeserializeOwned,
    {
        serializer.decode(&self.data, &self.properties)
    }
}

/// Processes delivered messages.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one message.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the message headers
    /// * `msg` - The delivered message
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> HandlerOutcome;
}

/// Handler built from a closure returning a future.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps a closure into a handler.
///
/// # Example
/// ```ignore
/// let handler = handler_fn(|msg: ConsumerMessage| async move {
///     println!("{}", msg.msg_type);
///     HandlerOutcome::Success
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> HandlerOutcome {
        (self.f)(msg.clone()).await
    }
}

/// Handler that decodes the payload before invoking the application function.
///
/// Payloads that fail to decode can never succeed and resolve as permanent failures.
pub struct TypedHandler<S, T, F> {
    serializer: S,
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<S, T, F> TypedHandler<S, T, F>
where
    S: Serializer,
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, DeliveryMetadata) -> BoxFuture<'static, HandlerOutcome> + Send + Sync + 'static,
{
    /// Creates a typed handler.
    ///
    /// # Parameters
    /// * `serializer` - Decodes payloads into `T`
    /// * `f` - Application function receiving the decoded value and delivery metadata
    ///
    /// # Returns
    /// An Arc-wrapped handler
    pub fn new(serializer: S, f: F) -> Arc<dyn ConsumerHandler> {
        Arc::new(TypedHandler {
            serializer,
            f,
            _payload: PhantomData,
        })
    }
}

#[async_trait]
impl<S, T, F> ConsumerHandler for TypedHandler<S, T, F>
where
    S: Serializer,
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, DeliveryMetadata) -> BoxFuture<'static, HandlerOutcome> + Send + Sync + 'static,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> HandlerOutcome {
        match msg.decode::<S, T>(&self.serializer) {
            Ok(value) => (self.f)(value, msg.delivery.clone()).await,
            Err(err) => {
                warn!(error = err.to_string(), consumer = msg.from.as_str(), "failure to parse payload");
                HandlerOutcome::PermanentFailure(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use futures_util::FutureExt;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Invoice {
        amount: u32,
    }

    fn message(data: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            from: "billing".to_owned(),
            msg_type: "invoice".to_owned(),
            data: data.to_vec(),
            properties: MessageProperties::default(),
            delivery: DeliveryMetadata {
                delivery_tag: 1,
                generation: 1,
                redelivery_count: 0,
                exchange: String::new(),
                routing_key: "invoices".to_owned(),
                message_id: None,
            },
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_or_fails_permanently() {
        let handler = TypedHandler::new(JsonSerializer, |invoice: Invoice, _meta| {
            async move {
                match invoice.amount {
                    0 => HandlerOutcome::Failure("empty invoice".to_owned()),
                    _ => HandlerOutcome::Success,
                }
            }
            .boxed()
        });

        let ctx = Context::new();
        assert_eq!(handler.exec(&ctx, &message(br#"{"amount":5}"#)).await, HandlerOutcome::Success);
        assert_eq!(
            handler.exec(&ctx, &message(br#"{"amount":0}"#)).await,
            HandlerOutcome::Failure("empty invoice".to_owned())
        );
        assert!(matches!(
            handler.exec(&ctx, &message(b"<xml/>")).await,
            HandlerOutcome::PermanentFailure(_)
        ));
    }

    #[tokio::test]
    async fn closure_handler_sees_message() {
        let handler = handler_fn(|msg: ConsumerMessage| async move {
            match msg.msg_type.as_str() {
                "invoice" => HandlerOutcome::Success,
                other => HandlerOutcome::PermanentFailure(other.to_owned()),
            }
        });

        assert_eq!(
            handler.exec(&Context::new(), &message(b"{}")).await,
            HandlerOutcome::Success
        );
    }
}
