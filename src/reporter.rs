// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Reporting
//!
//! Terminal message failures are handed to error reporters with the full delivery
//! context. Reporting is fire-and-forget: a reporter never influences how the
//! message is resolved.

use crate::message::{DeliveryMetadata, Headers};
use std::sync::Arc;
use tracing::error;

/// Context of a message that failed terminally.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    pub consumer_name: String,
    pub message: String,
    pub error: String,
    pub delivery: DeliveryMetadata,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Sink for terminal message failures.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &ErrorContext);
}

/// Reporter writing failures to the `tracing` pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, context: &ErrorContext) {
        error!(
            consumer = context.consumer_name.as_str(),
            delivery_tag = context.delivery.delivery_tag,
            redelivery_count = context.delivery.redelivery_count,
            routing_key = context.delivery.routing_key.as_str(),
            message_id = context.delivery.message_id.as_deref().unwrap_or_default(),
            error = context.error.as_str(),
            "{}",
            context.message
        );
    }
}

/// A chain of reporters, each invoked in registration order.
#[derive(Clone, Default)]
pub struct ErrorReporters {
    reporters: Vec<Arc<dyn ErrorReporter>>,
}

impl ErrorReporters {
    pub fn new() -> Self {
        ErrorReporters::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl ErrorReporter for ErrorReporters {
    fn report(&self, context: &ErrorContext) {
        for reporter in &self.reporters {
            reporter.report(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ErrorContext {
        ErrorContext {
            consumer_name: "billing".to_owned(),
            message: "too many attempts".to_owned(),
            error: "handler failure".to_owned(),
            delivery: DeliveryMetadata {
                delivery_tag: 9,
                generation: 1,
                redelivery_count: 3,
                exchange: String::new(),
                routing_key: "invoices".to_owned(),
                message_id: None,
            },
            headers: Headers::new(),
            body: b"{}".to_vec(),
        }
    }

    #[test]
    fn chain_invokes_every_reporter() {
        let mut first = MockErrorReporter::new();
        first
            .expect_report()
            .withf(|ctx| ctx.delivery.delivery_tag == 9)
            .times(1)
            .return_const(());
        let mut second = MockErrorReporter::new();
        second.expect_report().times(1).return_const(());

        let chain = ErrorReporters::new()
            .with(Arc::new(first))
            .with(Arc::new(TracingErrorReporter))
            .with(Arc::new(second));
        assert_eq!(chain.len(), 3);

        chain.report(&context());
    }
}
