// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configuration
//!
//! This module provides the configuration section consumed by the crate. Loading the
//! section (files, environment, remote stores) belongs to the application; this module
//! only describes its shape, its defaults, and how it is split into the option structs
//! handed to the connection supervisor, subscriptions and publishers.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::time::Duration;

/// Default per-host connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
/// Default number of redeliveries before a failing message is dead-ended
pub const DEFAULT_RETRY_CEILING: u32 = 3;
/// Default grace period for a cooperative subscription close in milliseconds
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 30_000;
/// Default prefetch (QoS) limit per subscription
pub const DEFAULT_PREFETCH: u16 = 10;
/// Default bound on unconfirmed publishes per publisher
pub const DEFAULT_MAX_IN_FLIGHT_PUBLISHES: usize = 256;

/// RabbitMQ configuration section.
///
/// Every field has a default, so a partial document deserializes into a usable
/// configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Name reported to the broker as the connection name
    pub app_name: String,
    /// Candidate hosts, `host:port`, tried in order
    pub hosts: Vec<String>,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Per-host connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    pub backoff: BackoffConfigs,
    /// Exchange used when a binding does not name one
    pub default_exchange: String,
    pub prefetch: u16,
    pub retry_ceiling: u32,
    /// Grace period used by `close_default` in milliseconds
    pub close_grace_ms: u64,
    pub max_in_flight_publishes: usize,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "rabbitmq-resilient".to_owned(),
            hosts: vec!["localhost:5672".to_owned()],
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            backoff: BackoffConfigs::default(),
            default_exchange: String::new(),
            prefetch: DEFAULT_PREFETCH,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            max_in_flight_publishes: DEFAULT_MAX_IN_FLIGHT_PUBLISHES,
        }
    }
}

/// Reconnect backoff applied after every host in the list failed.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfigs {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfigs {
    fn default() -> Self {
        BackoffConfigs {
            base_ms: 100,
            max_ms: 10_000,
        }
    }
}

impl BackoffConfigs {
    /// Computes the delay before the given retry cycle (0-indexed).
    ///
    /// The delay doubles every cycle and is capped at `max_ms`.
    pub fn delay(&self, cycle: u32) -> Duration {
        let exp = cycle.min(30);
        let delay = self.base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_ms))
    }
}

/// Credentials presented to every host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

/// Options for the connection supervisor.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub(crate) name: String,
    pub(crate) hosts: Vec<String>,
    pub(crate) credentials: Credentials,
    pub(crate) connect_timeout: Duration,
    pub(crate) backoff: BackoffConfigs,
}

impl ConnectionOptions {
    /// Creates connection options for the given host list with default credentials.
    ///
    /// # Parameters
    /// * `hosts` - Candidate hosts, tried in order
    ///
    /// # Returns
    /// A new ConnectionOptions instance
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConnectionOptions {
            name: RabbitMQConfigs::default().app_name,
            hosts: hosts.into_iter().map(Into::into).collect(),
            credentials: Credentials::default(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            backoff: BackoffConfigs::default(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = BackoffConfigs {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        };
        self
    }
}

/// Options for a single subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub(crate) name: String,
    pub(crate) prefetch: u16,
    pub(crate) retry_ceiling: u32,
    pub(crate) close_grace: Duration,
}

impl SubscriptionOptions {
    /// Creates subscription options with the crate defaults.
    ///
    /// # Parameters
    /// * `name` - Consumer name, used as the broker consumer tag prefix and in error reports
    pub fn new(name: &str) -> Self {
        SubscriptionOptions {
            name: name.to_owned(),
            prefetch: DEFAULT_PREFETCH,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            close_grace: Duration::from_millis(DEFAULT_CLOSE_GRACE_MS),
        }
    }

    /// Sets the prefetch (QoS) limit. Zero is raised to one.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

/// Options for a guaranteed publisher.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub(crate) max_in_flight: usize,
    pub(crate) default_exchange: String,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        PublisherOptions {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT_PUBLISHES,
            default_exchange: String::new(),
        }
    }
}

impl PublisherOptions {
    /// Sets the bound on unconfirmed publishes. Zero is raised to one.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn default_exchange(mut self, exchange: &str) -> Self {
        self.default_exchange = exchange.to_owned();
        self
    }
}

impl RabbitMQConfigs {
    /// Parses a JSON configuration document.
    ///
    /// # Parameters
    /// * `raw` - JSON text; missing fields take their defaults
    ///
    /// # Returns
    /// The parsed configuration or a SerializationError
    pub fn from_json(raw: &str) -> Result<Self, AmqpError> {
        serde_json::from_str(raw).map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    /// Builds the connection supervisor options described by this section.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            name: self.app_name.clone(),
            hosts: self.hosts.clone(),
            credentials: Credentials {
                user: self.user.clone(),
                password: self.password.clone(),
                vhost: self.vhost.clone(),
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            backoff: self.backoff,
        }
    }

    /// Builds options for a subscription named `name`.
    pub fn subscription_options(&self, name: &str) -> SubscriptionOptions {
        SubscriptionOptions::new(name)
            .prefetch(self.prefetch)
            .retry_ceiling(self.retry_ceiling)
            .close_grace(Duration::from_millis(self.close_grace_ms))
    }

    /// Builds publisher options described by this section.
    pub fn publisher_options(&self) -> PublisherOptions {
        PublisherOptions::default()
            .max_in_flight(self.max_in_flight_publishes)
            .default_exchange(&self.default_exchange)
    }
}
