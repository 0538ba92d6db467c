// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! This module owns the single logical connection to a broker cluster. A background
//! task walks the host list in order, bounding every attempt with the per-host
//! timeout, and starts over from the first host after a backoff whenever the whole
//! list failed. Every successful (re)connect bumps the connection generation.
//!
//! The connection state lives in one `watch` channel; it is the only process-wide
//! mutable state of the crate, so every dependent observes the same generation at
//! the same time. Channels handed out by the supervisor are stamped with the
//! generation they were created on and refuse to operate once it changes.

use crate::{
    channel::{Channel, ChannelMode},
    config::ConnectionOptions,
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection, Transport},
};
use std::sync::{Arc, Mutex};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached only through an explicit shutdown
    Closed,
}

/// Snapshot of the logical connection published to every observer.
#[derive(Clone)]
pub(crate) struct ConnectionSnapshot {
    pub(crate) state: ConnectionState,
    pub(crate) generation: u64,
    pub(crate) host_index: Option<usize>,
    pub(crate) connection: Option<Arc<dyn BrokerConnection>>,
}

impl ConnectionSnapshot {
    /// Whether a channel created on `generation` may still be used.
    pub(crate) fn serves(&self, generation: u64) -> bool {
        self.state == ConnectionState::Connected && self.generation == generation
    }
}

struct SupervisorInner {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    snapshot: watch::Sender<ConnectionSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorInner {
    /// Applies `update` unless the supervisor was shut down.
    ///
    /// # Returns
    /// false when the supervisor is closed and nothing was changed
    fn transition<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut ConnectionSnapshot),
    {
        let mut applied = false;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == ConnectionState::Closed {
                return false;
            }
            update(snapshot);
            applied = true;
            true
        });
        applied
    }

    fn is_closed(&self) -> bool {
        self.snapshot.borrow().state == ConnectionState::Closed
    }

    async fn wait_closed(&self) {
        let mut rx = self.snapshot.subscribe();
        let _ = rx
            .wait_for(|snapshot| snapshot.state == ConnectionState::Closed)
            .await;
    }

    /// Tries every host once, in list order.
    async fn connect_any(&self) -> Option<(usize, Arc<dyn BrokerConnection>)> {
        for (index, host) in self.options.hosts.iter().enumerate() {
            if self.is_closed() {
                return None;
            }

            debug!(host = host.as_str(), "creating amqp connection...");
            let attempt = self.transport.connect(
                host,
                &self.options.name,
                &self.options.credentials,
            );

            match time::timeout(self.options.connect_timeout, attempt).await {
                Ok(Ok(conn)) => return Some((index, conn)),
                Ok(Err(err)) => {
                    warn!(error = err.to_string(), host = host.as_str(), "failure to connect")
                }
                Err(_) => warn!(
                    host = host.as_str(),
                    timeout_ms = self.options.connect_timeout.as_millis() as u64,
                    "connect attempt timed out"
                ),
            }
        }

        None
    }

    async fn run(self: Arc<Self>) {
        let mut cycle: u32 = 0;

        loop {
            if !self.transition(|s| s.state = ConnectionState::Connecting) {
                return;
            }

            let Some((index, conn)) = self.connect_any().await else {
                if self.options.hosts.is_empty() {
                    error!("no amqp hosts configured");
                }

                let delay = self.options.backoff.delay(cycle);
                cycle = cycle.saturating_add(1);
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    cycle, "all hosts failed, backing off"
                );

                self.transition(|s| s.state = ConnectionState::Disconnected);
                tokio::select! {
                    _ = time::sleep(delay) => continue,
                    _ = self.wait_closed() => return,
                }
            };

            cycle = 0;
            let mut generation = 0;
            let accepted = self.transition(|s| {
                s.generation += 1;
                s.state = ConnectionState::Connected;
                s.host_index = Some(index);
                s.connection = Some(conn.clone());
                generation = s.generation;
            });

            if !accepted {
                conn.close().await;
                return;
            }

            info!(
                generation,
                host = self.options.hosts[index].as_str(),
                "amqp connected"
            );

            tokio::select! {
                _ = conn.closed() => {
                    warn!(generation, "amqp connection lost");
                    self.transition(|s| {
                        s.state = ConnectionState::Disconnected;
                        s.connection = None;
                    });
                }
                _ = self.wait_closed() => {
                    conn.close().await;
                    return;
                }
            }
        }
    }
}

/// Supervises the logical connection to a broker cluster.
///
/// The supervisor is cheap to clone; every clone observes the same connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    /// Starts supervising a connection to the configured hosts.
    ///
    /// Connecting happens in the background and is retried forever with backoff;
    /// use `acquire_channel` or `wait_connected` to wait for it.
    ///
    /// # Parameters
    /// * `transport` - Broker client used to open connections
    /// * `options` - Host list, credentials, per-host timeout and backoff
    ///
    /// # Returns
    /// A handle to the supervisor
    pub fn connect(transport: Arc<dyn Transport>, options: ConnectionOptions) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            generation: 0,
            host_index: None,
            connection: None,
        });

        let inner = Arc::new(SupervisorInner {
            transport,
            options,
            snapshot,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(inner.clone().run());
        if let Ok(mut slot) = inner.task.lock() {
            *slot = Some(task);
        }

        ConnectionSupervisor { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state
    }

    /// Generation of the current (or last) connection; 0 before the first connect.
    pub fn generation(&self) -> u64 {
        self.inner.snapshot.borrow().generation
    }

    /// Index in the host list of the host currently connected to.
    pub fn host_index(&self) -> Option<usize> {
        let snapshot = self.inner.snapshot.borrow();
        match snapshot.state {
            ConnectionState::Connected => snapshot.host_index,
            _ => None,
        }
    }

    /// Backoff delay for the given retry cycle, shared by dependents retrying setup work.
    pub(crate) fn backoff(&self, cycle: u32) -> time::Duration {
        self.inner.options.backoff.delay(cycle)
    }

    /// Subscribes to generation changes.
    pub fn subscribe(&self) -> GenerationWatch {
        let rx = self.inner.snapshot.subscribe();
        let seen = rx.borrow().generation;
        GenerationWatch { rx, seen }
    }

    /// Registers an observer invoked with the new generation after successful
    /// (re)connects that happen from now on.
    ///
    /// Generations are observed through a watch, so reconnects that follow each
    /// other faster than the callback runs are coalesced: the callback receives only
    /// the latest generation. Dependents must compare generations rather than count
    /// invocations.
    ///
    /// # Returns
    /// The observer task; it ends when the supervisor shuts down
    pub fn on_reconnect<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(u64) + Send + 'static,
    {
        let mut watch = self.subscribe();
        tokio::spawn(async move {
            while let Ok(generation) = watch.next().await {
                callback(generation);
            }
        })
    }

    /// Waits until the supervisor is connected.
    ///
    /// # Returns
    /// The connected generation, or Shutdown
    pub async fn wait_connected(&self) -> Result<u64, AmqpError> {
        let mut rx = self.inner.snapshot.subscribe();
        let snapshot = rx
            .wait_for(|s| {
                matches!(s.state, ConnectionState::Connected | ConnectionState::Closed)
            })
            .await
            .map_err(|_| AmqpError::Shutdown)?;

        match snapshot.state {
            ConnectionState::Closed => Err(AmqpError::Shutdown),
            _ => Ok(snapshot.generation),
        }
    }

    /// Acquires a fresh channel on the current connection.
    ///
    /// Suspends until the supervisor is connected; channel creation failures are
    /// retried until a channel is obtained or the supervisor shuts down.
    ///
    /// # Parameters
    /// * `mode` - Plain or confirm-mode channel
    ///
    /// # Returns
    /// A channel stamped with the current generation, or Shutdown
    pub async fn acquire_channel(&self, mode: ChannelMode) -> Result<Channel, AmqpError> {
        let mut rx = self.inner.snapshot.subscribe();

        loop {
            let snapshot = rx
                .wait_for(|s| {
                    matches!(s.state, ConnectionState::Connected | ConnectionState::Closed)
                })
                .await
                .map_err(|_| AmqpError::Shutdown)?
                .clone();

            if snapshot.state == ConnectionState::Closed {
                return Err(AmqpError::Shutdown);
            }

            let Some(conn) = snapshot.connection else {
                continue;
            };

            match open_channel(conn.as_ref(), mode).await {
                Ok(raw) => {
                    debug!(generation = snapshot.generation, ?mode, "channel created");
                    return Ok(Channel::new(
                        raw,
                        snapshot.generation,
                        mode,
                        self.inner.snapshot.subscribe(),
                    ));
                }
                Err(err) => {
                    warn!(error = err.to_string(), "error to create the channel");
                    tokio::select! {
                        _ = rx.changed() => {}
                        _ = time::sleep(self.inner.options.backoff.delay(0)) => {}
                    }
                }
            }
        }
    }

    /// Tears the connection down permanently.
    ///
    /// Every pending `acquire_channel` fails with Shutdown and every channel
    /// becomes stale.
    pub async fn shutdown(&self) {
        self.inner.snapshot.send_modify(|s| {
            s.state = ConnectionState::Closed;
            s.connection = None;
        });

        let task = match self.inner.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };

        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "connection supervisor task failed");
            }
        }

        info!("amqp connection shut down");
    }
}

async fn open_channel(
    conn: &dyn BrokerConnection,
    mode: ChannelMode,
) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
    let raw = conn.create_channel().await?;

    if mode == ChannelMode::Confirm {
        if let Err(err) = raw.confirm_select().await {
            raw.close().await;
            return Err(err);
        }
    }

    Ok(raw)
}

/// Observer of connection generation changes.
pub struct GenerationWatch {
    rx: watch::Receiver<ConnectionSnapshot>,
    seen: u64,
}

impl GenerationWatch {
    /// Latest generation observed through `next`.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Waits for a generation newer than the last one observed.
    ///
    /// # Returns
    /// The new generation, or Shutdown once the supervisor is closed
    pub async fn next(&mut self) -> Result<u64, AmqpError> {
        let seen = self.seen;
        let snapshot = self
            .rx
            .wait_for(|s| s.state == ConnectionState::Closed || s.generation > seen)
            .await
            .map_err(|_| AmqpError::Shutdown)?;

        if snapshot.state == ConnectionState::Closed {
            return Err(AmqpError::Shutdown);
        }

        let generation = snapshot.generation;
        drop(snapshot);
        self.seen = generation;
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    fn options(hosts: &[&str]) -> ConnectionOptions {
        ConnectionOptions::new(hosts.iter().copied())
            .connect_timeout(Duration::from_millis(200))
            .backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    async fn within<F: std::future::Future>(fut: F) -> F::Output {
        time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn connects_to_first_reachable_host_in_order() {
        let broker = MemoryBroker::new();
        broker.refuse_host("rabbit-1:5672");

        let supervisor =
            ConnectionSupervisor::connect(broker.transport(), options(&["rabbit-1:5672", "rabbit-2:5672"]));

        assert_eq!(within(supervisor.wait_connected()).await, Ok(1));
        assert_eq!(supervisor.host_index(), Some(1));
        assert_eq!(
            broker.connect_attempts(),
            vec!["rabbit-1:5672".to_owned(), "rabbit-2:5672".to_owned()]
        );

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn retries_from_first_host_after_backoff() {
        let broker = MemoryBroker::new();
        broker.refuse_host("a:5672");
        broker.refuse_host("b:5672");

        let supervisor = ConnectionSupervisor::connect(broker.transport(), options(&["a:5672", "b:5672"]));

        within(async {
            while broker.connect_attempts().len() < 4 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert_ne!(supervisor.state(), ConnectionState::Connected);

        broker.accept_host("a:5672");
        assert_eq!(within(supervisor.wait_connected()).await, Ok(1));
        assert_eq!(supervisor.host_index(), Some(0));

        let attempts = broker.connect_attempts();
        assert_eq!(&attempts[..4], &["a:5672", "b:5672", "a:5672", "b:5672"]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_bumps_generation_and_notifies_observers() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(broker.transport(), options(&["rabbit:5672"]));
        assert_eq!(within(supervisor.wait_connected()).await, Ok(1));

        let observed = Arc::new(AtomicU64::new(0));
        let seen = observed.clone();
        let observer = supervisor.on_reconnect(move |generation| {
            seen.store(generation, Ordering::SeqCst);
        });

        let channel = within(supervisor.acquire_channel(ChannelMode::Plain)).await.unwrap();
        assert!(channel.is_current());

        broker.kill_connections();

        within(async {
            while observed.load(Ordering::SeqCst) != 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert_eq!(supervisor.generation(), 2);
        assert!(!channel.is_current());
        assert_eq!(channel.qos(1).await, Err(AmqpError::ChannelLost));

        supervisor.shutdown().await;
        within(observer).await.unwrap();
    }

    #[tokio::test]
    async fn observers_see_increasing_generations_up_to_the_latest() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::connect(broker.transport(), options(&["rabbit:5672"]));
        assert_eq!(within(supervisor.wait_connected()).await, Ok(1));

        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = observed.clone();
        let observer = supervisor.on_reconnect(move |generation| {
            seen.lock().unwrap().push(generation);
        });

        for expected in [2, 3] {
            broker.kill_connections();
            within(async {
                while supervisor.generation() != expected
                    || supervisor.state() != ConnectionState::Connected
                {
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await;
        }

        within(async {
            while observed.lock().unwrap().last() != Some(&3) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        let generations = observed.lock().unwrap().clone();
        assert!(generations.len() <= 2);
        assert!(generations.windows(2).all(|pair| pair[0] < pair[1]));

        supervisor.shutdown().await;
        within(observer).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_waits_for_connection_and_fails_after_shutdown() {
        let broker = MemoryBroker::new();
        broker.refuse_host("rabbit:5672");
        let supervisor = ConnectionSupervisor::connect(broker.transport(), options(&["rabbit:5672"]));

        let waiting = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.acquire_channel(ChannelMode::Confirm).await })
        };

        time::sleep(Duration::from_millis(30)).await;
        assert!(!waiting.is_finished());

        broker.accept_host("rabbit:5672");
        let channel = within(waiting).await.unwrap().unwrap();
        assert_eq!(channel.mode(), ChannelMode::Confirm);
        assert_eq!(channel.generation(), 1);

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert_eq!(
            within(supervisor.acquire_channel(ChannelMode::Plain)).await.err(),
            Some(AmqpError::Shutdown)
        );
        assert_eq!(broker.open_connections(), 0);
    }
}
