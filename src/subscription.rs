// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Lifecycle
//!
//! A subscription is a consumer bound to one `Binding`, driven by a single task:
//!
//! ```text
//! Initializing -> Running -> Closing -> Closed
//!       ^            |
//!       +------------+ (channel lost)
//! ```
//!
//! `Aborted` is reachable from every non-terminal state. While `Initializing` the task
//! acquires a channel, sets the prefetch limit, applies the topology and registers the
//! broker consumer, in that order, so no delivery is accepted on a channel whose
//! topology was not restored. Deliveries are handed to the handler concurrently (up to
//! the prefetch limit) and resolved by the `DeliveryAckEngine` in completion order.
//!
//! Pausing through the `HealthGate` stops polling the consumer: the prefetch limit
//! bounds what the broker pushes meanwhile, and nothing reaches the handler until the
//! gate is resumed.

use crate::{
    channel::{Channel, ChannelMode},
    config::SubscriptionOptions,
    connection::ConnectionSupervisor,
    consumer::{self, DeliveryAckEngine, InFlight, RetryRoute},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, HandlerOutcome},
    health::HealthGate,
    message::InboundDelivery,
    reporter::{ErrorReporter, TracingErrorReporter},
    topology::{Binding, TopologyBinder},
    transport::DeliveryStream,
};
use futures_util::{FutureExt, StreamExt};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinSet},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Initializing,
    Running,
    Closing,
    Closed,
    Aborted,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: SubscriptionState,
    initialized: bool,
}

struct Shared {
    status: watch::Sender<Status>,
    in_flight: AtomicUsize,
    error: Mutex<Option<AmqpError>>,
}

impl Shared {
    fn new(state: SubscriptionState) -> Self {
        let (status, _) = watch::channel(Status {
            state,
            initialized: false,
        });
        Shared {
            status,
            in_flight: AtomicUsize::new(0),
            error: Mutex::new(None),
        }
    }

    fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    /// Moves to `state` unless a terminal state was already reached.
    fn set_state(&self, state: SubscriptionState) {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() || status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }

    fn running(&self) {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            status.state = SubscriptionState::Running;
            status.initialized = true;
            true
        });
    }

    fn abort_with(&self, err: AmqpError) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(err);
        }
        self.in_flight.store(0, Ordering::Relaxed);
        self.set_state(SubscriptionState::Aborted);
    }

    fn error(&self) -> Option<AmqpError> {
        self.error.lock().ok().and_then(|slot| slot.clone())
    }
}

enum Command {
    Close(Duration),
    Abort,
}

/// Receives control commands; once every handle is gone the subscription is
/// detached and keeps running until the connection shuts down.
struct Control {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Control {
    async fn recv(&mut self) -> Command {
        match self.rx.recv().await {
            Some(command) => command,
            None => std::future::pending().await,
        }
    }
}

enum SessionEnd {
    Close(Duration),
    Abort,
    Lost,
}

type HandlerResult = Result<(ConsumerMessage, HandlerOutcome), JoinError>;

/// Builder of a subscription.
///
/// # Example
/// ```ignore
/// let handle = Subscription::new(&supervisor, binding, handler, SubscriptionOptions::new("billing"))
///     .gate(&gate)
///     .start();
/// handle.wait_initialized().await?;
/// ```
pub struct Subscription {
    supervisor: ConnectionSupervisor,
    binder: TopologyBinder,
    binding: Binding,
    handler: Arc<dyn ConsumerHandler>,
    options: SubscriptionOptions,
    gate: HealthGate,
    reporter: Arc<dyn ErrorReporter>,
}

impl Subscription {
    /// Describes a subscription.
    ///
    /// # Parameters
    /// * `supervisor` - Connection the subscription acquires its channels from
    /// * `binding` - Topology to apply; its queue is the one consumed
    /// * `handler` - Application handler invoked per delivery
    /// * `options` - Name, prefetch, retry ceiling and default close grace
    pub fn new(
        supervisor: &ConnectionSupervisor,
        binding: Binding,
        handler: Arc<dyn ConsumerHandler>,
        options: SubscriptionOptions,
    ) -> Self {
        Subscription {
            supervisor: supervisor.clone(),
            binder: TopologyBinder::default(),
            binding,
            handler,
            options,
            gate: HealthGate::new(),
            reporter: Arc::new(TracingErrorReporter),
        }
    }

    pub fn binder(mut self, binder: TopologyBinder) -> Self {
        self.binder = binder;
        self
    }

    /// Registers the subscription with a process-wide pause/resume gate.
    pub fn gate(mut self, gate: &HealthGate) -> Self {
        self.gate = gate.clone();
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Spawns the subscription task.
    ///
    /// # Returns
    /// The control handle; the subscription starts `Initializing`
    pub fn start(self) -> SubscriptionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(SubscriptionState::Initializing));
        let handle = SubscriptionHandle {
            name: self.options.name.clone(),
            close_grace: self.options.close_grace,
            commands: tx,
            shared: shared.clone(),
        };

        let Some(queue) = self.binding.queue.as_ref() else {
            error!(consumer = self.options.name.as_str(), "binding without queue, nothing to consume");
            shared.abort_with(AmqpError::ConsumerDeclarationError(self.options.name.clone()));
            return handle;
        };

        let engine = DeliveryAckEngine::new(
            &self.options.name,
            self.options.retry_ceiling,
            self.reporter.clone(),
        )
        .retry_route(RetryRoute::for_queue(queue));
        let worker = Worker {
            queue: queue.name().to_owned(),
            subscription: self,
            engine,
            shared,
        };
        tokio::spawn(worker.run(Control { rx }));

        handle
    }
}

struct Worker {
    queue: String,
    subscription: Subscription,
    engine: DeliveryAckEngine,
    shared: Arc<Shared>,
}

impl Worker {
    fn name(&self) -> &str {
        &self.subscription.options.name
    }

    async fn run(self, mut control: Control) {
        let mut gate = self.subscription.gate.watch();
        let mut attempt: u32 = 0;

        loop {
            self.shared.set_state(SubscriptionState::Initializing);

            let connected = tokio::select! {
                biased;
                command = control.recv() => return self.stop_idle(command),
                connected = self.subscription.supervisor.wait_connected() => connected,
            };

            let (setup, pending) = match connected {
                Ok(_) => self.setup(&mut control).await,
                Err(err) => (Err(err), None),
            };

            if let Some(command) = pending {
                return match setup {
                    Ok((channel, stream, consumer_tag)) => {
                        self.stop_registered(channel, stream, &consumer_tag, command)
                            .await
                    }
                    Err(_) => self.stop_idle(command),
                };
            }

            let (channel, stream, consumer_tag) = match setup {
                Ok(session) => session,
                Err(AmqpError::Shutdown) => {
                    info!(consumer = self.name(), "connection shut down, aborting subscription");
                    return self.shared.abort_with(AmqpError::Shutdown);
                }
                Err(err) if err.is_configuration() => {
                    error!(error = err.to_string(), consumer = self.name(), "topology conflict, aborting subscription");
                    return self.shared.abort_with(err);
                }
                Err(err) => {
                    let delay = self.subscription.supervisor.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        error = err.to_string(),
                        consumer = self.name(),
                        delay_ms = delay.as_millis() as u64,
                        "failure to subscribe, retrying"
                    );

                    tokio::select! {
                        biased;
                        command = control.recv() => return self.stop_idle(command),
                        _ = time::sleep(delay) => continue,
                    }
                }
            };

            attempt = 0;
            if !self
                .serve(channel, stream, &consumer_tag, &mut control, &mut gate)
                .await
            {
                return;
            }
        }
    }

    /// Ends the subscription while no channel is held.
    fn stop_idle(&self, command: Command) {
        let state = match command {
            Command::Close(_) => SubscriptionState::Closed,
            Command::Abort => SubscriptionState::Aborted,
        };
        info!(consumer = self.name(), ?state, "subscription stopped before running");
        self.shared.set_state(state);
    }

    /// Runs `subscribe` to completion.
    ///
    /// Setup is never cancelled half way, since a dropped setup would leave an open
    /// channel and a registered consumer behind. A command received meanwhile is
    /// returned alongside the outcome.
    async fn setup(
        &self,
        control: &mut Control,
    ) -> (Result<(Channel, DeliveryStream, String), AmqpError>, Option<Command>) {
        let subscribe = self.subscribe();
        tokio::pin!(subscribe);

        let mut pending = None;
        loop {
            tokio::select! {
                biased;
                setup = &mut subscribe => return (setup, pending),
                command = control.recv(), if pending.is_none() => pending = Some(command),
            }
        }
    }

    /// Releases a freshly registered consumer when a command arrived during setup.
    ///
    /// Nothing reached the handler yet; closing the channel returns whatever the
    /// broker already pushed.
    async fn stop_registered(
        &self,
        channel: Channel,
        stream: DeliveryStream,
        consumer_tag: &str,
        command: Command,
    ) {
        if let Command::Close(_) = command {
            if let Err(err) = channel.cancel(consumer_tag).await {
                warn!(error = err.to_string(), consumer = self.name(), "failure to cancel consumer");
            }
        }

        drop(stream);
        channel.close().await;
        self.stop_idle(command);
    }

    /// Acquires a channel and registers the consumer on it, topology first.
    async fn subscribe(&self) -> Result<(Channel, DeliveryStream, String), AmqpError> {
        let channel = self
            .subscription
            .supervisor
            .acquire_channel(ChannelMode::Plain)
            .await?;
        let consumer_tag = format!("{}-{}", self.name(), Uuid::new_v4());

        match self.register(&channel, &consumer_tag).await {
            Ok(stream) => Ok((channel, stream, consumer_tag)),
            Err(err) => {
                channel.close().await;
                Err(err)
            }
        }
    }

    async fn register(&self, channel: &Channel, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        channel.qos(self.subscription.options.prefetch).await.map_err(|err| {
            error!(error = err.to_string(), "failure to configure qos");
            AmqpError::QoSDeclarationError(self.name().to_owned())
        })?;

        self.subscription
            .binder
            .apply(&self.subscription.binding, channel)
            .await?;

        channel.consume(&self.queue, consumer_tag).await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue.as_str(), "error to create the consumer");
            match err {
                AmqpError::ChannelLost => err,
                _ => AmqpError::ConsumerDeclarationError(self.queue.clone()),
            }
        })
    }

    /// Runs one channel session.
    ///
    /// # Returns
    /// true when the subscription has to resubscribe, false once it reached a terminal state
    async fn serve(
        &self,
        channel: Channel,
        mut stream: DeliveryStream,
        consumer_tag: &str,
        control: &mut Control,
        gate: &mut watch::Receiver<bool>,
    ) -> bool {
        let generation = channel.generation();
        let mut in_flight = InFlight::new(generation);
        let mut handlers: JoinSet<(ConsumerMessage, HandlerOutcome)> = JoinSet::new();

        self.shared.running();
        info!(consumer = self.name(), generation, queue = self.queue.as_str(), "subscription running");

        let end = loop {
            let paused = *gate.borrow_and_update();

            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Command::Close(grace) => break SessionEnd::Close(grace),
                    Command::Abort => break SessionEnd::Abort,
                },
                _ = channel.lost() => break SessionEnd::Lost,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    self.settle(&channel, &mut in_flight, joined).await;
                }
                _ = gate.changed() => {
                    debug!(consumer = self.name(), paused = *gate.borrow(), "health gate changed");
                }
                delivery = stream.next(), if !paused => match delivery {
                    Some(Ok(delivery)) => self.dispatch(&mut in_flight, &mut handlers, delivery),
                    Some(Err(err)) => {
                        warn!(error = err.to_string(), consumer = self.name(), "error receiving delivery");
                        break SessionEnd::Lost;
                    }
                    None => break SessionEnd::Lost,
                },
            }

            self.shared.in_flight.store(in_flight.len(), Ordering::Relaxed);
        };

        match end {
            SessionEnd::Lost => {
                warn!(consumer = self.name(), generation, "subscription channel lost, resubscribing");
                // results of the lost session are never resolved: the broker redelivers
                handlers.detach_all();
                self.shared.in_flight.store(0, Ordering::Relaxed);
                channel.close().await;
                true
            }
            SessionEnd::Abort => {
                self.abort(channel, handlers).await;
                false
            }
            SessionEnd::Close(grace) => {
                drop(stream);
                self.close(channel, consumer_tag, grace, in_flight, handlers, control)
                    .await;
                false
            }
        }
    }

    fn dispatch(
        &self,
        in_flight: &mut InFlight,
        handlers: &mut JoinSet<(ConsumerMessage, HandlerOutcome)>,
        delivery: InboundDelivery,
    ) {
        let msg = consumer::consumer_message(self.name(), delivery, in_flight.generation());
        in_flight.track(msg.delivery.delivery_tag);

        let handler = self.subscription.handler.clone();
        handlers.spawn(async move {
            let outcome = AssertUnwindSafe(consumer::handle(handler, &msg))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(delivery_tag = msg.delivery.delivery_tag, "handler panicked");
                    HandlerOutcome::Failure("handler panicked".to_owned())
                });
            (msg, outcome)
        });
    }

    async fn settle(&self, channel: &Channel, in_flight: &mut InFlight, joined: HandlerResult) {
        match joined {
            Ok((msg, outcome)) => {
                if let Err(err) = self.engine.resolve(channel, in_flight, &msg, &outcome).await {
                    error!(
                        error = err.to_string(),
                        consumer = self.name(),
                        delivery_tag = msg.delivery.delivery_tag,
                        "failure to resolve delivery"
                    );
                }
            }
            Err(err) => warn!(error = err.to_string(), consumer = self.name(), "handler task failed"),
        }
    }

    async fn abort(&self, channel: Channel, mut handlers: JoinSet<(ConsumerMessage, HandlerOutcome)>) {
        handlers.abort_all();
        channel.close().await;
        self.shared.in_flight.store(0, Ordering::Relaxed);
        self.shared.set_state(SubscriptionState::Aborted);
        info!(consumer = self.name(), "subscription aborted");
    }

    async fn close(
        &self,
        channel: Channel,
        consumer_tag: &str,
        grace: Duration,
        mut in_flight: InFlight,
        mut handlers: JoinSet<(ConsumerMessage, HandlerOutcome)>,
        control: &mut Control,
    ) {
        self.shared.set_state(SubscriptionState::Closing);
        info!(
            consumer = self.name(),
            in_flight = in_flight.len(),
            grace_ms = grace.as_millis() as u64,
            "closing subscription"
        );

        if let Err(err) = channel.cancel(consumer_tag).await {
            warn!(error = err.to_string(), consumer = self.name(), "failure to cancel consumer");
        }

        let deadline = Instant::now() + grace;
        while !handlers.is_empty() {
            tokio::select! {
                biased;
                command = control.recv() => {
                    if let Command::Abort = command {
                        return self.abort(channel, handlers).await;
                    }
                }
                _ = time::sleep_until(deadline) => break,
                Some(joined) = handlers.join_next() => {
                    self.settle(&channel, &mut in_flight, joined).await;
                    self.shared.in_flight.store(in_flight.len(), Ordering::Relaxed);
                }
            }
        }

        handlers.abort_all();
        let requeued = self.engine.requeue_all(&channel, &mut in_flight).await;
        if requeued > 0 {
            warn!(consumer = self.name(), requeued, "close grace period elapsed, requeued in-flight messages");
        }

        channel.close().await;
        self.shared.in_flight.store(0, Ordering::Relaxed);
        self.shared.set_state(SubscriptionState::Closed);
        info!(consumer = self.name(), "subscription closed");
    }
}

/// Control surface of a running subscription.
pub struct SubscriptionHandle {
    name: String,
    close_grace: Duration,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Deliveries handed to the handler and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// The error that aborted the subscription, if any.
    pub fn error(&self) -> Option<AmqpError> {
        self.shared.error()
    }

    /// Waits until topology and consumer registration completed once.
    ///
    /// # Returns
    /// Ok once running, or the error that stopped the subscription before that
    pub async fn wait_initialized(&self) -> Result<(), AmqpError> {
        let status = self.wait_for(|s| s.initialized || s.state.is_terminal()).await;
        match status.initialized {
            true => Ok(()),
            false => Err(self.error().unwrap_or(AmqpError::Shutdown)),
        }
    }

    /// Resolves once the subscription started closing (or already ended).
    pub async fn closing(&self) -> SubscriptionState {
        self.wait_for(|s| s.state == SubscriptionState::Closing || s.state.is_terminal())
            .await
            .state
    }

    /// Resolves once the subscription reached `Closed` or `Aborted`.
    pub async fn closed(&self) -> SubscriptionState {
        self.wait_for(|s| s.state.is_terminal()).await.state
    }

    /// Closes the subscription gracefully.
    ///
    /// The broker consumer is cancelled immediately; in-flight deliveries get up to
    /// `grace` to resolve, after which the remaining ones are requeued.
    ///
    /// # Returns
    /// The terminal state reached
    pub async fn close(&self, grace: Duration) -> SubscriptionState {
        let _ = self.commands.send(Command::Close(grace));
        self.closed().await
    }

    /// Closes with the grace period configured for the subscription.
    pub async fn close_default(&self) -> SubscriptionState {
        self.close(self.close_grace).await
    }

    /// Releases the channel immediately, without waiting for in-flight handlers.
    pub async fn abort(&self) -> SubscriptionState {
        let _ = self.commands.send(Command::Abort);
        self.closed().await
    }

    async fn wait_for<F>(&self, predicate: F) -> Status
    where
        F: FnMut(&Status) -> bool,
    {
        let mut rx = self.shared.status.subscribe();
        let status = match rx.wait_for(predicate).await {
            Ok(status) => *status,
            Err(_) => *self.shared.status.borrow(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionOptions,
        exchange::ExchangeDefinition,
        handler::handler_fn,
        memory::{BrokerEvent, MemoryBroker},
        message::OutboundMessage,
        queue::QueueDefinition,
        reporter::MockErrorReporter,
    };
    use std::future::Future;

    fn supervisor(broker: &MemoryBroker) -> ConnectionSupervisor {
        ConnectionSupervisor::connect(
            broker.transport(),
            ConnectionOptions::new(["rabbit:5672"])
                .backoff(Duration::from_millis(5), Duration::from_millis(20)),
        )
    }

    async fn within<F: Future>(fut: F) -> F::Output {
        time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    fn after_kill(journal: &[BrokerEvent]) -> Vec<BrokerEvent> {
        journal
            .iter()
            .skip_while(|e| **e != BrokerEvent::ConnectionsKilled)
            .cloned()
            .collect()
    }

    fn index_of(events: &[BrokerEvent], predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
        events.iter().position(predicate).expect("event not recorded")
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        within(async {
            while !condition() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    fn counting(seen: &Arc<AtomicUsize>, outcome: HandlerOutcome) -> Arc<dyn ConsumerHandler> {
        let seen = seen.clone();
        handler_fn(move |_msg: ConsumerMessage| {
            let seen = seen.clone();
            let outcome = outcome.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                outcome
            }
        })
    }

    fn stuck() -> Arc<dyn ConsumerHandler> {
        handler_fn(|_msg: ConsumerMessage| async {
            time::sleep(Duration::from_secs(3600)).await;
            HandlerOutcome::Success
        })
    }

    #[tokio::test]
    async fn failing_message_is_observed_ceiling_plus_one_times_then_reported() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let seen = Arc::new(AtomicUsize::new(0));

        let (reported_tx, mut reported) = mpsc::unbounded_channel();
        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|ctx| ctx.delivery.redelivery_count == 3 && ctx.error == "downstream unavailable")
            .times(1)
            .returning(move |_| {
                let _ = reported_tx.send(());
            });

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs").quorum().with_dlq()),
            counting(&seen, HandlerOutcome::Failure("downstream unavailable".to_owned())),
            SubscriptionOptions::new("jobs-worker").prefetch(1).retry_ceiling(3),
        )
        .reporter(Arc::new(reporter))
        .start();
        within(handle.wait_initialized()).await.unwrap();

        broker.inject("", "jobs", OutboundMessage::new("job-1"));
        within(reported.recv()).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(broker.ready_bodies("jobs-dlq"), vec![b"job-1".to_vec()]);
        assert!(broker.ready_bodies("jobs").is_empty());
        assert_eq!(handle.in_flight(), 0);

        assert_eq!(within(handle.close_default()).await, SubscriptionState::Closed);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn classic_queue_failures_stop_at_the_ceiling() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let seen = Arc::new(AtomicUsize::new(0));

        let (reported_tx, mut reported) = mpsc::unbounded_channel();
        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|ctx| ctx.delivery.redelivery_count == 3)
            .times(1)
            .returning(move |_| {
                let _ = reported_tx.send(());
            });

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs").with_dlq()),
            counting(&seen, HandlerOutcome::Failure("downstream unavailable".to_owned())),
            SubscriptionOptions::new("jobs-worker").prefetch(1).retry_ceiling(3),
        )
        .reporter(Arc::new(reporter))
        .start();
        within(handle.wait_initialized()).await.unwrap();

        broker.inject("", "jobs", OutboundMessage::new("job-1"));
        within(reported.recv()).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(broker.ready_bodies("jobs-dlq"), vec![b"job-1".to_vec()]);
        assert!(broker.ready_bodies("jobs").is_empty());
        assert_eq!(broker.unacked("jobs"), 0);

        assert_eq!(within(handle.close_default()).await, SubscriptionState::Closed);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn close_during_setup_releases_channel_and_consumer() {
        let broker = MemoryBroker::new();
        broker.delay_consume(Some(Duration::from_millis(200)));
        let supervisor = supervisor(&broker);

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            stuck(),
            SubscriptionOptions::new("jobs-worker"),
        )
        .start();

        eventually(|| {
            broker
                .journal()
                .iter()
                .any(|e| matches!(e, BrokerEvent::QueueDeclared { .. }))
        })
        .await;
        assert_eq!(handle.state(), SubscriptionState::Initializing);
        broker.inject("", "jobs", OutboundMessage::new("job-1"));

        assert_eq!(
            within(handle.close(Duration::from_secs(1))).await,
            SubscriptionState::Closed
        );
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.consumers("jobs"), 0);
        assert_eq!(broker.unacked("jobs"), 0);
        assert_eq!(broker.ready_bodies("jobs"), vec![b"job-1".to_vec()]);
        assert!(handle.wait_initialized().await.is_err());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn close_waits_for_handlers_that_finish_in_time() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);

        let handler = handler_fn(|_msg: ConsumerMessage| async {
            time::sleep(Duration::from_millis(50)).await;
            HandlerOutcome::Success
        });
        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            handler,
            SubscriptionOptions::new("jobs-worker"),
        )
        .start();
        within(handle.wait_initialized()).await.unwrap();

        broker.inject("", "jobs", OutboundMessage::new("job-1"));
        eventually(|| handle.in_flight() == 1).await;

        assert_eq!(
            within(handle.close(Duration::from_secs(2))).await,
            SubscriptionState::Closed
        );
        assert_eq!(handle.closing().await, SubscriptionState::Closed);

        let journal = broker.journal();
        assert!(journal.iter().any(|e| matches!(e, BrokerEvent::Acked { .. })));
        assert!(!journal.iter().any(|e| matches!(e, BrokerEvent::Nacked { .. })));
        assert!(broker.ready_bodies("jobs").is_empty());
        assert_eq!(broker.consumers("jobs"), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn close_requeues_what_is_still_in_flight_at_the_deadline() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            stuck(),
            SubscriptionOptions::new("jobs-worker"),
        )
        .start();
        within(handle.wait_initialized()).await.unwrap();

        broker.inject("", "jobs", OutboundMessage::new("job-1"));
        eventually(|| handle.in_flight() == 1).await;

        assert_eq!(
            within(handle.close(Duration::from_millis(50))).await,
            SubscriptionState::Closed
        );

        let nacks: Vec<BrokerEvent> = broker
            .journal()
            .into_iter()
            .filter(|e| matches!(e, BrokerEvent::Nacked { .. }))
            .collect();
        assert_eq!(nacks.len(), 1);
        assert!(matches!(nacks[0], BrokerEvent::Nacked { requeue: true, .. }));
        assert_eq!(broker.ready_bodies("jobs"), vec![b"job-1".to_vec()]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn abort_releases_the_channel_without_waiting() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            stuck(),
            SubscriptionOptions::new("jobs-worker"),
        )
        .start();
        within(handle.wait_initialized()).await.unwrap();

        broker.inject("", "jobs", OutboundMessage::new("job-1"));
        eventually(|| handle.in_flight() == 1).await;

        let state = time::timeout(Duration::from_secs(1), handle.abort())
            .await
            .unwrap();
        assert_eq!(state, SubscriptionState::Aborted);
        assert_eq!(broker.unacked("jobs"), 0);
        assert_eq!(broker.ready_bodies("jobs"), vec![b"job-1".to_vec()]);
        assert!(handle.error().is_none());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn paused_subscription_delivers_nothing_until_resumed() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let gate = HealthGate::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            counting(&seen, HandlerOutcome::Success),
            SubscriptionOptions::new("jobs-worker"),
        )
        .gate(&gate)
        .start();
        within(handle.wait_initialized()).await.unwrap();

        gate.pause();
        time::sleep(Duration::from_millis(50)).await;

        for n in 0..3 {
            broker.inject("", "jobs", OutboundMessage::new(format!("job-{n}")));
        }
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), SubscriptionState::Running);

        gate.resume();
        eventually(|| seen.load(Ordering::SeqCst) == 3).await;

        within(handle.close_default()).await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_reapplies_topology_before_consuming() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let seen = Arc::new(AtomicUsize::new(0));

        let binding = Binding::queue(QueueDefinition::new("order-events"))
            .with_exchange(ExchangeDefinition::new("orders").topic())
            .routing_key("orders.*");
        let handle = Subscription::new(
            &supervisor,
            binding,
            counting(&seen, HandlerOutcome::Success),
            SubscriptionOptions::new("orders-worker"),
        )
        .start();
        within(handle.wait_initialized()).await.unwrap();

        broker.kill_connections();

        eventually(|| {
            after_kill(&broker.journal())
                .iter()
                .any(|e| matches!(e, BrokerEvent::ConsumerRegistered { .. }))
        })
        .await;

        let events = after_kill(&broker.journal());
        let exchange = index_of(&events, |e| matches!(e, BrokerEvent::ExchangeDeclared { .. }));
        let queue = index_of(&events, |e| matches!(e, BrokerEvent::QueueDeclared { .. }));
        let bound = index_of(&events, |e| matches!(e, BrokerEvent::QueueBound { .. }));
        let consumer = index_of(&events, |e| matches!(e, BrokerEvent::ConsumerRegistered { .. }));
        assert!(exchange < queue && queue < bound && bound < consumer);

        assert_eq!(supervisor.generation(), 2);
        broker.inject("orders", "orders.created", OutboundMessage::new("order-1"));
        eventually(|| seen.load(Ordering::SeqCst) == 1).await;
        assert_eq!(handle.state(), SubscriptionState::Running);

        within(handle.close_default()).await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn topology_conflict_aborts_the_subscription() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);

        let channel = within(supervisor.acquire_channel(ChannelMode::Plain))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("jobs").durable())
            .await
            .unwrap();

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            stuck(),
            SubscriptionOptions::new("jobs-worker"),
        )
        .start();

        assert_eq!(
            within(handle.wait_initialized()).await,
            Err(AmqpError::TopologyConflict("jobs".to_owned()))
        );
        assert_eq!(handle.state(), SubscriptionState::Aborted);
        assert_eq!(handle.error(), Some(AmqpError::TopologyConflict("jobs".to_owned())));
        assert_eq!(broker.consumers("jobs"), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn supervisor_shutdown_ends_subscription() {
        let broker = MemoryBroker::new();
        broker.refuse_host("rabbit:5672");
        let supervisor = supervisor(&broker);

        let handle = Subscription::new(
            &supervisor,
            Binding::queue(QueueDefinition::new("jobs")),
            stuck(),
            SubscriptionOptions::new("jobs-worker"),
        )
        .start();
        assert_eq!(handle.state(), SubscriptionState::Initializing);

        supervisor.shutdown().await;
        assert_eq!(within(handle.closed()).await, SubscriptionState::Aborted);
        assert_eq!(handle.error(), Some(AmqpError::Shutdown));
    }
}
