// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Guaranteed Publisher
//!
//! Publishes through a confirm-mode channel owned by a single actor task. Every
//! publish is kept as a pending entry, keyed by submission order, until the broker
//! confirms it:
//!
//! - an ack resolves the caller's completion successfully
//! - a nack, or a mandatory message returned as unroutable, resolves it with
//!   `PublishRejected` and is never retried automatically
//! - losing the channel keeps every unconfirmed entry; once a new channel is acquired
//!   and the topology reinstalled they are re-published in submission order
//!
//! The last point makes publishing at-least-once: a message whose confirm was lost in
//! transit reaches the broker twice. The number of unconfirmed publishes is bounded;
//! `publish` suspends while the bound is reached.

use crate::{
    channel::{Channel, ChannelMode},
    config::PublisherOptions,
    connection::ConnectionSupervisor,
    errors::AmqpError,
    message::OutboundMessage,
    otel,
    serializer::Serializer,
    topology::{Binding, Topology, TopologyBinder},
    transport::Confirmation,
};
use futures_util::{
    future::BoxFuture,
    stream::{FuturesOrdered, Stream},
    FutureExt, StreamExt,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, Poll},
};
use tokio::{
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

type ConfirmResult = (u64, Result<Confirmation, AmqpError>);

/// Completion of one publish; resolves once the broker confirmed (or rejected) it.
///
/// If the publisher shuts down first, the completion resolves with `Shutdown`.
#[derive(Debug)]
pub struct PublishCompletion {
    message_id: String,
    rx: oneshot::Receiver<Result<(), AmqpError>>,
}

impl PublishCompletion {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for PublishCompletion {
    type Output = Result<(), AmqpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(AmqpError::Shutdown)))
    }
}

struct Submission {
    message: OutboundMessage,
    binding: Binding,
    completion: oneshot::Sender<Result<(), AmqpError>>,
    permit: OwnedSemaphorePermit,
}

enum Command {
    Publish(Submission),
    Shutdown(oneshot::Sender<()>),
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
    completion: oneshot::Sender<Result<(), AmqpError>>,
    _permit: OwnedSemaphorePermit,
}

/// A confirm-mode channel and the publishes issued on it, keyed by sequence.
struct Session {
    channel: Channel,
    next_sequence: u64,
    sequences: BTreeMap<u64, u64>,
    confirms: FuturesOrdered<BoxFuture<'static, ConfirmResult>>,
}

impl Session {
    fn new(channel: Channel) -> Self {
        Session {
            channel,
            next_sequence: 0,
            sequences: BTreeMap::new(),
            confirms: FuturesOrdered::new(),
        }
    }

    async fn submit(&mut self, id: u64, pending: &PendingPublish) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .publish(&pending.exchange, &pending.routing_key, &pending.message)
            .await?;

        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.sequences.insert(sequence, id);
        self.confirms
            .push_back(async move { (sequence, confirm.await) }.boxed());
        Ok(())
    }
}

enum Step {
    Command(Option<Command>),
    Acquired(Result<Channel, AmqpError>),
    Lost,
    Confirmed(u64, Result<Confirmation, AmqpError>),
}

struct Actor {
    supervisor: ConnectionSupervisor,
    binder: TopologyBinder,
    topology: Topology,
    pending: BTreeMap<u64, PendingPublish>,
    next_id: u64,
    failures: u32,
    permits: Arc<Semaphore>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut session: Option<Session> = None;

        loop {
            let step = match session.as_mut() {
                None => tokio::select! {
                    biased;
                    command = commands.recv() => Step::Command(command),
                    channel = self.supervisor.acquire_channel(ChannelMode::Confirm) => Step::Acquired(channel),
                },
                Some(active) => tokio::select! {
                    biased;
                    command = commands.recv() => Step::Command(command),
                    _ = active.channel.lost() => Step::Lost,
                    Some((sequence, result)) = active.confirms.next(), if !active.confirms.is_empty() => {
                        Step::Confirmed(sequence, result)
                    }
                },
            };

            match step {
                Step::Command(Some(Command::Publish(submission))) => {
                    self.accept(submission, &mut session).await
                }
                Step::Command(Some(Command::Shutdown(done))) => {
                    self.stop(session.take()).await;
                    let _ = done.send(());
                    return;
                }
                Step::Command(None) => return self.stop(session.take()).await,
                Step::Acquired(Ok(channel)) => session = self.open(channel).await,
                Step::Acquired(Err(err)) => {
                    info!(error = err.to_string(), "connection shut down, stopping publisher");
                    return self.stop(None).await;
                }
                Step::Lost => self.lose(&mut session).await,
                Step::Confirmed(sequence, result) => self.confirm(sequence, result, &mut session).await,
            }
        }
    }

    /// Registers a publish and issues it when a channel is available.
    async fn accept(&mut self, submission: Submission, session: &mut Option<Session>) {
        let Submission {
            message,
            binding,
            completion,
            permit,
        } = submission;

        if !self.topology.contains(&binding) {
            if let Some(channel) = session.as_ref().map(|active| &active.channel) {
                match self.binder.apply(&binding, channel).await {
                    Ok(_) => {}
                    Err(err) if err.is_configuration() => {
                        error!(error = err.to_string(), "topology conflict, rejecting publish");
                        let _ = completion.send(Err(err));
                        return self.lose(session).await;
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), "failure to apply publish topology");
                        self.lose(session).await;
                    }
                }
            }
            self.topology.insert(&binding);
        }

        let (exchange, routing_key) = binding.route(self.binder.default_exchange());
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingPublish {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message,
                completion,
                _permit: permit,
            },
        );

        let Some(active) = session.as_mut() else {
            debug!(id, "no channel available, publish queued");
            return;
        };

        if let Some(pending) = self.pending.get(&id) {
            if let Err(err) = active.submit(id, pending).await {
                warn!(error = err.to_string(), "error publishing message, will resubmit");
                self.lose(session).await;
            }
        }
    }

    /// Installs the topology on a fresh channel and re-publishes what is unconfirmed.
    async fn open(&mut self, channel: Channel) -> Option<Session> {
        let generation = channel.generation();
        let mut session = Session::new(channel);

        if let Err(err) = self.topology.install(&self.binder, &session.channel).await {
            session.channel.close().await;

            if err.is_configuration() {
                error!(error = err.to_string(), "topology conflict, rejecting pending publishes");
                for (_, pending) in std::mem::take(&mut self.pending) {
                    let _ = pending.completion.send(Err(err.clone()));
                }
                self.topology = Topology::new();
                return None;
            }

            let delay = self.supervisor.backoff(self.failures);
            self.failures = self.failures.saturating_add(1);
            warn!(
                error = err.to_string(),
                delay_ms = delay.as_millis() as u64,
                "failure to install publish topology"
            );
            time::sleep(delay).await;
            return None;
        }

        self.failures = 0;
        if !self.pending.is_empty() {
            info!(
                generation,
                count = self.pending.len(),
                "resubmitting unconfirmed publishes"
            );
        }

        for (id, pending) in &self.pending {
            if let Err(err) = session.submit(*id, pending).await {
                warn!(error = err.to_string(), generation, "failure to resubmit publishes");
                session.channel.close().await;
                return None;
            }
        }

        debug!(generation, "publisher channel ready");
        Some(session)
    }

    async fn confirm(
        &mut self,
        sequence: u64,
        result: Result<Confirmation, AmqpError>,
        session: &mut Option<Session>,
    ) {
        let Some(id) = session
            .as_mut()
            .and_then(|active| active.sequences.remove(&sequence))
        else {
            return;
        };

        match result {
            Ok(Confirmation::Ack) => self.resolve(id, Ok(())),
            Ok(Confirmation::Nack) => self.reject(id, "nacked by the broker"),
            Ok(Confirmation::Returned) => self.reject(id, "returned as unroutable"),
            Err(err) => {
                warn!(error = err.to_string(), sequence, "confirm lost, will resubmit");
                self.lose(session).await;
            }
        }
    }

    fn reject(&mut self, id: u64, reason: &str) {
        let detail = match self.pending.get(&id) {
            Some(pending) => format!(
                "{} `{}` {}",
                pending.exchange, pending.routing_key, reason
            ),
            None => reason.to_owned(),
        };
        warn!(id, "{}", detail);
        self.resolve(id, Err(AmqpError::PublishRejected(detail)));
    }

    /// Resolves and forgets a pending publish, releasing its capacity.
    fn resolve(&mut self, id: u64, result: Result<(), AmqpError>) {
        if let Some(pending) = self.pending.remove(&id) {
            let _ = pending.completion.send(result);
        }
    }

    async fn lose(&mut self, session: &mut Option<Session>) {
        if let Some(active) = session.take() {
            warn!(
                generation = active.channel.generation(),
                unconfirmed = active.sequences.len(),
                "publisher channel lost"
            );
            active.channel.close().await;
        }
    }

    async fn stop(&mut self, session: Option<Session>) {
        self.permits.close();
        if let Some(active) = session {
            active.channel.close().await;
        }

        let abandoned = self.pending.len();
        self.pending.clear();
        info!(abandoned, "publisher stopped");
    }
}

/// Confirmation-gated publisher.
pub struct GuaranteedPublisher {
    commands: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    default_exchange: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GuaranteedPublisher {
    /// Starts a publisher on `supervisor`.
    ///
    /// # Parameters
    /// * `supervisor` - Connection the confirm channels are acquired from
    /// * `options` - In-flight bound and default exchange
    ///
    /// # Returns
    /// A new GuaranteedPublisher instance
    pub fn new(supervisor: &ConnectionSupervisor, options: PublisherOptions) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(options.max_in_flight));

        let actor = Actor {
            supervisor: supervisor.clone(),
            binder: TopologyBinder::new(&options.default_exchange),
            topology: Topology::new(),
            pending: BTreeMap::new(),
            next_id: 0,
            failures: 0,
            permits: permits.clone(),
        };
        let task = tokio::spawn(actor.run(rx));

        GuaranteedPublisher {
            commands,
            permits,
            max_in_flight: options.max_in_flight,
            default_exchange: options.default_exchange,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn default_exchange(&self) -> &str {
        &self.default_exchange
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Publishes accepted and not yet confirmed.
    pub fn in_flight(&self) -> usize {
        match self.permits.is_closed() {
            true => 0,
            false => self.max_in_flight - self.permits.available_permits(),
        }
    }

    /// Publishes `message` to the destination described by `binding`.
    ///
    /// The binding's topology is declared before the first publish that uses it and
    /// after every reconnect. Suspends while the in-flight bound is reached. The trace
    /// context of the caller is injected into the headers and a message id is assigned
    /// when the message has none.
    ///
    /// # Parameters
    /// * `message` - The message to publish
    /// * `binding` - Destination; published to its exchange, or to the default exchange
    ///
    /// # Returns
    /// The completion handle, or Shutdown once the publisher stopped
    pub async fn publish(
        &self,
        mut message: OutboundMessage,
        binding: &Binding,
    ) -> Result<PublishCompletion, AmqpError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AmqpError::Shutdown)?;

        message.ensure_message_id();
        otel::inject(&Context::current(), &mut message.properties.headers);
        let message_id = message.properties.message_id.clone().unwrap_or_default();

        let (completion, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish(Submission {
                message,
                binding: binding.clone(),
                completion,
                permit,
            }))
            .map_err(|_| AmqpError::Shutdown)?;

        Ok(PublishCompletion { message_id, rx })
    }

    /// Encodes `value` with `serializer` and publishes it.
    pub async fn publish_value<S, T>(
        &self,
        serializer: &S,
        value: &T,
        binding: &Binding,
    ) -> Result<PublishCompletion, AmqpError>
    where
        S: Serializer,
        T: Serialize,
    {
        let (body, content_type) = serializer.encode(value)?;
        self.publish(OutboundMessage::new(body).content_type(&content_type), binding)
            .await
    }

    /// Publishes every message in order, subject to the same backpressure.
    pub async fn publish_batch<I>(
        &self,
        messages: I,
        binding: &Binding,
    ) -> Result<Vec<PublishCompletion>, AmqpError>
    where
        I: IntoIterator<Item = OutboundMessage>,
    {
        let mut completions = vec![];
        for message in messages {
            completions.push(self.publish(message, binding).await?);
        }
        Ok(completions)
    }

    /// Publishes every message yielded by `messages` until it ends.
    pub async fn publish_stream<St>(
        &self,
        messages: St,
        binding: &Binding,
    ) -> Result<Vec<PublishCompletion>, AmqpError>
    where
        St: Stream<Item = OutboundMessage>,
    {
        let mut messages = std::pin::pin!(messages);
        let mut completions = vec![];
        while let Some(message) = messages.next().await {
            completions.push(self.publish(message, binding).await?);
        }
        Ok(completions)
    }

    /// Stops the publisher.
    ///
    /// Completions still pending resolve with `Shutdown`; later publishes fail with it.
    pub async fn shutdown(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).is_ok() {
            let _ = ack.await;
        }

        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "publisher task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionOptions,
        exchange::ExchangeDefinition,
        memory::{BrokerEvent, MemoryBroker},
        queue::QueueDefinition,
        serializer::{JsonSerializer, JSON_CONTENT_TYPE},
    };
    use std::time::Duration;

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

    async fn eventually<F: Fn() -> bool>(condition: F) {
        within(async {
            while !condition() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    fn numbers() -> Binding {
        Binding::queue(QueueDefinition::new("numbers"))
    }

    fn published_ids(broker: &MemoryBroker) -> Vec<Option<String>> {
        broker
            .journal()
            .into_iter()
            .filter_map(|e| match e {
                BrokerEvent::Published { message_id, .. } => Some(message_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn confirms_every_publish_in_submission_order() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let publisher = GuaranteedPublisher::new(&supervisor, PublisherOptions::default());

        let completions = publisher
            .publish_batch((0..16).map(|n| OutboundMessage::new(n.to_string())), &numbers())
            .await
            .unwrap();

        let mut resolved = FuturesOrdered::new();
        for completion in completions {
            resolved.push_back(completion);
        }
        let results: Vec<Result<(), AmqpError>> = within(resolved.collect()).await;
        assert_eq!(results.len(), 16);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(publisher.in_flight(), 0);

        let channel = within(supervisor.acquire_channel(ChannelMode::Plain))
            .await
            .unwrap();
        let mut consumer = channel.consume("numbers", "checker").await.unwrap();
        for n in 0..16 {
            let delivery = within(consumer.next()).await.unwrap().unwrap();
            assert_eq!(delivery.body, n.to_string().into_bytes());
            assert!(delivery.properties.message_id.is_some());
        }

        publisher.shutdown().await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn resubmits_unconfirmed_publishes_in_order_after_reconnect() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let publisher = GuaranteedPublisher::new(&supervisor, PublisherOptions::default());

        broker.hold_confirms(true);
        let completions = publisher
            .publish_batch((0..5).map(|n| OutboundMessage::new(n.to_string())), &numbers())
            .await
            .unwrap();
        eventually(|| broker.published() == 5).await;
        assert_eq!(publisher.in_flight(), 5);

        broker.hold_confirms(false);
        broker.kill_connections();

        for completion in completions {
            assert_eq!(within(completion).await, Ok(()));
        }

        assert!(broker.published() >= 10);
        let ids = published_ids(&broker);
        assert_eq!(&ids[..5], &ids[5..10]);
        // the first attempts reached the queue too: at-least-once
        assert_eq!(broker.ready_bodies("numbers").len(), 10);
        assert_eq!(supervisor.generation(), 2);

        // the topology is back in place before anything is resubmitted
        let reconnected: Vec<BrokerEvent> = broker
            .journal()
            .into_iter()
            .skip_while(|e| *e != BrokerEvent::ConnectionsKilled)
            .collect();
        let declared = reconnected
            .iter()
            .position(|e| *e == BrokerEvent::QueueDeclared { name: "numbers".to_owned() })
            .expect("queue not declared after reconnect");
        let resubmitted = reconnected
            .iter()
            .position(|e| matches!(e, BrokerEvent::Published { .. }))
            .expect("nothing resubmitted");
        assert!(declared < resubmitted);

        publisher.shutdown().await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn broker_rejections_surface_without_retry() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let publisher = GuaranteedPublisher::new(&supervisor, PublisherOptions::default());

        let audit = Binding::exchange(ExchangeDefinition::new("audit").fanout());
        let unroutable = publisher
            .publish(OutboundMessage::new("lost").mandatory(), &audit)
            .await
            .unwrap();
        assert!(matches!(
            within(unroutable).await,
            Err(AmqpError::PublishRejected(_))
        ));

        broker.reject_publishes(true);
        let nacked = publisher
            .publish(OutboundMessage::new("refused"), &numbers())
            .await
            .unwrap();
        assert!(matches!(
            within(nacked).await,
            Err(AmqpError::PublishRejected(_))
        ));
        assert_eq!(broker.published(), 2);

        publisher.shutdown().await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn publish_suspends_while_in_flight_bound_is_reached() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let publisher = GuaranteedPublisher::new(
            &supervisor,
            PublisherOptions::default().max_in_flight(2),
        );

        broker.hold_confirms(true);
        let first = publisher.publish(OutboundMessage::new("1"), &numbers()).await.unwrap();
        let second = publisher.publish(OutboundMessage::new("2"), &numbers()).await.unwrap();
        assert_eq!(publisher.in_flight(), 2);

        let blocked = time::timeout(
            Duration::from_millis(50),
            publisher.publish(OutboundMessage::new("3"), &numbers()),
        )
        .await;
        assert!(blocked.is_err());

        eventually(|| broker.published() == 2).await;
        broker.hold_confirms(false);
        broker.release_confirms();
        assert_eq!(within(first).await, Ok(()));
        assert_eq!(within(second).await, Ok(()));

        let third = within(publisher.publish(OutboundMessage::new("3"), &numbers()))
            .await
            .unwrap();
        assert_eq!(within(third).await, Ok(()));

        publisher.shutdown().await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_pending_completions() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let publisher = GuaranteedPublisher::new(&supervisor, PublisherOptions::default());

        broker.hold_confirms(true);
        let pending = publisher
            .publish_value(&JsonSerializer, &serde_json::json!({"id": 1}), &numbers())
            .await
            .unwrap();
        eventually(|| broker.published() == 1).await;

        publisher.shutdown().await;
        assert_eq!(within(pending).await, Err(AmqpError::Shutdown));
        assert_eq!(publisher.in_flight(), 0);
        assert_eq!(
            publisher
                .publish(OutboundMessage::new("late"), &numbers())
                .await
                .err(),
            Some(AmqpError::Shutdown)
        );

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn encoded_values_carry_content_type() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let publisher = GuaranteedPublisher::new(&supervisor, PublisherOptions::default());

        let completions = publisher
            .publish_stream(
                futures_util::stream::iter(vec![OutboundMessage::new("a"), OutboundMessage::new("b")]),
                &numbers(),
            )
            .await
            .unwrap();
        for completion in completions {
            assert_eq!(within(completion).await, Ok(()));
        }

        let completion = publisher
            .publish_value(&JsonSerializer, &serde_json::json!({"id": 7}), &numbers())
            .await
            .unwrap();
        assert!(!completion.message_id().is_empty());
        assert_eq!(within(completion).await, Ok(()));

        let channel = within(supervisor.acquire_channel(ChannelMode::Plain))
            .await
            .unwrap();
        let mut consumer = channel.consume("numbers", "checker").await.unwrap();
        let bodies: Vec<_> = within(consumer.by_ref().take(3).collect::<Vec<_>>()).await;
        let last = bodies[2].clone().unwrap();
        assert_eq!(last.body, br#"{"id":7}"#.to_vec());
        assert_eq!(last.properties.content_type.as_deref(), Some(JSON_CONTENT_TYPE));

        publisher.shutdown().await;
        supervisor.shutdown().await;
    }
}
