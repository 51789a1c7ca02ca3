// src/broker/memory.rs

//! In-process broker.
//!
//! Simulates the parts of RabbitMQ the relay touches: connections that can be
//! dropped, topic exchanges, durable queues and bindings, manual-ack
//! consumers, and published replies. Failures can be injected for dialing,
//! channel opening and publishing so the reconnect and retry paths can be
//! exercised without a running broker.
//!
//! Unacknowledged deliveries are not redelivered when a connection drops.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use uuid::Uuid;

use super::{BrokerChannel, CloseListener, Connector, DeliveryStream, InboundDelivery, REPLY_CONTENT_TYPE};
use crate::errors::{RelayError, Result};

/// A reply recorded by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub connection_id: u64,
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Rejected { requeue: bool },
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    next_connection_id: u64,
    next_delivery_tag: u64,
    dial_attempts: u32,
    failing_dials: u32,
    failing_channel_open: bool,
    failing_publishes: u32,
    connections: HashMap<u64, ConnectionState>,
    exchanges: BTreeSet<String>,
    queues: HashMap<String, VecDeque<MemoryDelivery>>,
    bindings: BTreeSet<(String, String, String)>,
    consumers: Vec<ConsumerState>,
    published: Vec<PublishedMessage>,
    outcomes: HashMap<u64, Outcome>,
}

struct ConnectionState {
    open: bool,
    listeners: Vec<CloseListener>,
}

struct ConsumerState {
    connection_id: u64,
    queue: String,
    tag: String,
    sender: UnboundedSender<Result<MemoryDelivery>>,
}

impl State {
    fn is_open(&self, connection_id: u64) -> bool {
        self.connections
            .get(&connection_id)
            .map_or(false, |connection| connection.open)
    }

    // Marks the connection closed and ends its consumer streams. Returns the
    // close listeners so they can run without the lock held.
    fn shut(&mut self, connection_id: u64) -> Vec<CloseListener> {
        self.consumers
            .retain(|consumer| consumer.connection_id != connection_id);
        match self.connections.get_mut(&connection_id) {
            Some(connection) if connection.open => {
                connection.open = false;
                std::mem::take(&mut connection.listeners)
            }
            _ => Vec::new(),
        }
    }

    fn enqueue(&mut self, mut delivery: MemoryDelivery, queue: &str) {
        let consumer = self.consumers.iter().position(|consumer| {
            consumer.queue == queue && !consumer.sender.is_closed()
        });

        match consumer {
            Some(index) => {
                delivery.connection_id = Some(self.consumers[index].connection_id);
                if let Err(rejected) = self.consumers[index].sender.unbounded_send(Ok(delivery)) {
                    if let Ok(mut delivery) = rejected.into_inner() {
                        delivery.connection_id = None;
                        self.queues.entry(queue.to_string()).or_default().push_back(delivery);
                    }
                }
            }
            None => {
                self.queues.entry(queue.to_string()).or_default().push_back(delivery);
            }
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` dial attempts fail.
    pub fn fail_next_dials(&self, count: u32) {
        self.state().failing_dials = count;
    }

    pub fn fail_channel_open(&self, fail: bool) {
        self.state().failing_channel_open = fail;
    }

    /// The next `count` publishes fail without closing the channel.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().failing_publishes = count;
    }

    pub fn dial_attempts(&self) -> u32 {
        self.state().dial_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .values()
            .filter(|connection| connection.open)
            .count()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.state()
            .consumers
            .iter()
            .map(|consumer| consumer.tag.clone())
            .collect()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state().bindings.contains(&(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ))
    }

    /// Simulate the broker or network dropping every open connection.
    pub fn drop_connections(&self) {
        let listeners: Vec<CloseListener> = {
            let mut state = self.state();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, connection)| connection.open)
                .map(|(id, _)| *id)
                .collect();
            open.into_iter().flat_map(|id| state.shut(id)).collect()
        };

        debug!(listeners = listeners.len(), "memory broker dropping connections");
        for listener in listeners {
            listener("CONNECTION_FORCED - broker forced connection closure".to_string());
        }
        self.inner.changed.notify_waiters();
    }

    /// Put a message straight onto `queue`. Returns its delivery tag.
    pub fn deliver(&self, queue: &str, reply_to: Option<&str>, body: &[u8]) -> u64 {
        let tag = {
            let mut state = self.state();
            state.next_delivery_tag += 1;
            let tag = state.next_delivery_tag;
            let delivery = MemoryDelivery {
                tag,
                reply_to: reply_to.map(str::to_string),
                body: body.to_vec(),
                connection_id: None,
                broker: self.clone(),
            };
            state.enqueue(delivery, queue);
            tag
        };
        self.inner.changed.notify_waiters();
        tag
    }

    /// Publish a message to a topic exchange, routing it through the bindings.
    /// Returns the delivery tags of the copies that reached a queue.
    pub fn publish_query(
        &self,
        exchange: &str,
        routing_key: &str,
        reply_to: Option<&str>,
        body: &[u8],
    ) -> Vec<u64> {
        let queues: Vec<String> = self
            .state()
            .bindings
            .iter()
            .filter(|(_, bound_exchange, pattern)| {
                bound_exchange == exchange && topic_matches(pattern, routing_key)
            })
            .map(|(queue, _, _)| queue.clone())
            .collect();

        queues
            .iter()
            .map(|queue| self.deliver(queue, reply_to, body))
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn outcome(&self, delivery_tag: u64) -> Option<Outcome> {
        self.state().outcomes.get(&delivery_tag).copied()
    }

    /// Wait until at least `count` replies have been published, or `within` elapses.
    pub async fn wait_for_published(&self, count: usize, within: Duration) -> Vec<PublishedMessage> {
        self.wait_until(within, |state| state.published.len() >= count)
            .await;
        self.published()
    }

    pub async fn wait_for_outcome(&self, delivery_tag: u64, within: Duration) -> Option<Outcome> {
        self.wait_until(within, |state| state.outcomes.contains_key(&delivery_tag))
            .await;
        self.outcome(delivery_tag)
    }

    pub async fn wait_for_consumers(&self, queue: &str, count: usize, within: Duration) -> bool {
        self.wait_until(within, |state| {
            state
                .consumers
                .iter()
                .filter(|consumer| consumer.queue == queue && !consumer.sender.is_closed())
                .count()
                >= count
        })
        .await
    }

    async fn wait_until<F>(&self, within: Duration, mut done: F) -> bool
    where
        F: FnMut(&State) -> bool,
    {
        let deadline = Instant::now() + within;
        loop {
            let notified = self.inner.changed.notified();
            if done(&*self.state()) {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return done(&*self.state());
            }
        }
    }

    fn record_outcome(&self, connection_id: Option<u64>, tag: u64, outcome: Outcome) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(id) = connection_id {
                if !state.is_open(id) {
                    return Err(RelayError::Ack(format!(
                        "channel closed before delivery {} was settled",
                        tag
                    )));
                }
            }
            state.outcomes.insert(tag, outcome);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryConnection {
    id: u64,
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;
    type Channel = MemoryChannel;

    async fn dial(&self) -> Result<MemoryConnection> {
        let connection = {
            let mut state = self.state();
            state.dial_attempts += 1;
            if state.failing_dials > 0 {
                state.failing_dials -= 1;
                return Err(RelayError::Dial("connection refused".to_string()));
            }
            state.next_connection_id += 1;
            let id = state.next_connection_id;
            state.connections.insert(
                id,
                ConnectionState {
                    open: true,
                    listeners: Vec::new(),
                },
            );
            MemoryConnection { id }
        };
        self.inner.changed.notify_waiters();
        Ok(connection)
    }

    async fn open_channel(&self, connection: &MemoryConnection) -> Result<MemoryChannel> {
        let state = self.state();
        if state.failing_channel_open {
            return Err(RelayError::ChannelOpen("ACCESS_REFUSED - vhost not permitted".to_string()));
        }
        if !state.is_open(connection.id) {
            return Err(RelayError::ChannelOpen("connection is closed".to_string()));
        }
        Ok(MemoryChannel {
            broker: self.clone(),
            connection_id: connection.id,
        })
    }

    fn on_close(&self, connection: &MemoryConnection, listener: CloseListener) {
        let mut state = self.state();
        match state.connections.get_mut(&connection.id) {
            Some(registered) if registered.open => registered.listeners.push(listener),
            _ => {
                drop(state);
                listener("connection already closed".to_string());
            }
        }
    }

    async fn close(&self, connection: MemoryConnection) {
        // A client-initiated close does not notify the close listeners.
        let _ = self.state().shut(connection.id);
        self.inner.changed.notify_waiters();
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl MemoryChannel {
    fn ensure_open(&self) -> std::result::Result<(), String> {
        if self.broker.state().is_open(self.connection_id) {
            Ok(())
        } else {
            Err(format!("channel on connection {} is closed", self.connection_id))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open().map_err(|reason| RelayError::Topology {
            artifact: format!("exchange '{}'", name),
            reason,
        })?;
        self.broker.state().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        self.ensure_open().map_err(|reason| RelayError::Topology {
            artifact: format!("queue '{}'", name),
            reason,
        })?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        self.broker.state().queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let artifact = format!("binding '{}' -> '{}' ({})", exchange, queue, routing_key);
        self.ensure_open().map_err(|reason| RelayError::Topology {
            artifact: artifact.clone(),
            reason,
        })?;

        let mut state = self.broker.state();
        if !state.exchanges.contains(exchange) || !state.queues.contains_key(queue) {
            return Err(RelayError::Topology {
                artifact,
                reason: "NOT_FOUND - exchange or queue does not exist".to_string(),
            });
        }
        state.bindings.insert((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream<MemoryDelivery>> {
        let receiver = {
            let mut state = self.broker.state();
            if !state.is_open(self.connection_id) {
                return Err(RelayError::Consume("channel is closed".to_string()));
            }
            let Some(backlog) = state.queues.get_mut(queue) else {
                return Err(RelayError::Consume(format!("NOT_FOUND - no queue '{}'", queue)));
            };
            let backlog: Vec<MemoryDelivery> = backlog.drain(..).collect();

            let (sender, receiver) = unbounded();
            for mut delivery in backlog {
                delivery.connection_id = Some(self.connection_id);
                let _ = sender.unbounded_send(Ok(delivery));
            }
            state.consumers.push(ConsumerState {
                connection_id: self.connection_id,
                queue: queue.to_string(),
                tag: consumer_tag.to_string(),
                sender,
            });
            receiver
        };
        self.broker.inner.changed.notify_waiters();
        Ok(receiver.boxed())
    }

    async fn publish(&self, destination: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        {
            let mut state = self.broker.state();
            if !state.is_open(self.connection_id) {
                return Err(RelayError::Publish("channel is closed".to_string()));
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(RelayError::Publish("connection reset by peer".to_string()));
            }
            state.published.push(PublishedMessage {
                exchange: destination.to_string(),
                routing_key: routing_key.to_string(),
                content_type: REPLY_CONTENT_TYPE.to_string(),
                body: payload.to_vec(),
                connection_id: self.connection_id,
            });
        }
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().is_open(self.connection_id)
    }
}

pub struct MemoryDelivery {
    tag: u64,
    reply_to: Option<String>,
    body: Vec<u8>,
    // connection of the consumer it was handed to
    connection_id: Option<u64>,
    broker: MemoryBroker,
}

impl MemoryDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.tag
    }
}

#[async_trait]
impl InboundDelivery for MemoryDelivery {
    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self) -> Result<()> {
        self.broker
            .record_outcome(self.connection_id, self.tag, Outcome::Acked)
    }

    async fn reject(&self) -> Result<()> {
        self.broker
            .record_outcome(self.connection_id, self.tag, Outcome::Rejected { requeue: false })
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => matches_words(rest, key_rest),
            _ => false,
        },
    }
}
