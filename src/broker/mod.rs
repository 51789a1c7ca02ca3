// src/broker/mod.rs
// The broker operations the relay depends on. `amqp` talks to RabbitMQ
// through lapin, `memory` simulates a broker in-process.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::Result;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

pub const REPLY_CONTENT_TYPE: &str = "text/plain";

/// Invoked at most once when a connection is lost, with the broker's reason.
pub type CloseListener = Box<dyn FnOnce(String) + Send + 'static>;

/// Stream of deliveries for one consumer; ends when its channel goes away.
pub type DeliveryStream<D> = BoxStream<'static, Result<D>>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Channel: BrokerChannel;

    /// Establish a connection. Failures are transient.
    async fn dial(&self) -> Result<Self::Connection>;

    /// Open a channel on a live connection. Failures are fatal.
    async fn open_channel(&self, connection: &Self::Connection) -> Result<Self::Channel>;

    /// Register a listener fired when the connection is closed by the
    /// broker or the network. Fires immediately if it is already closed.
    fn on_close(&self, connection: &Self::Connection, listener: CloseListener);

    /// Close a connection that has been superseded. Errors are only logged.
    async fn close(&self, connection: Self::Connection);
}

#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    type Delivery: InboundDelivery;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a durable queue and return the name the broker assigned.
    async fn declare_queue(&self, name: &str) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream<Self::Delivery>>;

    /// Publish `payload` as a non-mandatory, non-immediate `text/plain` message.
    async fn publish(&self, destination: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait InboundDelivery: Send + Sync + 'static {
    fn reply_to(&self) -> Option<&str>;

    fn body(&self) -> &[u8];

    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement without requeue.
    async fn reject(&self) -> Result<()>;
}
