//! Transport traits implemented by every broker backend.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{AckMode, BrokerEndpoint, Credentials, Delivery, OutboundMessage, QueueSpec};

/// Stream of deliveries produced by [`BrokerChannel::consume`].
///
/// The stream ends when the channel or its connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Entry point of a broker backend.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Opens a new connection to the given endpoint.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live connection. Channels opened from it are independent.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    /// Closes the connection and every channel opened on it.
    ///
    /// Exclusive queues declared over this connection are deleted.
    async fn close(&self) -> Result<()>;
}

/// A channel scoped to one consumer loop or one client call.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue and returns its name, which is broker-generated for
    /// server-named specs.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Declares a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limits unacknowledged deliveries in flight for this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage)
        -> Result<()>;

    /// Closes the channel. Unacknowledged deliveries go back to their queues.
    async fn close(&self) -> Result<()>;
}

/// Settles a manually acknowledged delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}
