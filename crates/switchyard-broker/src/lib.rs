//! Broker transport for switchyard.
//!
//! This crate provides the AMQP plumbing used by the RPC layer:
//!
//! - **Traits**: [`Broker`], [`BrokerConnection`] and [`BrokerChannel`] model
//!   AMQP 0-9-1 connections, channels, queues and publish/consume
//! - **Backends**: a lapin-based [`AmqpBroker`] and an in-process
//!   [`MemoryBroker`] with the same routing semantics
//! - **Pooling**: [`ConnectionPool`] shares connections per broker endpoint

mod config;
mod error;
mod pool;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "amqp")]
mod amqp;

pub use config::BrokerConfig;
pub use error::{Result, TransportError};
pub use pool::ConnectionPool;
pub use traits::{Acknowledger, Broker, BrokerChannel, BrokerConnection, DeliveryStream};
pub use types::{
    AckMode, BrokerEndpoint, Credentials, Delivery, Headers, MessageProperties, OutboundMessage,
    QueueSpec,
};

#[cfg(feature = "memory")]
pub use memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
