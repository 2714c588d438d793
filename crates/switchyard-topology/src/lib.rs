//! Deployment topology for switchyard.
//!
//! A deployment descriptor (`<deployment>.idep`) lists every service with its
//! produced, consumed, RPC-client and RPC-server message declarations. This
//! crate loads that document once, validates it, and resolves logical message
//! codes into broker coordinates for a given service identity.

pub mod document;
mod error;
mod resolve;
mod store;

pub use document::{DispatchStyle, MessageDeclaration, MessageKind, TopologyDocument};
pub use error::{Result, TopologyError};
pub use resolve::{
    input_queues, resolve, Binding, MessageRoute, QueueBinding, RouteResolver, MAX_DECLARED_TIMEOUT,
};
pub use store::{ServiceEntry, TopologyStore, DESCRIPTOR_EXTENSION};
