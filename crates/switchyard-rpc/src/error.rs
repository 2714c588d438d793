use std::time::Duration;

use switchyard_broker::TransportError;
use switchyard_topology::TopologyError;
use thiserror::Error;

use crate::envelope::ErrorKind;

/// Errors surfaced to callers of the client, producer and messenger.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The topology does not allow this call. Never retried.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No matching reply arrived before the deadline.
    #[error("No reply to '{code}' within {after:?}")]
    Timeout { code: String, after: Duration },

    /// The server replied with an explicit error.
    #[error("Remote {kind} (status {status}): {message}")]
    Remote {
        kind: ErrorKind,
        message: String,
        status: u16,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Every publish attempt failed.
    #[error("Delivery of '{code}' failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        code: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

impl RpcError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the remote error kind if the server answered with an error.
    pub const fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
