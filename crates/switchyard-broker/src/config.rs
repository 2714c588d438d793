use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Result, TransportError};
use crate::traits::Broker;

#[cfg(feature = "amqp")]
use crate::amqp::AmqpBroker;

#[cfg(feature = "memory")]
use crate::memory::MemoryBroker;

/// Broker backend selection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BrokerConfig {
    /// A real AMQP 0-9-1 broker reached over the network.
    Amqp {
        /// Connection name reported to the broker's management UI.
        #[serde(default = "default_connection_name")]
        connection_name: String,
    },
    /// An in-process broker. Only useful when client and server share a process.
    Memory,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::Amqp {
            connection_name: default_connection_name(),
        }
    }
}

impl BrokerConfig {
    /// Returns the backend name as it appears in configuration.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Amqp { .. } => "amqp",
            Self::Memory => "memory",
        }
    }

    /// Instantiates the configured backend.
    pub fn build(&self) -> Result<Arc<dyn Broker>> {
        match self {
            #[cfg(feature = "amqp")]
            Self::Amqp { connection_name } => {
                Ok(Arc::new(AmqpBroker::new().with_connection_name(connection_name.clone())))
            }

            #[cfg(feature = "memory")]
            Self::Memory => Ok(Arc::new(MemoryBroker::new())),

            #[allow(unreachable_patterns)]
            other => Err(TransportError::UnsupportedBackend(format!(
                "{} backend is not enabled in this build",
                other.backend_name()
            ))),
        }
    }
}

fn default_connection_name() -> String {
    "switchyard".to_string()
}
