use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::traits::{Broker, BrokerConnection};
use crate::types::{BrokerEndpoint, Credentials};

/// Endpoint, user and a digest of the password.
type PoolKey = (BrokerEndpoint, String, u64);

fn pool_key(endpoint: &BrokerEndpoint, credentials: &Credentials) -> PoolKey {
    let mut hasher = DefaultHasher::new();
    credentials.expose_password().hash(&mut hasher);
    (
        endpoint.clone(),
        credentials.username().to_string(),
        hasher.finish(),
    )
}

/// Shares one connection per broker endpoint and credential set.
///
/// Channels are never shared; callers open their own on the returned
/// connection. Connections found closed are replaced on the next `get`.
pub struct ConnectionPool {
    broker: Arc<dyn Broker>,
    connections: DashMap<PoolKey, Arc<dyn BrokerConnection>>,
}

impl ConnectionPool {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            connections: DashMap::new(),
        }
    }

    /// The backend this pool connects through.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn get(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let key = pool_key(endpoint, credentials);

        if let Some(conn) = self.connections.get(&key) {
            if conn.is_open() {
                return Ok(Arc::clone(conn.value()));
            }
        }

        if self.connections.remove(&key).is_some() {
            debug!(endpoint = %endpoint, "replacing closed pooled connection");
        }

        let conn = self.broker.connect(endpoint, credentials).await?;
        self.connections.insert(key, Arc::clone(&conn));
        debug!(endpoint = %endpoint, user = %credentials.username(), "pooled connection opened");
        Ok(conn)
    }

    /// Number of cached connections, open or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes and forgets every pooled connection.
    pub async fn close_all(&self) {
        let keys: Vec<PoolKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                if let Err(e) = conn.close().await {
                    debug!(endpoint = %key.0, error = %e, "error closing pooled connection");
                }
                closed += 1;
            }
        }
        if closed > 0 {
            info!(count = closed, "connection pool closed");
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
