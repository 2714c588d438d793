//! Single entry point for outbound messages.

use std::sync::Arc;

use serde_json::Value;
use switchyard_broker::{ConnectionPool, Headers};
use switchyard_topology::{MessageKind, RouteResolver};

use crate::client::{RpcClient, RpcResponse};
use crate::config::RpcConfig;
use crate::error::Result;
use crate::producer::Producer;

/// What [`Messenger::send`] did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The code is an RPC request and the server answered.
    Replied(RpcResponse),
    /// The code is a produced message and the broker accepted it.
    Published,
}

/// Routes a message code to a call or a publish depending on how the
/// service declares it.
#[derive(Debug, Clone)]
pub struct Messenger {
    resolver: RouteResolver,
    client: RpcClient,
    producer: Producer,
}

impl Messenger {
    pub fn new(resolver: RouteResolver, pool: Arc<ConnectionPool>, config: &RpcConfig) -> Self {
        Self {
            client: RpcClient::new(resolver.clone(), Arc::clone(&pool), config.client.clone()),
            producer: Producer::new(resolver.clone(), pool, config.producer.clone()),
            resolver,
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub async fn send(&self, code: &str, payload: Value, headers: Headers) -> Result<SendOutcome> {
        let route = self.resolver.client(code)?;
        match route.kind {
            MessageKind::RpcClient => {
                let timeout = route.timeout.unwrap_or(self.client.default_timeout());
                let response = self
                    .client
                    .call_route(&route, payload, headers, timeout)
                    .await?;
                Ok(SendOutcome::Replied(response))
            }
            _ => {
                self.producer.publish_route(&route, payload, headers).await?;
                Ok(SendOutcome::Published)
            }
        }
    }
}
