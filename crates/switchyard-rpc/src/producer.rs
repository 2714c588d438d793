//! Fire-and-forget publishing with bounded retry.

use std::sync::Arc;

use serde_json::Value;
use switchyard_broker::{
    ConnectionPool, Headers, MessageProperties, OutboundMessage, TransportError,
};
use switchyard_topology::{MessageRoute, RouteResolver};
use tracing::{debug, warn};

use crate::client::encode_request;
use crate::config::ProducerConfig;
use crate::envelope::JSON_CONTENT_TYPE;
use crate::error::{Result, RpcError};

/// Publishes messages without waiting for a reply.
#[derive(Clone)]
pub struct Producer {
    resolver: RouteResolver,
    pool: Arc<ConnectionPool>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(resolver: RouteResolver, pool: Arc<ConnectionPool>, config: ProducerConfig) -> Self {
        Self {
            resolver,
            pool,
            config,
        }
    }

    /// Resolves `code` in client mode and publishes `payload` to it.
    pub async fn publish(&self, code: &str, payload: Value, headers: Headers) -> Result<()> {
        let route = self.resolver.client(code)?;
        self.publish_route(&route, payload, headers).await
    }

    /// Publishes to an already resolved route.
    ///
    /// Retryable transport failures (lost or refused connections, closed
    /// channels) are retried `max_attempts` times in total, waiting
    /// `retry_interval` between attempts. Anything else fails at once.
    pub async fn publish_route(
        &self,
        route: &MessageRoute,
        payload: Value,
        headers: Headers,
    ) -> Result<()> {
        let body = encode_request(route.dispatch, &route.code, payload)?;
        let message = OutboundMessage::new(body).with_properties(
            MessageProperties::default()
                .with_message_type(route.code.clone())
                .with_content_type(JSON_CONTENT_TYPE)
                .with_headers(headers),
        );

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_publish(route, message.clone()).await {
                Ok(()) => {
                    debug!(
                        code = %route.code,
                        exchange = %route.exchange,
                        routing_key = %route.routing_key,
                        attempt,
                        "message published"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        code = %route.code,
                        attempt,
                        max_attempts,
                        error = %e,
                        retry_in = ?self.config.retry_interval,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => {
                    warn!(
                        code = %route.code,
                        attempt,
                        retryable = e.is_retryable(),
                        error = %e,
                        "publish failed, giving up"
                    );
                    return Err(RpcError::DeliveryFailed {
                        code: route.code.clone(),
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }

    async fn try_publish(
        &self,
        route: &MessageRoute,
        message: OutboundMessage,
    ) -> std::result::Result<(), TransportError> {
        let connection = self.pool.get(&route.endpoint, &route.credentials).await?;
        let channel = connection.open_channel().await?;
        let published = channel
            .publish(&route.exchange, &route.routing_key, message)
            .await;
        if let Err(e) = channel.close().await {
            debug!(code = %route.code, error = %e, "error closing publish channel");
        }
        published
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("service", &self.resolver.service_code())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
