//! Outbound request/response calls.
//!
//! Every call owns a channel and a server-named reply queue for its whole
//! lifetime. The request carries the reply queue in `reply-to` and a fresh
//! UUID in `correlation-id`; only a reply echoing that UUID completes the
//! call.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use switchyard_broker::{
    AckMode, BrokerChannel, BrokerConnection, ConnectionPool, Delivery, DeliveryStream, Headers,
    MessageProperties, OutboundMessage, QueueSpec, TransportError,
};
use switchyard_topology::{DispatchStyle, MessageRoute, RouteResolver};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ClientConfig;
use crate::envelope::{
    CorrelationId, ReplyBody, RequestEnvelope, DEFAULT_STATUS, JSON_CONTENT_TYPE,
    STATUS_CODE_HEADER,
};
use crate::error::{Result, RpcError};

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub body: Value,
    /// From the `StatusCode` reply header, 200 when absent.
    pub status: u16,
    pub headers: Headers,
    pub correlation_id: CorrelationId,
}

/// Serializes a request body for the route's dispatch style.
pub(crate) fn encode_request(
    dispatch: DispatchStyle,
    code: &str,
    payload: Value,
) -> Result<Vec<u8>> {
    let body = match dispatch {
        DispatchStyle::Queue => serde_json::to_vec(&payload)?,
        DispatchStyle::Envelope => serde_json::to_vec(&RequestEnvelope {
            message_code: code.to_string(),
            payload,
        })?,
    };
    Ok(body)
}

/// Reads the `StatusCode` header, if present and numeric.
pub(crate) fn status_header(headers: &Headers) -> Option<u16> {
    headers
        .get(STATUS_CODE_HEADER)
        .and_then(|s| s.trim().parse().ok())
}

/// Stand-in for "no deadline" when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Instant `timeout` from now, saturating instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// In-flight state of one call. Never outlives the call that created it.
struct PendingCall {
    code: String,
    correlation_id: CorrelationId,
    reply_queue: String,
    timeout: Duration,
    deadline: Instant,
    replies: DeliveryStream,
}

impl PendingCall {
    /// Waits for the first reply carrying this call's correlation id.
    async fn wait(mut self) -> Result<Delivery> {
        loop {
            let next = tokio::time::timeout_at(self.deadline, self.replies.next()).await;
            match next {
                Err(_) => {
                    return Err(RpcError::Timeout {
                        code: self.code,
                        after: self.timeout,
                    })
                }
                Ok(None) => return Err(TransportError::ChannelClosed.into()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(delivery))) => {
                    let received = delivery.properties.correlation_id.as_deref();
                    if self.correlation_id.matches(received) {
                        return Ok(delivery);
                    }
                    debug!(
                        code = %self.code,
                        reply_queue = %self.reply_queue,
                        expected = %self.correlation_id,
                        received = received.unwrap_or("<none>"),
                        "discarding reply for another call"
                    );
                }
            }
        }
    }
}

/// Issues calls on behalf of one service identity.
#[derive(Clone)]
pub struct RpcClient {
    resolver: RouteResolver,
    pool: Arc<ConnectionPool>,
    config: ClientConfig,
}

impl RpcClient {
    pub fn new(resolver: RouteResolver, pool: Arc<ConnectionPool>, config: ClientConfig) -> Self {
        Self {
            resolver,
            pool,
            config,
        }
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    /// Deadline used when neither the caller nor the declaration names one.
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Calls `code` and waits up to `timeout` for the reply.
    pub async fn call(
        &self,
        code: &str,
        payload: Value,
        headers: Headers,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let route = self.resolver.client(code)?;
        self.call_route(&route, payload, headers, timeout).await
    }

    /// Calls `code` with its declared `TimeoutDuration`, or the configured default.
    pub async fn call_default(
        &self,
        code: &str,
        payload: Value,
        headers: Headers,
    ) -> Result<RpcResponse> {
        let route = self.resolver.client(code)?;
        let timeout = route.timeout.unwrap_or(self.config.default_timeout);
        self.call_route(&route, payload, headers, timeout).await
    }

    /// Calls with typed request and response bodies.
    pub async fn call_typed<Req, Resp>(
        &self,
        code: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let route = self.resolver.client(code)?;
        let timeout = timeout
            .or(route.timeout)
            .unwrap_or(self.config.default_timeout);
        let payload = serde_json::to_value(request)?;
        let response = self
            .call_route(&route, payload, Headers::new(), timeout)
            .await?;
        Ok(serde_json::from_value(response.body)?)
    }

    /// Calls an already resolved route.
    pub async fn call_route(
        &self,
        route: &MessageRoute,
        payload: Value,
        headers: Headers,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let connection = self.connect(route).await?;
        let channel = connection.open_channel().await?;

        let outcome = self
            .exchange(channel.as_ref(), route, payload, headers, timeout)
            .await;

        if let Err(e) = channel.close().await {
            debug!(code = %route.code, error = %e, "error closing call channel");
        }
        if !self.config.pool_connections {
            if let Err(e) = connection.close().await {
                debug!(code = %route.code, error = %e, "error closing call connection");
            }
        }
        outcome
    }

    async fn connect(&self, route: &MessageRoute) -> Result<Arc<dyn BrokerConnection>> {
        let connection = if self.config.pool_connections {
            self.pool.get(&route.endpoint, &route.credentials).await?
        } else {
            self.pool
                .broker()
                .connect(&route.endpoint, &route.credentials)
                .await?
        };
        Ok(connection)
    }

    async fn exchange(
        &self,
        channel: &dyn BrokerChannel,
        route: &MessageRoute,
        payload: Value,
        headers: Headers,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let reply_queue = channel.declare_queue(&QueueSpec::reply()).await?;
        let replies = channel.consume(&reply_queue, AckMode::OnDelivery).await?;
        let correlation_id = CorrelationId::new();

        let body = encode_request(route.dispatch, &route.code, payload)?;
        let properties = MessageProperties::default()
            .with_reply_to(reply_queue.clone())
            .with_correlation_id(correlation_id.to_string())
            .with_message_type(route.code.clone())
            .with_content_type(JSON_CONTENT_TYPE)
            .with_headers(headers);

        debug!(
            code = %route.code,
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            correlation_id = %correlation_id,
            "sending request"
        );
        channel
            .publish(
                &route.exchange,
                &route.routing_key,
                OutboundMessage::new(body).with_properties(properties),
            )
            .await?;

        let pending = PendingCall {
            code: route.code.clone(),
            correlation_id,
            reply_queue,
            timeout,
            deadline: deadline_after(timeout),
            replies,
        };
        let delivery = pending.wait().await?;
        decode_reply(delivery, correlation_id)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("service", &self.resolver.service_code())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn decode_reply(delivery: Delivery, correlation_id: CorrelationId) -> Result<RpcResponse> {
    let headers = delivery.properties.headers;
    let status = status_header(&headers);
    match ReplyBody::decode(&delivery.body)? {
        ReplyBody::Ok { result } => {
            let status = status.unwrap_or(DEFAULT_STATUS);
            debug!(correlation_id = %correlation_id, status, "reply received");
            Ok(RpcResponse {
                body: result,
                status,
                headers,
                correlation_id,
            })
        }
        ReplyBody::Error { kind, message } => Err(RpcError::Remote {
            kind,
            message,
            status: status.unwrap_or_else(|| kind.status()),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::ErrorKind;

    fn delivery(body: &[u8], headers: &[(&str, &str)], id: CorrelationId) -> Delivery {
        let mut props = MessageProperties::default().with_correlation_id(id.to_string());
        for (k, v) in headers {
            props = props.with_header(*k, *v);
        }
        Delivery::new(body.to_vec(), props)
    }

    #[test]
    fn queue_dispatch_sends_bare_payload() {
        let body = encode_request(DispatchStyle::Queue, "Ping", json!({"a": 1})).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn envelope_dispatch_wraps_payload() {
        let body = encode_request(DispatchStyle::Envelope, "Ping", json!({"a": 1})).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({"message_code": "Ping", "payload": {"a": 1}})
        );
    }

    #[test]
    fn ok_reply_reads_status_header() {
        let id = CorrelationId::new();
        let body = ReplyBody::ok(json!({"pong": true})).encode();
        let response = decode_reply(delivery(&body, &[("StatusCode", "201")], id), id).unwrap();
        assert_eq!(response.body, json!({"pong": true}));
        assert_eq!(response.status, 201);
        assert_eq!(response.correlation_id, id);
    }

    #[test]
    fn deadline_saturates_on_huge_timeouts() {
        let before = Instant::now();
        assert!(deadline_after(Duration::from_secs(u64::MAX / 2)) >= before + FAR_FUTURE);
        assert!(deadline_after(Duration::MAX) > before);
        let short = deadline_after(Duration::from_millis(10));
        assert!(short >= before + Duration::from_millis(10));
        assert!(short < before + Duration::from_secs(10));
    }

    #[test]
    fn bare_reply_defaults_to_200() {
        let id = CorrelationId::new();
        let response = decode_reply(delivery(b"[1,2]", &[], id), id).unwrap();
        assert_eq!(response.body, json!([1, 2]));
        assert_eq!(response.status, 200);
    }

    #[test]
    fn error_reply_becomes_remote_error() {
        let id = CorrelationId::new();
        let body = ReplyBody::error(ErrorKind::HandlerFailed, "boom").encode();
        let err = decode_reply(delivery(&body, &[], id), id).unwrap_err();
        match err {
            RpcError::Remote {
                kind,
                message,
                status,
            } => {
                assert_eq!(kind, ErrorKind::HandlerFailed);
                assert_eq!(message, "boom");
                assert_eq!(status, 500);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn undecodable_reply_is_codec_error() {
        let id = CorrelationId::new();
        let err = decode_reply(delivery(b"<html>", &[], id), id).unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
