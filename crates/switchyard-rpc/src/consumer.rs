//! Server-side consumer loop for one input queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use switchyard_broker::{
    AckMode, Broker, BrokerChannel, Delivery, MessageProperties, OutboundMessage, QueueSpec,
    TransportError,
};
use switchyard_topology::{DispatchStyle, QueueBinding};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::envelope::{
    ErrorKind, ReplyBody, RequestEnvelope, ERROR_KIND_HEADER, JSON_CONTENT_TYPE,
    STATUS_CODE_HEADER,
};
use crate::error::Result;
use crate::registry::{HandlerRegistry, Request};

/// Counts consumer loops that are currently consuming.
pub type ReadyCounter = Arc<watch::Sender<usize>>;

/// Increments the counter while a loop is consuming.
struct ReadyGuard<'a>(&'a watch::Sender<usize>);

impl<'a> ReadyGuard<'a> {
    fn new(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for ReadyGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Consumes one queue and dispatches each message to its handler.
///
/// Messages are processed one at a time, in delivery order.
pub struct ConsumerLoop {
    binding: QueueBinding,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    config: ServerConfig,
    ready: Option<ReadyCounter>,
}

impl ConsumerLoop {
    pub fn new(
        binding: QueueBinding,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        config: ServerConfig,
    ) -> Self {
        Self {
            binding,
            broker,
            registry,
            config,
            ready: None,
        }
    }

    /// Reports readiness through a shared counter.
    pub fn with_ready_counter(mut self, counter: ReadyCounter) -> Self {
        self.ready = Some(counter);
        self
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Runs until cancelled (`Ok`) or until the connection fails (`Err`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let b = &self.binding;
        let connection = self.broker.connect(&b.endpoint, &b.credentials).await?;
        let channel = connection.open_channel().await?;

        let result = self.serve(channel.as_ref(), &cancel).await;

        if let Err(e) = channel.close().await {
            debug!(queue = %b.queue, error = %e, "error closing consumer channel");
        }
        if let Err(e) = connection.close().await {
            debug!(queue = %b.queue, error = %e, "error closing consumer connection");
        }
        result
    }

    async fn serve(&self, channel: &dyn BrokerChannel, cancel: &CancellationToken) -> Result<()> {
        let b = &self.binding;
        channel.declare_queue(&QueueSpec::durable(&b.queue)).await?;
        if self.config.bind_exchanges && !b.exchange.is_empty() {
            channel.declare_exchange(&b.exchange).await?;
            channel
                .bind_queue(&b.queue, &b.exchange, &b.routing_key)
                .await?;
        }
        if self.config.ack_mode == AckMode::AfterProcessing {
            channel.set_prefetch(self.config.prefetch).await?;
        }
        let mut deliveries = channel.consume(&b.queue, self.config.ack_mode).await?;

        let _ready = self.ready.as_deref().map(ReadyGuard::new);
        info!(
            queue = %b.queue,
            code = %b.code,
            kind = %b.kind,
            endpoint = %b.endpoint,
            "consumer loop started"
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!(queue = %b.queue, "consumer loop stopped");
                    return Ok(());
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.process(channel, delivery).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(TransportError::ChannelClosed.into()),
                },
            }
        }
    }

    /// Handles one delivery: dispatch, reply, then acknowledge.
    async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> std::result::Result<(), TransportError> {
        let reply = self.dispatch(&delivery).await;

        match delivery.properties.reply_to.as_deref().filter(|r| !r.is_empty()) {
            Some(reply_to) => {
                if let Some(reply) = reply {
                    channel.publish("", reply_to, reply).await?;
                    debug!(queue = %self.binding.queue, reply_to = %reply_to, "reply sent");
                }
            }
            None => {
                if reply.is_some() {
                    debug!(queue = %self.binding.queue, "no reply-to; reply discarded");
                }
            }
        }

        delivery.ack().await
    }

    /// Runs the handler and builds the reply, if one should be sent.
    async fn dispatch(&self, delivery: &Delivery) -> Option<OutboundMessage> {
        let b = &self.binding;
        let correlation_id = delivery.properties.correlation_id.clone();

        let value: Value = match serde_json::from_slice(&delivery.body) {
            Ok(value) => value,
            Err(e) => {
                warn!(queue = %b.queue, error = %e, "request body is not JSON");
                return self.error_reply(
                    correlation_id,
                    ErrorKind::InvalidRequest,
                    None,
                    format!("request body is not JSON: {e}"),
                );
            }
        };

        let (code, payload) = match b.dispatch {
            DispatchStyle::Queue => (b.code.clone(), value),
            DispatchStyle::Envelope => match serde_json::from_value::<RequestEnvelope>(value) {
                Ok(envelope) => (envelope.message_code, envelope.payload),
                Err(e) => {
                    warn!(queue = %b.queue, error = %e, "malformed request envelope");
                    return self.error_reply(
                        correlation_id,
                        ErrorKind::InvalidRequest,
                        None,
                        format!("malformed request envelope: {e}"),
                    );
                }
            },
        };

        let Some(handler) = self.registry.lookup(&code) else {
            warn!(queue = %b.queue, code = %code, "no handler registered");
            return self.error_reply(
                correlation_id,
                ErrorKind::HandlerNotFound,
                None,
                format!("no handler registered for '{code}'"),
            );
        };

        debug!(
            queue = %b.queue,
            code = %code,
            correlation_id = correlation_id.as_deref().unwrap_or("<none>"),
            redelivered = delivery.redelivered,
            "dispatching request"
        );
        let request = Request {
            code: code.clone(),
            payload,
            headers: delivery.properties.headers.clone(),
            correlation_id: correlation_id.clone(),
            redelivered: delivery.redelivered,
        };

        match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
            Ok(Ok(output)) => Some(reply_message(
                correlation_id,
                ReplyBody::ok(output.result),
                output.status,
                None,
            )),
            Ok(Err(e)) => {
                error!(queue = %b.queue, code = %code, error = %e, "handler failed");
                self.error_reply(correlation_id, e.kind(), Some(e.status()), e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(queue = %b.queue, code = %code, panic = %message, "handler panicked");
                self.error_reply(
                    correlation_id,
                    ErrorKind::HandlerFailed,
                    None,
                    format!("handler panicked: {message}"),
                )
            }
        }
    }

    fn error_reply(
        &self,
        correlation_id: Option<String>,
        kind: ErrorKind,
        status: Option<u16>,
        message: String,
    ) -> Option<OutboundMessage> {
        if !self.config.error_replies {
            debug!(queue = %self.binding.queue, kind = %kind, "error replies disabled; message dropped");
            return None;
        }
        Some(reply_message(
            correlation_id,
            ReplyBody::error(kind, message),
            status.unwrap_or_else(|| kind.status()),
            Some(kind),
        ))
    }
}

impl std::fmt::Debug for ConsumerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("binding", &self.binding)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn reply_message(
    correlation_id: Option<String>,
    body: ReplyBody,
    status: u16,
    kind: Option<ErrorKind>,
) -> OutboundMessage {
    let mut properties = MessageProperties::default()
        .with_content_type(JSON_CONTENT_TYPE)
        .with_header(STATUS_CODE_HEADER, status.to_string());
    if let Some(id) = correlation_id {
        properties = properties.with_correlation_id(id);
    }
    if let Some(kind) = kind {
        properties = properties.with_header(ERROR_KIND_HEADER, kind.as_str());
    }
    OutboundMessage::new(body.encode()).with_properties(properties)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_status_and_correlation() {
        let message = reply_message(
            Some("abc".to_string()),
            ReplyBody::ok(Value::Bool(true)),
            201,
            None,
        );
        assert_eq!(message.properties.correlation_id.as_deref(), Some("abc"));
        assert_eq!(message.properties.header(STATUS_CODE_HEADER), Some("201"));
        assert_eq!(message.properties.header(ERROR_KIND_HEADER), None);
    }

    #[test]
    fn error_reply_names_its_kind() {
        let message = reply_message(
            None,
            ReplyBody::error(ErrorKind::HandlerNotFound, "none"),
            404,
            Some(ErrorKind::HandlerNotFound),
        );
        assert_eq!(
            message.properties.header(ERROR_KIND_HEADER),
            Some("handler_not_found")
        );
        assert_eq!(message.properties.correlation_id, None);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
