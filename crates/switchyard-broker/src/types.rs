use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::traits::Acknowledger;

/// Custom message headers. Values are carried as strings on the wire.
pub type Headers = BTreeMap<String, String>;

/// Physical broker coordinates: host, port and virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl BrokerEndpoint {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 5672;
    pub const DEFAULT_VHOST: &'static str = "/";

    pub fn new(host: impl Into<String>, port: u16, vhost: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            vhost: vhost.into(),
        }
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HOST, Self::DEFAULT_PORT, Self::DEFAULT_VHOST)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amqp://{}:{}/{}", self.host, self.port, self.vhost)
    }
}

/// Broker login. The password never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The stock RabbitMQ account.
    pub fn guest() -> Self {
        Self::new("guest", "guest")
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Exposes the password for handing to the transport.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::guest()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username && self.expose_password() == other.expose_password()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// How consumed messages are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The broker considers a message handled as soon as it is delivered.
    OnDelivery,
    /// The consumer acknowledges explicitly; unacked messages are redelivered.
    #[default]
    AfterProcessing,
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name; empty asks the broker to generate one.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A named queue that survives broker restarts.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A server-named, exclusive, auto-deleting queue for receiving replies.
    pub fn reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }
}

/// The subset of AMQP basic properties used by the RPC layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    /// The AMQP `type` property.
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    pub headers: Headers,
}

impl MessageProperties {
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// A message received from a queue.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self {
            body,
            properties,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            acker: None,
        }
    }

    pub fn with_route(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Returns true if this delivery must be acknowledged explicitly.
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledges the delivery. A no-op for automatically acknowledged messages.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Rejects the delivery, optionally putting it back on its queue.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("svc", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("svc"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn endpoint_defaults() {
        let endpoint = BrokerEndpoint::default();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 5672);
        assert_eq!(endpoint.vhost, "/");
        assert_eq!(endpoint.to_string(), "amqp://localhost:5672//");
    }

    #[test]
    fn reply_queue_is_server_named_and_exclusive() {
        let spec = QueueSpec::reply();
        assert!(spec.is_server_named());
        assert!(spec.exclusive);
        assert!(spec.auto_delete);
        assert!(!spec.durable);
    }

    #[test]
    fn properties_builder() {
        let props = MessageProperties::default()
            .with_reply_to("amq.gen-1")
            .with_correlation_id("abc")
            .with_header("StatusCode", "200");
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.header("StatusCode"), Some("200"));
        assert_eq!(props.header("missing"), None);
    }

    #[test]
    fn ack_mode_serde() {
        let mode: AckMode = serde_json::from_str("\"on_delivery\"").unwrap();
        assert_eq!(mode, AckMode::OnDelivery);
        assert_eq!(AckMode::default(), AckMode::AfterProcessing);
    }
}
