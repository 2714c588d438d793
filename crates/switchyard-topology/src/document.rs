//! Serde model of the deployment descriptor (`<deployment>.idep`).
//!
//! Field names follow the descriptor's PascalCase keys. Keys this crate does
//! not understand (service-specific option blocks and the like) are ignored.

use std::fmt;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// The whole deployment descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyDocument {
    #[serde(rename = "DeploymentCode", default)]
    pub deployment_code: Option<String>,

    #[serde(rename = "Services", default)]
    pub services: Vec<ServiceDocument>,
}

/// One service entry with its four message groups.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDocument {
    #[serde(rename = "ServiceCode")]
    pub service_code: String,

    #[serde(rename = "MBHost", default)]
    pub host: Option<String>,

    #[serde(rename = "MBPort", default, deserialize_with = "port")]
    pub port: Option<u16>,

    #[serde(rename = "MBVirtualHostName", default)]
    pub vhost: Option<String>,

    #[serde(rename = "MessageBrokerOptions", default)]
    pub broker_options: Option<BrokerOptions>,

    #[serde(rename = "ProducedMessages", default, deserialize_with = "list")]
    pub produced: Vec<MessageDeclaration>,

    #[serde(rename = "ConsumedMessages", default, deserialize_with = "list")]
    pub consumed: Vec<MessageDeclaration>,

    #[serde(rename = "RPCMessages_Client", default, deserialize_with = "list")]
    pub rpc_client: Vec<MessageDeclaration>,

    #[serde(rename = "RPCMessages_Server", default, deserialize_with = "list")]
    pub rpc_server: Vec<MessageDeclaration>,
}

impl ServiceDocument {
    /// Declarations of one group.
    pub fn group(&self, kind: MessageKind) -> &[MessageDeclaration] {
        match kind {
            MessageKind::Produced => &self.produced,
            MessageKind::Consumed => &self.consumed,
            MessageKind::RpcClient => &self.rpc_client,
            MessageKind::RpcServer => &self.rpc_server,
        }
    }
}

/// Broker administration account shared by the deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerOptions {
    #[serde(rename = "AdminUser", default)]
    pub admin_user: Option<String>,

    #[serde(rename = "AdminPassword", default, deserialize_with = "secret")]
    pub admin_password: Option<SecretString>,
}

/// A message declaration in any of the four groups.
///
/// Produced and consumed messages carry `MessageCode`; RPC declarations carry
/// `RequestMessageCode`. Both land in `code`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageDeclaration {
    #[serde(rename = "MessageCode", alias = "RequestMessageCode")]
    pub code: String,

    #[serde(rename = "ResponseMessageCode", default)]
    pub response_code: Option<String>,

    #[serde(rename = "Description", default)]
    pub description: Option<String>,

    #[serde(rename = "MBExchangeName", default, deserialize_with = "string")]
    pub exchange: String,

    /// Ordered as declared; the first value is the routing key.
    #[serde(rename = "RoutingKeyParameters", default, deserialize_with = "object")]
    pub routing_key_parameters: Map<String, Value>,

    #[serde(rename = "MBHost", default)]
    pub host: Option<String>,

    #[serde(rename = "MBPort", default, deserialize_with = "port")]
    pub port: Option<u16>,

    #[serde(rename = "MBVirtualHostName", default)]
    pub vhost: Option<String>,

    #[serde(rename = "MBUserName", default)]
    pub username: Option<String>,

    #[serde(rename = "MBPassword", default, deserialize_with = "secret")]
    pub password: Option<SecretString>,

    /// Reply deadline in seconds.
    #[serde(rename = "TimeoutDuration", default)]
    pub timeout_secs: Option<f64>,

    #[serde(rename = "Dispatch", default)]
    pub dispatch: DispatchStyle,

    #[serde(rename = "InputQueues", default, deserialize_with = "list")]
    pub input_queues: Vec<InputQueue>,
}

impl MessageDeclaration {
    /// The first routing-key parameter rendered as a key, or the message code.
    pub fn routing_key(&self) -> String {
        match self.routing_key_parameters.values().next() {
            Some(Value::String(key)) => key.clone(),
            Some(Value::Null) | None => self.code.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// A queue a consumed or RPC-server declaration listens on.
#[derive(Debug, Clone, Deserialize)]
pub struct InputQueue {
    #[serde(rename = "MBQueueName")]
    pub name: String,

    #[serde(rename = "MBHost", default)]
    pub host: Option<String>,

    #[serde(rename = "MBPort", default, deserialize_with = "port")]
    pub port: Option<u16>,

    #[serde(rename = "MBVirtualHostName", default)]
    pub vhost: Option<String>,
}

/// How a request names its handler on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum DispatchStyle {
    /// The body is the bare payload; the queue determines the handler.
    #[default]
    #[serde(alias = "queue")]
    Queue,
    /// The body is `{"message_code": .., "payload": ..}`.
    #[serde(alias = "envelope")]
    Envelope,
}

/// The declaration group a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Produced,
    Consumed,
    RpcClient,
    RpcServer,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Produced,
        MessageKind::Consumed,
        MessageKind::RpcClient,
        MessageKind::RpcServer,
    ];

    /// Name of the group in the descriptor.
    pub fn group_name(self) -> &'static str {
        match self {
            MessageKind::Produced => "ProducedMessages",
            MessageKind::Consumed => "ConsumedMessages",
            MessageKind::RpcClient => "RPCMessages_Client",
            MessageKind::RpcServer => "RPCMessages_Server",
        }
    }

    /// Returns true for groups that declare input queues.
    pub fn has_input_queues(self) -> bool {
        matches!(self, MessageKind::Consumed | MessageKind::RpcServer)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_name())
    }
}

fn list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn object<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Ports appear both as numbers and as strings in hand-written descriptors.
fn port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Port::Number(n)) => Ok(Some(n)),
        Some(Port::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Port::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{s}'"))),
    }
}
