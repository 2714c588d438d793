//! Resolution of logical message codes into broker coordinates.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use switchyard_broker::{BrokerEndpoint, Credentials};
use tracing::trace;

use crate::document::{DispatchStyle, InputQueue, MessageDeclaration, MessageKind};
use crate::error::{Result, TopologyError};
use crate::store::ServiceEntry;

/// Which side of an exchange the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Search `RPCMessages_Client`, then `ProducedMessages`.
    Client,
    /// Search `RPCMessages_Server` only.
    Server,
}

impl Binding {
    fn search_order(self) -> &'static [MessageKind] {
        match self {
            Binding::Client => &[MessageKind::RpcClient, MessageKind::Produced],
            Binding::Server => &[MessageKind::RpcServer],
        }
    }
}

/// A resolved binding. Derived on every call, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRoute {
    pub code: String,
    pub kind: MessageKind,
    pub exchange: String,
    pub routing_key: String,
    pub endpoint: BrokerEndpoint,
    pub credentials: Credentials,
    pub dispatch: DispatchStyle,
    /// Reply deadline declared for this message, if any.
    pub timeout: Option<Duration>,
    /// First input queue, for server-side routes.
    pub queue: Option<String>,
}

/// A queue the supervisor must consume, with everything a consumer loop needs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub queue: String,
    pub code: String,
    pub kind: MessageKind,
    pub exchange: String,
    pub routing_key: String,
    pub endpoint: BrokerEndpoint,
    pub credentials: Credentials,
    pub dispatch: DispatchStyle,
}

/// Resolves a message code against a service entry.
pub fn resolve(entry: &ServiceEntry, code: &str, binding: Binding) -> Result<MessageRoute> {
    for &kind in binding.search_order() {
        let Some(decl) = entry.find(kind, code) else {
            continue;
        };

        let first_queue = decl.input_queues.first();
        let endpoint = match binding {
            Binding::Server => queue_endpoint(entry, decl, first_queue),
            Binding::Client => declaration_endpoint(entry, decl),
        };
        let route = MessageRoute {
            code: code.to_string(),
            kind,
            exchange: decl.exchange.clone(),
            routing_key: decl.routing_key(),
            endpoint,
            credentials: match binding {
                Binding::Server => declaration_credentials(entry.listener_credentials(), decl),
                Binding::Client => declaration_credentials(entry.default_credentials(), decl),
            },
            dispatch: decl.dispatch,
            timeout: declared_timeout(decl),
            queue: match binding {
                Binding::Server => first_queue.map(|q| q.name.clone()),
                Binding::Client => None,
            },
        };
        trace!(
            code = %code,
            kind = %kind,
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            "route resolved"
        );
        return Ok(route);
    }

    Err(TopologyError::RouteNotFound {
        service: entry.service_code().to_string(),
        code: code.to_string(),
    })
}

/// Every input queue declared by the consumed and RPC-server groups.
pub fn input_queues(entry: &ServiceEntry) -> Vec<QueueBinding> {
    [MessageKind::Consumed, MessageKind::RpcServer]
        .into_iter()
        .flat_map(|kind| entry.group(kind).iter().map(move |decl| (kind, decl)))
        .flat_map(|(kind, decl)| {
            decl.input_queues.iter().map(move |queue| QueueBinding {
                queue: queue.name.clone(),
                code: decl.code.clone(),
                kind,
                exchange: decl.exchange.clone(),
                routing_key: decl.routing_key(),
                endpoint: queue_endpoint(entry, decl, Some(queue)),
                credentials: declaration_credentials(entry.listener_credentials(), decl),
                dispatch: decl.dispatch,
            })
        })
        .collect()
}

fn declaration_endpoint(entry: &ServiceEntry, decl: &MessageDeclaration) -> BrokerEndpoint {
    let defaults = entry.default_endpoint();
    BrokerEndpoint::new(
        decl.host.clone().unwrap_or_else(|| defaults.host.clone()),
        decl.port.unwrap_or(defaults.port),
        decl.vhost.clone().unwrap_or_else(|| defaults.vhost.clone()),
    )
}

fn queue_endpoint(
    entry: &ServiceEntry,
    decl: &MessageDeclaration,
    queue: Option<&InputQueue>,
) -> BrokerEndpoint {
    let fallback = declaration_endpoint(entry, decl);
    let Some(queue) = queue else {
        return fallback;
    };
    BrokerEndpoint::new(
        queue.host.clone().unwrap_or(fallback.host),
        queue.port.unwrap_or(fallback.port),
        queue.vhost.clone().unwrap_or(fallback.vhost),
    )
}

fn declaration_credentials(defaults: &Credentials, decl: &MessageDeclaration) -> Credentials {
    if decl.username.is_none() && decl.password.is_none() {
        return defaults.clone();
    }
    Credentials::new(
        decl.username
            .clone()
            .unwrap_or_else(|| defaults.username().to_string()),
        decl.password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_else(|| defaults.expose_password().to_string()),
    )
}

/// Longest reply deadline a declaration may ask for; larger values are clamped.
pub const MAX_DECLARED_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn declared_timeout(decl: &MessageDeclaration) -> Option<Duration> {
    decl.timeout_secs
        .filter(|secs| *secs > 0.0)
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_or(MAX_DECLARED_TIMEOUT, |d| d.min(MAX_DECLARED_TIMEOUT))
        })
}

/// A service entry bundled with resolution methods.
#[derive(Debug, Clone)]
pub struct RouteResolver {
    entry: Arc<ServiceEntry>,
}

impl RouteResolver {
    pub fn new(entry: Arc<ServiceEntry>) -> Self {
        Self { entry }
    }

    pub fn entry(&self) -> &Arc<ServiceEntry> {
        &self.entry
    }

    pub fn service_code(&self) -> &str {
        self.entry.service_code()
    }

    pub fn resolve(&self, code: &str, binding: Binding) -> Result<MessageRoute> {
        resolve(&self.entry, code, binding)
    }

    /// Client-side resolution, used for outbound calls and publishes.
    pub fn client(&self, code: &str) -> Result<MessageRoute> {
        self.resolve(code, Binding::Client)
    }

    pub fn server(&self, code: &str) -> Result<MessageRoute> {
        self.resolve(code, Binding::Server)
    }

    pub fn input_queues(&self) -> Vec<QueueBinding> {
        input_queues(&self.entry)
    }

    /// Every code this service can send, resolved, in search order.
    pub fn outbound_routes(&self) -> Vec<MessageRoute> {
        let mut seen = std::collections::HashSet::new();
        Binding::Client
            .search_order()
            .iter()
            .flat_map(|&kind| self.entry.group(kind).iter())
            .filter(|decl| seen.insert(decl.code.clone()))
            .filter_map(|decl| self.client(&decl.code).ok())
            .collect()
    }
}
