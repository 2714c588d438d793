//! In-process broker with AMQP 0-9-1 routing semantics.
//!
//! State lives behind a synchronous mutex so that dropping a channel or a
//! connection can release its consumers, unacknowledged deliveries and
//! exclusive queues immediately, the same way a real broker reacts to a
//! closed socket.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Result, TransportError};
use crate::traits::{Acknowledger, Broker, BrokerChannel, BrokerConnection, DeliveryStream};
use crate::types::{
    AckMode, BrokerEndpoint, Credentials, Delivery, MessageProperties, OutboundMessage, QueueSpec,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self) -> Delivery {
        Delivery::new(self.body.clone(), self.properties.clone())
            .with_route(self.exchange.clone(), self.routing_key.clone())
            .with_redelivered(self.redelivered)
    }
}

struct Consumer {
    channel_id: u64,
    mode: AckMode,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    had_consumer: bool,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

#[derive(Default)]
struct VhostState {
    queues: HashMap<String, QueueState>,
    /// Direct exchanges: name to (routing key, queue) bindings.
    exchanges: HashMap<String, Vec<(String, String)>>,
}

impl VhostState {
    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|(_, queue)| queue != name);
        }
    }
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    unacked: usize,
}

struct Unacked {
    channel_id: u64,
    vhost: String,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    vhosts: HashMap<String, VhostState>,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel_id: u64) -> Result<()> {
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    fn queue_mut(&mut self, vhost: &str, queue: &str) -> Option<&mut QueueState> {
        self.vhosts.get_mut(vhost)?.queues.get_mut(queue)
    }

    /// Hands ready messages to consumers with spare capacity, round robin.
    fn dispatch(&mut self, vhost: &str, queue_name: &str, shared: &Weak<Shared>) {
        let Self {
            vhosts,
            channels,
            unacked,
            next_id,
            ..
        } = self;
        let Some(queue) = vhosts
            .get_mut(vhost)
            .and_then(|v| v.queues.get_mut(queue_name))
        else {
            return;
        };

        queue.consumers.retain(|c| !c.tx.is_closed());

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    if consumer.mode == AckMode::OnDelivery {
                        return true;
                    }
                    channels.get(&consumer.channel_id).is_some_and(|ch| {
                        ch.prefetch == 0 || ch.unacked < usize::from(ch.prefetch)
                    })
                });
            let Some(idx) = chosen else {
                break;
            };
            let Some(message) = queue.messages.pop_front() else {
                break;
            };
            queue.cursor = (idx + 1) % count;

            let consumer = &queue.consumers[idx];
            let mut delivery = message.to_delivery();
            let mut tag = None;
            if consumer.mode == AckMode::AfterProcessing {
                *next_id += 1;
                let id = *next_id;
                unacked.insert(
                    id,
                    Unacked {
                        channel_id: consumer.channel_id,
                        vhost: vhost.to_string(),
                        queue: queue_name.to_string(),
                        message: message.clone(),
                    },
                );
                if let Some(ch) = channels.get_mut(&consumer.channel_id) {
                    ch.unacked += 1;
                }
                delivery = delivery.with_acker(Arc::new(MemoryAcker {
                    shared: shared.clone(),
                    tag: id,
                }));
                tag = Some(id);
            }

            trace!(queue = %queue_name, "delivering message");
            if consumer.tx.send(delivery).is_err() {
                if let Some(id) = tag {
                    unacked.remove(&id);
                    if let Some(ch) = channels.get_mut(&consumer.channel_id) {
                        ch.unacked = ch.unacked.saturating_sub(1);
                    }
                }
                queue.messages.push_front(message);
                queue.consumers.remove(idx);
                queue.cursor = 0;
            }
        }
    }

    fn publish(
        &mut self,
        vhost: &str,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
        shared: &Weak<Shared>,
    ) -> Result<()> {
        let state = self.vhosts.entry(vhost.to_string()).or_default();
        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let bindings = state.exchanges.get(exchange).ok_or_else(|| {
                TransportError::Protocol(format!(
                    "NOT_FOUND - no exchange '{exchange}' in vhost '{vhost}'"
                ))
            })?;
            let unique: BTreeSet<&String> = bindings
                .iter()
                .filter(|(key, _)| key == routing_key)
                .map(|(_, queue)| queue)
                .collect();
            unique.into_iter().cloned().collect()
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "unroutable message dropped");
            return Ok(());
        }

        for queue_name in &targets {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.messages.push_back(StoredMessage {
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        for queue_name in &targets {
            self.dispatch(vhost, queue_name, shared);
        }
        Ok(())
    }

    fn settle(&mut self, tag: u64, requeue: bool, shared: &Weak<Shared>) -> Result<()> {
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or(TransportError::ChannelClosed)?;
        if let Some(ch) = self.channels.get_mut(&entry.channel_id) {
            ch.unacked = ch.unacked.saturating_sub(1);
        }
        if requeue {
            if let Some(queue) = self.queue_mut(&entry.vhost, &entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        self.dispatch(&entry.vhost, &entry.queue, shared);
        Ok(())
    }

    fn close_channel(&mut self, channel_id: u64, shared: &Weak<Shared>) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        let mut affected: BTreeSet<(String, String)> = BTreeSet::new();
        for (vhost_name, vhost) in &mut self.vhosts {
            for (queue_name, queue) in &mut vhost.queues {
                let before = queue.consumers.len();
                queue.consumers.retain(|c| c.channel_id != channel_id);
                if queue.consumers.len() != before {
                    affected.insert((vhost_name.clone(), queue_name.clone()));
                }
            }
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            let Some(entry) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(queue) = self.queue_mut(&entry.vhost, &entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                affected.insert((entry.vhost, entry.queue));
            }
        }

        for (vhost_name, queue_name) in &affected {
            let Some(vhost) = self.vhosts.get_mut(vhost_name) else {
                continue;
            };
            let drop_queue = vhost
                .queues
                .get(queue_name)
                .is_some_and(|q| q.auto_delete && q.had_consumer && q.consumers.is_empty());
            if drop_queue {
                debug!(queue = %queue_name, "auto-delete queue removed");
                vhost.delete_queue(queue_name);
            }
        }

        for (vhost_name, queue_name) in &affected {
            self.dispatch(vhost_name, queue_name, shared);
        }
    }

    fn close_connection(&mut self, connection_id: u64, shared: &Weak<Shared>) {
        if !self.connections.remove(&connection_id) {
            return;
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id, shared);
        }

        for vhost in self.vhosts.values_mut() {
            let exclusive: Vec<String> = vhost
                .queues
                .iter()
                .filter(|(_, q)| q.exclusive_owner == Some(connection_id))
                .map(|(name, _)| name.clone())
                .collect();
            for name in exclusive {
                debug!(queue = %name, "exclusive queue removed with its connection");
                vhost.delete_queue(&name);
            }
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    refuse_connections: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker backend.
///
/// Host and port are ignored; virtual hosts are isolated from one another.
/// Cloning yields a handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// Makes subsequent `connect` calls fail, as if the broker were down.
    pub fn reject_connections(&self, reject: bool) {
        self.shared
            .refuse_connections
            .store(reject, Ordering::SeqCst);
    }

    /// Closes every open connection, as if the network dropped.
    ///
    /// Returns the number of connections that were closed.
    pub fn sever_connections(&self) -> usize {
        let weak = Arc::downgrade(&self.shared);
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.iter().copied().collect();
        for id in &ids {
            state.close_connection(*id, &weak);
        }
        ids.len()
    }

    pub fn queue_exists(&self, vhost: &str, queue: &str) -> bool {
        self.shared
            .lock()
            .vhosts
            .get(vhost)
            .is_some_and(|v| v.queues.contains_key(queue))
    }

    /// Number of ready (undelivered) messages in a queue.
    pub fn queue_depth(&self, vhost: &str, queue: &str) -> Option<usize> {
        let state = self.shared.lock();
        state
            .vhosts
            .get(vhost)?
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, vhost: &str, queue: &str) -> Option<usize> {
        let state = self.shared.lock();
        state
            .vhosts
            .get(vhost)?
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!(
                "{endpoint} is not accepting connections"
            )));
        }

        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id();
            state.connections.insert(id);
            state.vhosts.entry(endpoint.vhost.clone()).or_default();
            id
        };
        debug!(endpoint = %endpoint, user = %credentials.username(), connection = id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
            vhost: endpoint.vhost.clone(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    vhost: String,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.shared.lock();
        if !state.connections.contains(&self.id) {
            return Err(TransportError::ChannelClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                unacked: 0,
            },
        );
        Ok(Box::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
            connection_id: self.id,
            vhost: self.vhost.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.shared.lock().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        self.shared.lock().close_connection(self.id, &weak);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.lock().close_connection(self.id, &weak);
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    connection_id: u64,
    vhost: String,
}

impl MemoryChannel {
    fn weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let mut state = self.shared.lock();
        state.ensure_channel(self.id)?;

        let name = if spec.is_server_named() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };
        let vhost = state.vhosts.entry(self.vhost.clone()).or_default();
        match vhost.queues.get(&name) {
            Some(existing) => {
                if let Some(owner) = existing.exclusive_owner {
                    if owner != self.connection_id {
                        return Err(TransportError::Protocol(format!(
                            "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                        )));
                    }
                }
            }
            None => {
                vhost.queues.insert(
                    name.clone(),
                    QueueState {
                        exclusive_owner: spec.exclusive.then_some(self.connection_id),
                        auto_delete: spec.auto_delete,
                        ..QueueState::default()
                    },
                );
                trace!(queue = %name, "queue declared");
            }
        }
        Ok(name)
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_channel(self.id)?;
        if !name.is_empty() {
            state
                .vhosts
                .entry(self.vhost.clone())
                .or_default()
                .exchanges
                .entry(name.to_string())
                .or_default();
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_channel(self.id)?;
        if exchange.is_empty() {
            return Err(TransportError::Protocol(
                "ACCESS_REFUSED - cannot bind to the default exchange".to_string(),
            ));
        }
        let vhost = state.vhosts.entry(self.vhost.clone()).or_default();
        if !vhost.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        let bindings = vhost.exchanges.get_mut(exchange).ok_or_else(|| {
            TransportError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.shared.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.lock();
            state.ensure_channel(self.id)?;
            let target = state
                .queue_mut(&self.vhost, queue)
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
            if target
                .exclusive_owner
                .is_some_and(|owner| owner != self.connection_id)
            {
                return Err(TransportError::Protocol(format!(
                    "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
                )));
            }
            target.consumers.push(Consumer {
                channel_id: self.id,
                mode,
                tx,
            });
            target.had_consumer = true;
            state.dispatch(&self.vhost, queue, &self.weak());
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_channel(self.id)?;
        state.publish(&self.vhost, exchange, routing_key, message, &self.weak())
    }

    async fn close(&self) -> Result<()> {
        let weak = self.weak();
        self.shared.lock().close_channel(self.id, &weak);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let weak = self.weak();
        self.shared.lock().close_channel(self.id, &weak);
    }
}

struct MemoryAcker {
    shared: Weak<Shared>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(TransportError::ChannelClosed)?;
        let mut state = shared.lock();
        state.settle(self.tag, requeue, &self.shared)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }
}
