//! Common test utilities for RPC integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use switchyard_broker::{Broker, ConnectionPool, MemoryBroker};
use switchyard_rpc::{
    HandlerRegistry, ListenerSupervisor, Messenger, Producer, RpcClient, RpcConfig,
};
use switchyard_topology::{RouteResolver, TopologyStore};

/// A memory broker with `LLM` listening and an `Agent` client wired to it.
pub struct TestBus {
    pub broker: MemoryBroker,
    pub pool: Arc<ConnectionPool>,
    pub store: TopologyStore,
    pub config: RpcConfig,
    pub supervisor: ListenerSupervisor,
}

impl TestBus {
    /// Starts every `LLM` listener with the fixture handlers.
    pub async fn start() -> Self {
        Self::with_registry(fixtures::llm_registry(), fast_config()).await
    }

    pub async fn with_config(config: RpcConfig) -> Self {
        Self::with_registry(fixtures::llm_registry(), config).await
    }

    pub async fn with_registry(registry: HandlerRegistry, config: RpcConfig) -> Self {
        let broker = MemoryBroker::new();
        let backend: Arc<dyn Broker> = Arc::new(broker.clone());
        let store = TopologyStore::parse(fixtures::TOPOLOGY).unwrap();

        let entry = store.load("LLM").unwrap();
        let mut supervisor = ListenerSupervisor::new(Arc::clone(&backend), Arc::new(registry), &config);
        let launched = supervisor.launch(&entry);
        assert_eq!(launched, fixtures::LLM_QUEUES);
        assert!(
            supervisor.wait_ready(Duration::from_secs(2)).await,
            "listeners did not start"
        );

        Self {
            broker,
            pool: Arc::new(ConnectionPool::new(backend)),
            store,
            config,
            supervisor,
        }
    }

    pub fn agent(&self) -> RouteResolver {
        RouteResolver::new(self.store.load("Agent").unwrap())
    }

    pub fn client(&self) -> RpcClient {
        RpcClient::new(self.agent(), Arc::clone(&self.pool), self.config.client.clone())
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.agent(), Arc::clone(&self.pool), self.config.producer.clone())
    }

    pub fn messenger(&self) -> Messenger {
        Messenger::new(self.agent(), Arc::clone(&self.pool), &self.config)
    }

    /// Stops the listeners and waits for them to exit.
    pub async fn stop(self) {
        self.supervisor.shutdown();
        self.supervisor.wait().await;
        self.pool.close_all().await;
    }
}

/// Short delays so failure paths finish quickly.
pub fn fast_config() -> RpcConfig {
    let mut config = RpcConfig::default();
    config.client.default_timeout = Duration::from_secs(2);
    config.producer.retry_interval = Duration::from_millis(20);
    config.supervisor.restart_delay = Duration::from_millis(20);
    config
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
