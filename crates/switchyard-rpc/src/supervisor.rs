//! Listener supervisor: one consumer loop per declared input queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use switchyard_broker::Broker;
use switchyard_topology::{input_queues, QueueBinding, ServiceEntry};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RpcConfig, ServerConfig, SupervisorConfig};
use crate::consumer::{ConsumerLoop, ReadyCounter};
use crate::registry::HandlerRegistry;

/// A loop that consumed for this long before failing starts a fresh
/// restart budget.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// Starts and watches consumer loops.
///
/// Loops are independent: one failing does not affect the others. A failed
/// loop is restarted after `restart_delay`, at most `max_restarts` times in
/// a row, then abandoned.
pub struct ListenerSupervisor {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    server: ServerConfig,
    policy: SupervisorConfig,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    ready: ReadyCounter,
    ready_rx: watch::Receiver<usize>,
    launched: usize,
}

impl ListenerSupervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        config: &RpcConfig,
    ) -> Self {
        let (ready, ready_rx) = watch::channel(0);
        Self {
            broker,
            registry,
            server: config.server.clone(),
            policy: config.supervisor.clone(),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            ready: Arc::new(ready),
            ready_rx,
            launched: 0,
        }
    }

    /// Launches a loop for every input queue of the consumed and RPC-server
    /// groups. Returns the number of loops started.
    pub fn launch(&mut self, entry: &ServiceEntry) -> usize {
        let bindings = input_queues(entry);
        if bindings.is_empty() {
            warn!(service = %entry.service_code(), "service declares no input queues");
        }
        let count = self.launch_bindings(bindings);
        info!(service = %entry.service_code(), loops = count, "listeners launched");
        count
    }

    pub fn launch_bindings(&mut self, bindings: Vec<QueueBinding>) -> usize {
        let count = bindings.len();
        for binding in bindings {
            let consumer = ConsumerLoop::new(
                binding,
                Arc::clone(&self.broker),
                Arc::clone(&self.registry),
                self.server.clone(),
            )
            .with_ready_counter(Arc::clone(&self.ready));
            self.tasks
                .spawn(supervise(consumer, self.cancel.clone(), self.policy.clone()));
        }
        self.launched += count;
        count
    }

    /// Number of loops launched so far.
    pub fn launched(&self) -> usize {
        self.launched
    }

    /// Number of loops currently consuming.
    pub fn ready_count(&self) -> usize {
        *self.ready_rx.borrow()
    }

    /// Waits until every launched loop is consuming.
    ///
    /// Returns false if that did not happen within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let expected = self.launched;
        let mut rx = self.ready_rx.clone();
        let ready = tokio::time::timeout(timeout, async move {
            rx.wait_for(|n| *n >= expected).await.is_ok()
        })
        .await;
        ready.unwrap_or(false)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Asks every loop to stop after its current message.
    pub fn shutdown(&self) {
        info!("stopping listeners");
        self.cancel.cancel();
    }

    /// Blocks until every loop has exited.
    pub async fn wait(mut self) {
        join_all(&mut self.tasks).await;
        info!("all listeners stopped");
    }

    /// Blocks until `shutdown` resolves (or every loop has exited), then
    /// stops the loops and waits for them.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            () = shutdown => {}
            () = join_all(&mut self.tasks) => {
                warn!("every listener exited");
            }
        }
        self.shutdown();
        self.wait().await;
    }
}

impl std::fmt::Debug for ListenerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSupervisor")
            .field("launched", &self.launched)
            .field("ready", &self.ready_count())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "listener task panicked");
            }
        }
    }
}

/// Runs one loop, restarting it on failure according to `policy`.
async fn supervise(consumer: ConsumerLoop, cancel: CancellationToken, policy: SupervisorConfig) {
    let queue = consumer.binding().queue.clone();
    let mut restarts = 0u32;

    loop {
        let started = Instant::now();
        match consumer.run(cancel.clone()).await {
            Ok(()) => break,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                if started.elapsed() >= STABLE_RUN {
                    restarts = 0;
                }
                if restarts >= policy.max_restarts {
                    error!(
                        queue = %queue,
                        restarts,
                        error = %e,
                        "consumer loop abandoned"
                    );
                    break;
                }
                restarts += 1;
                warn!(
                    queue = %queue,
                    attempt = restarts,
                    max_restarts = policy.max_restarts,
                    error = %e,
                    delay = ?policy.restart_delay,
                    "consumer loop failed, restarting"
                );
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(policy.restart_delay) => {}
                }
            }
        }
    }
}
