//! `switchyard serve`: run this service's listeners until shut down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use switchyard_rpc::{HandlerRegistry, ListenerSupervisor};
use switchyard_topology::{input_queues, DispatchStyle, ServiceEntry};
use tracing::{info, warn};

use super::load_service;
use crate::config::AppConfig;
use crate::handlers;

/// How long to wait for every loop to start consuming before reporting.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run<F>(config: AppConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let entry = load_service(&config)?;
    let broker = config.broker.build()?;

    let registry = HandlerRegistry::new();
    handlers::register_builtin(&registry);
    for (code, queue) in unhandled_queues(&registry, &entry) {
        warn!(code = %code, queue = %queue, "no handler registered for served code");
    }

    let mut supervisor = ListenerSupervisor::new(broker, Arc::new(registry), &config.rpc);
    let loops = supervisor.launch(&entry);
    if loops == 0 {
        anyhow::bail!(
            "service '{}' declares no input queues; nothing to serve",
            entry.service_code()
        );
    }

    if supervisor.wait_ready(READY_TIMEOUT).await {
        info!(loops, backend = config.broker.backend_name(), "service ready");
    } else {
        warn!(
            loops,
            ready = supervisor.ready_count(),
            "not every listener started; failed ones are retried in the background"
        );
    }

    supervisor.run_until(shutdown).await;
    info!("switchyard shutdown complete");
    Ok(())
}

/// (code, queue) pairs served by this entry that no handler answers.
///
/// Envelope-dispatched queues name their handler per message and are skipped.
fn unhandled_queues(registry: &HandlerRegistry, entry: &ServiceEntry) -> Vec<(String, String)> {
    input_queues(entry)
        .into_iter()
        .filter(|b| b.dispatch == DispatchStyle::Queue && registry.lookup(&b.code).is_none())
        .map(|b| (b.code, b.queue))
        .collect()
}
