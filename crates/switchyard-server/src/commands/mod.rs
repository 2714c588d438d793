//! Subcommand implementations.

pub mod call;
pub mod routes;
pub mod serve;

use std::sync::Arc;

use anyhow::Context;
use switchyard_topology::{ServiceEntry, TopologyStore};
use tracing::info;

use crate::config::AppConfig;

/// Opens the configured topology document and loads this process's service.
fn load_service(config: &AppConfig) -> anyhow::Result<Arc<ServiceEntry>> {
    let deployment = config.topology.deployment_code()?;
    let service = config.topology.service_code()?;

    let store = TopologyStore::open(&config.topology.dir, deployment).with_context(|| {
        format!(
            "loading topology '{deployment}' from {}",
            config.topology.dir.display()
        )
    })?;
    let entry = store.load(service)?;
    info!(
        deployment = %deployment,
        service = %service,
        endpoint = %entry.default_endpoint(),
        "topology loaded"
    );
    Ok(entry)
}
