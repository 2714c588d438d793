//! `switchyard call`: send one message as this service and print the outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use switchyard_broker::{ConnectionPool, Headers};
use switchyard_rpc::{Messenger, SendOutcome};
use switchyard_topology::{MessageKind, RouteResolver};
use tracing::debug;

use super::load_service;
use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct CallArgs {
    pub code: String,
    /// JSON text; `{}` when absent.
    pub payload: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Overrides the declared or configured reply deadline, in seconds.
    pub timeout: Option<f64>,
}

pub async fn run(config: AppConfig, args: CallArgs) -> anyhow::Result<()> {
    let payload = parse_payload(args.payload.as_deref())?;
    let headers: Headers = args.headers.into_iter().collect();
    let timeout = args
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--timeout must be a non-negative number of seconds")?;

    let resolver = RouteResolver::new(load_service(&config)?);
    let pool = Arc::new(ConnectionPool::new(config.broker.build()?));
    let messenger = Messenger::new(resolver.clone(), Arc::clone(&pool), &config.rpc);

    let route = resolver.client(&args.code)?;
    debug!(code = %route.code, kind = %route.kind, exchange = %route.exchange, routing_key = %route.routing_key, "route resolved");

    let outcome = match (route.kind, timeout) {
        (MessageKind::RpcClient, Some(timeout)) => messenger
            .client()
            .call_route(&route, payload, headers, timeout)
            .await
            .map(SendOutcome::Replied),
        _ => messenger.send(&args.code, payload, headers).await,
    };
    pool.close_all().await;

    println!("{}", serde_json::to_string_pretty(&render(&outcome?))?);
    Ok(())
}

fn parse_payload(text: Option<&str>) -> anyhow::Result<Value> {
    match text {
        None => Ok(json!({})),
        Some(text) => serde_json::from_str(text).context("payload is not valid JSON"),
    }
}

fn render(outcome: &SendOutcome) -> Value {
    match outcome {
        SendOutcome::Replied(response) => json!({
            "status": response.status,
            "correlation_id": response.correlation_id.to_string(),
            "headers": response.headers,
            "body": response.body,
        }),
        SendOutcome::Published => json!({"published": true}),
    }
}
