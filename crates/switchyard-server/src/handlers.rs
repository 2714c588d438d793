//! Handlers every switchyard service answers.

use serde_json::json;
use switchyard_rpc::{
    handler_fn, HandlerDescriptor, HandlerError, HandlerOutput, HandlerRegistry, Request,
};

pub const PING: &str = "Ping";

/// Registers the built-in handlers.
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register_descriptor(
        HandlerDescriptor::new(PING, handler_fn(ping))
            .with_description("Liveness probe; answers {\"pong\": true}"),
    );
}

async fn ping(_request: Request) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::ok(json!({"pong": true})))
}
