//! Topology and handlers shared by the RPC integration tests.

use serde_json::json;
use switchyard_rpc::{handler_fn, HandlerError, HandlerOutput, HandlerRegistry, Request};

/// `LLM` serves, `Agent` calls and publishes. Everything lives on vhost `/`.
pub const TOPOLOGY: &str = r#"{
    "DeploymentCode": "test",
    "Services": [
        {
            "ServiceCode": "LLM",
            "RPCMessages_Server": [
                {"RequestMessageCode": "Ping", "InputQueues": [{"MBQueueName": "llm.ping"}]},
                {
                    "RequestMessageCode": "LLMChat",
                    "MBExchangeName": "LLM_Exchange",
                    "RoutingKeyParameters": {"Route": "llm.chat"},
                    "InputQueues": [{"MBQueueName": "llm.chat"}]
                },
                {"RequestMessageCode": "Fail", "InputQueues": [{"MBQueueName": "llm.fail"}]},
                {"RequestMessageCode": "Panic", "InputQueues": [{"MBQueueName": "llm.panic"}]},
                {"RequestMessageCode": "Unregistered", "InputQueues": [{"MBQueueName": "llm.unregistered"}]},
                {
                    "RequestMessageCode": "Router",
                    "Dispatch": "Envelope",
                    "InputQueues": [{"MBQueueName": "llm.router"}]
                }
            ],
            "ConsumedMessages": [
                {"MessageCode": "AuditEvent", "InputQueues": [{"MBQueueName": "llm.audit"}]}
            ]
        },
        {
            "ServiceCode": "Agent",
            "RPCMessages_Client": [
                {"RequestMessageCode": "Ping", "RoutingKeyParameters": {"Queue": "llm.ping"}},
                {
                    "RequestMessageCode": "LLMChat",
                    "MBExchangeName": "LLM_Exchange",
                    "RoutingKeyParameters": {"Route": "llm.chat"},
                    "TimeoutDuration": 0.5
                },
                {"RequestMessageCode": "Fail", "RoutingKeyParameters": {"Queue": "llm.fail"}},
                {"RequestMessageCode": "Panic", "RoutingKeyParameters": {"Queue": "llm.panic"}},
                {"RequestMessageCode": "Unregistered", "RoutingKeyParameters": {"Queue": "llm.unregistered"}},
                {"RequestMessageCode": "Nowhere", "RoutingKeyParameters": {"Queue": "nobody.listens"}},
                {"RequestMessageCode": "Manual", "RoutingKeyParameters": {"Queue": "llm.manual"}},
                {"RequestMessageCode": "Summarize", "Dispatch": "Envelope", "RoutingKeyParameters": {"Queue": "llm.router"}},
                {"RequestMessageCode": "Translate", "Dispatch": "Envelope", "RoutingKeyParameters": {"Queue": "llm.router"}}
            ],
            "ProducedMessages": [
                {"MessageCode": "AuditEvent", "RoutingKeyParameters": {"Queue": "llm.audit"}}
            ]
        }
    ]
}"#;

/// Input queues declared by `LLM`.
pub const LLM_QUEUES: usize = 7;

/// Handlers for every `LLM` code except `Unregistered` and `AuditEvent`.
pub fn llm_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.register("Ping", handler_fn(ping));
    registry.register("LLMChat", handler_fn(chat));
    registry.register("Fail", handler_fn(fail));
    registry.register("Panic", handler_fn(explode));
    registry.register("Summarize", handler_fn(summarize));
    registry.register("Translate", handler_fn(translate));
    registry
}

async fn ping(_req: Request) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::ok(json!({"pong": true})))
}

async fn chat(req: Request) -> Result<HandlerOutput, HandlerError> {
    let prompt = req.payload["prompt"].as_str().unwrap_or_default();
    Ok(HandlerOutput::with_status(
        201,
        json!({"reply": format!("echo: {prompt}")}),
    ))
}

async fn fail(_req: Request) -> Result<HandlerOutput, HandlerError> {
    Err(HandlerError::new("model unavailable"))
}

async fn explode(_req: Request) -> Result<HandlerOutput, HandlerError> {
    panic!("handler exploded")
}

async fn summarize(req: Request) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::ok(json!({"summarized": req.payload, "code": req.code})))
}

async fn translate(req: Request) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::ok(json!({"translated": req.payload, "code": req.code})))
}
