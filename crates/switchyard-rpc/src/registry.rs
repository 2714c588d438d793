//! Handler registry consulted by consumer loops.
//!
//! Populated by the business layer before the supervisor starts and only read
//! afterwards. Registering a code twice replaces the earlier handler.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use switchyard_broker::Headers;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{ErrorKind, DEFAULT_STATUS};

/// A decoded inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub code: String,
    pub payload: Value,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub result: Value,
    pub status: u16,
}

impl HandlerOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            status: DEFAULT_STATUS,
        }
    }

    pub fn with_status(status: u16, result: Value) -> Self {
        Self { result, status }
    }
}

/// A failure raised by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Failed { message: String, status: u16 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    /// A generic failure reported with status 500.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            status: ErrorKind::HandlerFailed.status(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            status,
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Failed { .. } => ErrorKind::HandlerFailed,
            Self::InvalidPayload(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Failed { status, .. } => *status,
            Self::InvalidPayload(_) => ErrorKind::InvalidRequest.status(),
        }
    }
}

/// Business logic bound to a message code.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<HandlerOutput, HandlerError>;
}

/// A registered handler with its metadata.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub code: String,
    pub description: Option<String>,
    /// JSON schema of the expected payload.
    pub parameters: Option<Value>,
    pub handler: Arc<dyn Handler>,
}

impl HandlerDescriptor {
    pub fn new(code: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            code: code.into(),
            description: None,
            parameters: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("code", &self.code)
            .field("description", &self.description)
            .field("parameters", &self.parameters.is_some())
            .finish_non_exhaustive()
    }
}

/// Message code to handler map.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a handler to a code, replacing any earlier binding.
    pub fn register(&self, code: impl Into<String>, handler: impl Handler) {
        self.register_descriptor(HandlerDescriptor::new(code, handler));
    }

    pub fn register_descriptor(&self, descriptor: HandlerDescriptor) {
        let code = descriptor.code.clone();
        if self.handlers.insert(code.clone(), descriptor).is_some() {
            warn!(code = %code, "handler replaced");
        } else {
            debug!(code = %code, "handler registered");
        }
    }

    pub fn lookup(&self, code: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(code).map(|d| Arc::clone(&d.handler))
    }

    pub fn descriptor(&self, code: &str) -> Option<HandlerDescriptor> {
        self.handlers.get(code).map(|d| d.value().clone())
    }

    /// Registered codes, sorted.
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handler backed by an async closure over the raw request.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `Fn(Request) -> Future<Output = Result<HandlerOutput, HandlerError>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<HandlerOutput, HandlerError> {
        (self.f)(request).await
    }
}

/// Handler that decodes the payload into `Req` and encodes `Resp`.
pub struct TypedHandler<Req, Resp, F> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// Wraps `Fn(Req) -> Future<Output = Result<Resp, HandlerError>>`.
///
/// Payloads that do not decode into `Req` fail with
/// [`HandlerError::InvalidPayload`].
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<HandlerOutput, HandlerError> {
        let input: Req = serde_json::from_value(request.payload)
            .map_err(|e| HandlerError::invalid_payload(e.to_string()))?;
        let output = (self.f)(input).await?;
        let result = serde_json::to_value(output).map_err(|e| HandlerError::new(e.to_string()))?;
        Ok(HandlerOutput::ok(result))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn request(payload: Value) -> Request {
        Request {
            code: "Test".to_string(),
            payload,
            headers: Headers::new(),
            correlation_id: None,
            redelivered: false,
        }
    }

    fn constant(value: &'static str) -> impl Handler {
        handler_fn(move |_req| async move { Ok(HandlerOutput::ok(json!(value))) })
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register("Ping", constant("pong"));

        let handler = registry.lookup("Ping").unwrap();
        let output = handler.handle(request(json!({}))).await.unwrap();
        assert_eq!(output, HandlerOutput::ok(json!("pong")));
        assert!(registry.lookup("Missing").is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register("Ping", constant("first"));
        registry.register("Ping", constant("second"));

        assert_eq!(registry.len(), 1);
        let output = registry
            .lookup("Ping")
            .unwrap()
            .handle(request(Value::Null))
            .await
            .unwrap();
        assert_eq!(output.result, json!("second"));
    }

    #[test]
    fn descriptors_keep_metadata() {
        let registry = HandlerRegistry::new();
        registry.register_descriptor(
            HandlerDescriptor::new("Search", constant("x"))
                .with_description("Full text search")
                .with_parameters(json!({"type": "object"})),
        );
        registry.register("Alpha", constant("a"));

        let descriptor = registry.descriptor("Search").unwrap();
        assert_eq!(descriptor.description.as_deref(), Some("Full text search"));
        assert_eq!(descriptor.parameters, Some(json!({"type": "object"})));
        assert_eq!(registry.codes(), ["Alpha", "Search"]);
    }

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn typed_handlers_decode_payloads() {
        let handler = typed_handler(|req: Add| async move { Ok::<_, HandlerError>(req.a + req.b) });

        let output = handler.handle(request(json!({"a": 2, "b": 3}))).await.unwrap();
        assert_eq!(output, HandlerOutput::ok(json!(5)));

        let err = handler
            .handle(request(json!({"a": "two"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn handler_errors_carry_status() {
        assert_eq!(HandlerError::new("boom").status(), 500);
        assert_eq!(HandlerError::with_status(409, "conflict").status(), 409);
        assert_eq!(HandlerError::new("boom").kind(), ErrorKind::HandlerFailed);
    }
}
