//! Broker-mediated RPC for switchyard services.
//!
//! - [`RpcClient`] turns a message code into a blocking request/response call
//!   over an exclusive reply queue
//! - [`Producer`] publishes fire-and-forget messages with bounded retry
//! - [`Messenger`] picks between the two from the service's declarations
//! - [`HandlerRegistry`] maps message codes to business handlers
//! - [`ConsumerLoop`] serves one input queue; [`ListenerSupervisor`] runs one
//!   loop per declared queue

mod client;
mod config;
mod consumer;
mod envelope;
mod error;
mod messenger;
mod producer;
mod registry;
mod supervisor;

pub use client::{RpcClient, RpcResponse};
pub use config::{ClientConfig, ProducerConfig, RpcConfig, ServerConfig, SupervisorConfig};
pub use consumer::{ConsumerLoop, ReadyCounter};
pub use envelope::{
    CorrelationId, ErrorKind, ReplyBody, RequestEnvelope, DEFAULT_STATUS, ERROR_KIND_HEADER,
    JSON_CONTENT_TYPE, STATUS_CODE_HEADER,
};
pub use error::{Result, RpcError};
pub use messenger::{Messenger, SendOutcome};
pub use producer::Producer;
pub use registry::{
    handler_fn, typed_handler, FnHandler, Handler, HandlerDescriptor, HandlerError,
    HandlerOutput, HandlerRegistry, Request, TypedHandler,
};
pub use supervisor::ListenerSupervisor;
