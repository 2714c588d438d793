use std::path::PathBuf;

use thiserror::Error;

use crate::document::MessageKind;

/// Errors raised while loading a topology or resolving routes.
///
/// All of these are configuration errors and are never retried.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Topology document not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("Service '{0}' is not declared in the topology")]
    ServiceNotDeclared(String),

    #[error("Message code '{code}' is not declared for service '{service}'")]
    RouteNotFound { service: String, code: String },

    #[error("Message code '{code}' is declared twice in {kind} of service '{service}'")]
    DuplicateMessageCode {
        service: String,
        kind: MessageKind,
        code: String,
    },

    #[error("Malformed topology document: {0}")]
    Malformed(String),

    #[error("IO error reading topology: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for TopologyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TopologyError>;
