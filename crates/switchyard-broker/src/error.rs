use thiserror::Error;

/// Errors raised by broker transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached or the connection failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker refused the connection (bad credentials, unknown vhost, ...).
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The channel or its connection has already been closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// A queue referenced by an operation does not exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The broker rejected an operation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The requested backend is not compiled in.
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),
}

impl TransportError {
    /// Returns true if retrying the operation on a fresh connection may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionRefused(_) | Self::ChannelClosed
        )
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(feature = "amqp")]
impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                Self::ChannelClosed
            }
            lapin::Error::IOError(e) => Self::Connection(e.to_string()),
            lapin::Error::ProtocolError(e) => Self::Protocol(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}
