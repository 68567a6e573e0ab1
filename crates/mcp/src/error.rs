use std::time::Duration;

use {
    switchboard_common::FromMessage,
    switchboard_protocol::{JsonRpcError, RequestId},
};

/// Failures of the physical channel under a connector.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("server process exited")]
    ProcessExited,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("session {session_id} expired on the server")]
    SessionExpired { session_id: String },
    #[error("stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connector has not completed `connect()` + `initialize()`, or has
    /// since disconnected.
    #[error("not connected")]
    NotConnected,
    /// A cache accessor was used before `initialize()` completed.
    #[error("not initialized: call initialize() first")]
    NotInitialized,
    #[error("request '{method}' (id {id}) timed out after {elapsed:?}")]
    Timeout {
        method: String,
        id: RequestId,
        elapsed: Duration,
    },
    #[error("'{method}' failed: {error}")]
    Rpc {
        method: String,
        #[source]
        error: JsonRpcError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("unknown MCP server '{0}'")]
    UnknownServer(String),
    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// JSON-RPC error code for `Rpc` failures.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { error, .. } => Some(error.code),
            _ => None,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

switchboard_common::impl_context!();
