use std::time::Duration;

use {
    axum::http::StatusCode,
    switchboard_common::FromMessage,
    switchboard_protocol::{JsonRpcError, error_codes},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown or expired session id, or no id on a non-initialize request.
    #[error("session not found: {}", session_id.as_deref().unwrap_or("<none>"))]
    SessionNotFound { session_id: Option<String> },
    /// The synthetic initialize of a recreated session failed.
    #[error("failed to auto-initialize session {session_id}: {reason}")]
    AutoInitialization { session_id: String, reason: String },
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },
    /// Accepted elicitation content does not match the requested schema.
    #[error("elicitation response failed validation: {}", errors.join("; "))]
    ElicitationValidation { errors: Vec<String> },
    #[error("origin not allowed: {0}")]
    Forbidden(String),
    #[error("session transport failed: {0}")]
    Transport(String),
    /// The client answered a server request with an error.
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),
    #[error("unknown tool: {0}")]
    ToolNotFound(String),
    #[error("session not initialized")]
    NotInitialized,
    /// No live channel back to the client for server-initiated requests.
    #[error("no client channel for this request")]
    NoClientChannel,
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
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

    pub fn session_not_found(session_id: Option<&str>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.map(str::to_string),
        }
    }

    /// HTTP status for failures surfaced by the streamable HTTP endpoint.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotInitialized | Self::SerdeJson(_) => StatusCode::BAD_REQUEST,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error object for failures answered in-band.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Rpc(error) => error.clone(),
            Self::SessionNotFound { .. } => {
                JsonRpcError::new(error_codes::SESSION_NOT_FOUND, self.to_string())
            },
            Self::Timeout { .. } => JsonRpcError::new(error_codes::REQUEST_TIMEOUT, self.to_string()),
            Self::ToolNotFound(_) => JsonRpcError::invalid_params(self.to_string()),
            Self::ElicitationValidation { errors } => {
                JsonRpcError::invalid_params(self.to_string()).with_data(serde_json::json!({
                    "errors": errors
                }))
            },
            Self::NotInitialized => JsonRpcError::new(error_codes::INVALID_REQUEST, self.to_string()),
            Self::SerdeJson(_) => JsonRpcError::invalid_params(self.to_string()),
            _ => JsonRpcError::internal(self.to_string()),
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
