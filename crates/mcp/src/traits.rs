//! Trait seams between the connector and its transports and handlers.
//!
//! Transports only move JSON-RPC frames. Correlation, timeouts and progress
//! live in [`crate::peer::Peer`], shared by every transport.

use {
    async_trait::async_trait,
    switchboard_protocol::{
        JsonRpcMessage, RequestId,
        types::{CreateMessageParams, CreateMessageResult, ElicitRequestParams, ElicitResult},
    },
    tokio::sync::mpsc,
};

use crate::error::{Result, TransportError, TransportResult};

/// Something a transport observed on its channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded frame from the server.
    Message(JsonRpcMessage),
    /// Out-of-band diagnostic output, e.g. a child process's stderr line.
    Diagnostic(String),
    /// The request with this id can no longer be answered on this channel.
    Failed { id: RequestId, error: TransportError },
    /// The channel is gone; nothing further will arrive.
    Closed(TransportError),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Framing and raw I/O for one physical channel.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the channel. Incoming frames and failures are reported on `events`.
    async fn start(&self, events: EventSender) -> TransportResult<()>;

    /// Write one frame. Must not wait for the peer's reply.
    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()>;

    /// Called once the initialize handshake has completed.
    async fn on_initialized(&self) {}

    /// Server-assigned session id, for transports that carry one.
    async fn session_id(&self) -> Option<String> {
        None
    }

    fn is_alive(&self) -> bool;

    /// Tear the channel down. Idempotent.
    async fn close(&self);
}

/// Answers `sampling/createMessage` requests from the server.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult>;
}

/// Answers `elicitation/create` requests from the server.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, params: ElicitRequestParams) -> Result<ElicitResult>;
}
