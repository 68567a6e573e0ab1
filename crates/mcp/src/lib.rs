//! MCP client for switchboard.
//!
//! - [`Connector`]: one server connection with cached tools/resources/prompts
//! - [`Peer`]: request correlation, timeouts and progress shared by all transports
//! - transports: stdio (`transport`), streamable HTTP (`http_transport`),
//!   WebSocket (`ws_transport`) and in-process (`memory`)
//! - [`McpClient`]: named connectors for every configured server

pub mod client;
pub mod connector;
pub mod error;
pub mod http_transport;
pub mod memory;
pub mod peer;
pub mod traits;
pub mod transport;
pub mod ws_transport;

pub use {
    client::McpClient,
    connector::{Connector, ConnectorOptions, ConnectorState, NotificationHandler},
    error::{Error, Result, TransportError, TransportResult},
    http_transport::HttpTransport,
    memory::{MemoryServer, MemoryTransport},
    peer::{CallToolOptions, DEFAULT_REQUEST_TIMEOUT, Peer, ProgressCallback, RequestOptions},
    traits::{ElicitationHandler, EventSender, McpTransport, SamplingHandler, TransportEvent},
    transport::StdioTransport,
    ws_transport::WebSocketTransport,
};
