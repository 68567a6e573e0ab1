//! MCP server side: sessions, the execution context handed to tools, and
//! the streamable HTTP and stdio front ends.
//!
//! A [`McpHandler`] (usually a [`ToolRouter`]) defines what is served. The
//! [`SessionManager`] maps `mcp-session-id` values to [`StreamableSession`]
//! transports, expires idle ones, and can transparently rebuild a session
//! for a client still holding an expired id.

pub mod context;
pub mod error;
pub mod handler;
pub mod http;
pub mod manager;
pub mod registry;
pub mod security;
pub mod session;
pub mod stdio;

pub use {
    context::{
        ClientChannel, DEFAULT_SAMPLING_HEARTBEAT, ElicitOptions, ExecutionContext, Outbound,
        PendingRequests, RequestContext, SampleOptions, SampleProgressCallback,
    },
    error::{Error, Result},
    handler::{FnTool, McpHandler, ToolHandler, ToolRouter},
    http::{HttpState, router, serve, serve_with_shutdown},
    manager::{SessionManager, SessionManagerOptions},
    registry::{Readiness, SessionRecord, SessionRegistry},
    security::{TransportSecurity, get_transport_config},
    session::{
        SessionSettings, SessionTransport, StreamableSession, StreamableSessionFactory,
        TransportFactory,
    },
    stdio::{serve_stdio, serve_stream},
};
