//! Config schema types for the server and client halves.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Streamable HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
    /// Endpoint path serving POST/GET/DELETE. Defaults to "/mcp".
    pub path: String,
    /// Production mode honors only the configured allow-lists; development
    /// mode disables origin checking.
    pub production: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_hosts: Vec<String>,
    /// Idle time after which a session is closed. 0 disables the sweep.
    pub idle_timeout_ms: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_ms: u64,
    /// Rebuild sessions for clients that keep using an expired id.
    pub auto_create_session_on_invalid_id: bool,
    /// Minimum level for `notifications/message`. Unknown values log everything.
    pub min_log_level: String,
    /// Interval between progress heartbeats while a sampling request is outstanding.
    pub sampling_heartbeat_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
            path: "/mcp".into(),
            production: false,
            allowed_origins: Vec::new(),
            allowed_hosts: Vec::new(),
            idle_timeout_ms: 300_000,
            sweep_interval_ms: 60_000,
            auto_create_session_on_invalid_id: true,
            min_log_level: "info".into(),
            sampling_heartbeat_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sampling_heartbeat(&self) -> Duration {
        Duration::from_millis(self.sampling_heartbeat_ms)
    }
}

/// Client-side configuration: identity, defaults, and the servers to connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name sent as `clientInfo.name` during initialize.
    pub name: String,
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    /// Configured MCP servers, keyed by server name.
    #[serde(alias = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "switchboard".into(),
            request_timeout_ms: 60_000,
            mcp_servers: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Wire transport for one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    #[serde(alias = "sse", alias = "streamable-http")]
    Http,
    #[serde(alias = "ws")]
    Websocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
            Self::Websocket => write!(f, "websocket"),
        }
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Explicit transport. Inferred from `command` / `url` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    /// Command to spawn the server process (stdio transport).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for the HTTP and WebSocket transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra headers sent on every HTTP request or the WebSocket handshake.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: Some(TransportKind::Stdio),
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            enabled: true,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            transport: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            enabled: true,
        }
    }

    /// The transport to use: explicit, else `command` → stdio,
    /// `ws://`/`wss://` → websocket, anything else → http.
    pub fn transport_kind(&self) -> TransportKind {
        if let Some(kind) = self.transport {
            return kind;
        }
        if self.command.is_some() {
            return TransportKind::Stdio;
        }
        match self.url.as_deref() {
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => {
                TransportKind::Websocket
            },
            _ => TransportKind::Http,
        }
    }
}
