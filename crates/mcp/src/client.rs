//! McpClient: named connectors for every server in a [`ClientConfig`].

use std::collections::HashMap;

use {
    switchboard_config::{ClientConfig, McpServerConfig},
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::{
    connector::Connector,
    error::{Error, Result},
};

/// Owns one [`Connector`] per open server session.
pub struct McpClient {
    config: ClientConfig,
    sessions: RwLock<HashMap<String, Connector>>,
}

impl McpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.config.mcp_servers.keys().cloned().collect();
        names.sort();
        names
    }

    fn server_config(&self, name: &str) -> Result<&McpServerConfig> {
        self.config
            .mcp_servers
            .get(name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }

    /// Connect to `name`, replacing any existing session for it.
    pub async fn create_session(&self, name: &str, auto_initialize: bool) -> Result<Connector> {
        let server = self.server_config(name)?;
        self.close_session(name).await;

        // Connect outside the lock.
        let connector = Connector::from_config(name, server, &self.config)?;
        connector.connect().await?;
        if auto_initialize && let Err(e) = connector.initialize().await {
            connector.disconnect().await;
            return Err(e);
        }

        self.sessions
            .write()
            .await
            .insert(name.to_string(), connector.clone());
        info!(server = %name, "MCP session created");
        Ok(connector)
    }

    /// Sessions for every enabled server. Failures are logged and skipped.
    pub async fn create_all_sessions(&self, auto_initialize: bool) -> HashMap<String, Connector> {
        let mut created = HashMap::new();
        for name in self.server_names() {
            if !self.config.mcp_servers[&name].enabled {
                continue;
            }
            match self.create_session(&name, auto_initialize).await {
                Ok(connector) => {
                    created.insert(name, connector);
                },
                Err(e) => warn!(server = %name, error = %e, "failed to create MCP session"),
            }
        }
        created
    }

    pub async fn get_session(&self, name: &str) -> Option<Connector> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Disconnect and forget one session. Returns whether one existed.
    pub async fn close_session(&self, name: &str) -> bool {
        let removed = self.sessions.write().await.remove(name);
        match removed {
            Some(connector) => {
                connector.disconnect().await;
                true
            },
            None => false,
        }
    }

    pub async fn close_all_sessions(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (name, connector) in drained {
            connector.disconnect().await;
            info!(server = %name, "MCP session closed");
        }
    }

    /// Names of sessions whose transport is still connected, sorted.
    pub async fn active_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut names: Vec<_> = sessions
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
