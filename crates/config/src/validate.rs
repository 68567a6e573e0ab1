//! Semantic validation of a loaded configuration.
//!
//! Reports missing transport endpoints, invalid log levels, and settings that
//! quietly weaken the server (production without allow-lists, sweeps that run
//! less often than the idle timeout).

use std::fmt;

use crate::schema::{SwitchboardConfig, TransportKind};

/// Log levels accepted by `server.min_log_level`.
const LOG_LEVELS: &[&str] = &[
    "debug",
    "info",
    "notice",
    "warning",
    "error",
    "critical",
    "alert",
    "emergency",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "transport", "security", "value"
    pub category: &'static str,
    /// Dotted path, e.g. "client.mcp_servers.fs.command"
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}: {}", self.severity, self.category, self.path, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, category: &'static str, path: String, message: String) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path,
            message,
        });
    }
}

pub fn validate(config: &SwitchboardConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    check_server(config, &mut result);
    check_mcp_servers(config, &mut result);
    result
}

fn check_server(config: &SwitchboardConfig, result: &mut ValidationResult) {
    let server = &config.server;

    if server.production && server.allowed_origins.is_empty() && server.allowed_hosts.is_empty() {
        result.push(
            Severity::Warning,
            "security",
            "server.allowed_origins".into(),
            "production mode with empty allow-lists leaves DNS rebinding protection off".into(),
        );
    }

    if !server.path.starts_with('/') {
        result.push(
            Severity::Error,
            "value",
            "server.path".into(),
            format!("path \"{}\" must start with '/'", server.path),
        );
    }

    if server.idle_timeout_ms > 0 && server.idle_timeout_ms < server.sweep_interval_ms {
        result.push(
            Severity::Warning,
            "value",
            "server.sweep_interval_ms".into(),
            format!(
                "sweep_interval_ms {} exceeds idle_timeout_ms {}; the sweep will run every idle_timeout_ms",
                server.sweep_interval_ms, server.idle_timeout_ms
            ),
        );
    }

    if !LOG_LEVELS.contains(&server.min_log_level.to_ascii_lowercase().as_str()) {
        result.push(
            Severity::Warning,
            "value",
            "server.min_log_level".into(),
            format!(
                "unknown level \"{}\"; every message will be sent. Expected one of: {}",
                server.min_log_level,
                LOG_LEVELS.join(", ")
            ),
        );
    }
}

fn check_mcp_servers(config: &SwitchboardConfig, result: &mut ValidationResult) {
    let mut names: Vec<_> = config.client.mcp_servers.keys().collect();
    names.sort();

    for name in names {
        let Some(entry) = config.client.mcp_servers.get(name) else {
            continue;
        };
        let base = format!("client.mcp_servers.{name}");
        match entry.transport_kind() {
            TransportKind::Stdio => {
                if entry.command.as_deref().is_none_or(str::is_empty) {
                    result.push(
                        Severity::Error,
                        "transport",
                        format!("{base}.command"),
                        "stdio transport requires a command".into(),
                    );
                }
            },
            kind @ (TransportKind::Http | TransportKind::Websocket) => match entry.url.as_deref() {
                None | Some("") => result.push(
                    Severity::Error,
                    "transport",
                    format!("{base}.url"),
                    format!("{kind} transport requires a url"),
                ),
                Some(url) if url::Url::parse(url).is_err() => result.push(
                    Severity::Error,
                    "transport",
                    format!("{base}.url"),
                    format!("\"{url}\" is not a valid URL"),
                ),
                Some(_) => {},
            },
        }
    }
}
