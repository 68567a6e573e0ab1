use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::SwitchboardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

/// Prefix for environment overrides, e.g. `SWITCHBOARD_PORT=8080`.
const ENV_PREFIX: &str = "SWITCHBOARD_";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load the explicit path when given (errors propagate), otherwise discover.
/// Environment overrides are applied in both cases.
pub fn load_or_discover(path: Option<&Path>) -> anyhow::Result<SwitchboardConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => discover_and_load(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchboard.{toml,yaml,yml,json}` (project-local)
/// 2. `<user config dir>/switchboard/switchboard.{toml,yaml,yml,json}`
///
/// Returns `SwitchboardConfig::default()` if no config file is found.
pub fn discover_and_load() -> SwitchboardConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    SwitchboardConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (e.g. `~/.config/switchboard/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "switchboard").map(|d| d.config_dir().to_path_buf())
}

/// Apply `SWITCHBOARD_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut SwitchboardConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut SwitchboardConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
    let server = &mut config.server;

    if let Some(bind) = var("BIND") {
        server.bind = bind;
    }
    if let Some(port) = parse_var(var("PORT"), "PORT") {
        server.port = port;
    }
    if let Some(production) = parse_bool(var("PRODUCTION"), "PRODUCTION") {
        server.production = production;
    }
    if let Some(origins) = var("ALLOWED_ORIGINS") {
        server.allowed_origins = split_list(&origins);
    }
    if let Some(hosts) = var("ALLOWED_HOSTS") {
        server.allowed_hosts = split_list(&hosts);
    }
    if let Some(ms) = parse_var(var("IDLE_TIMEOUT_MS"), "IDLE_TIMEOUT_MS") {
        server.idle_timeout_ms = ms;
    }
    if let Some(enabled) = parse_bool(
        var("AUTO_CREATE_SESSION_ON_INVALID_ID"),
        "AUTO_CREATE_SESSION_ON_INVALID_ID",
    ) {
        server.auto_create_session_on_invalid_id = enabled;
    }
    if let Some(level) = var("MIN_LOG_LEVEL") {
        server.min_log_level = level;
    }
    if let Some(ms) = parse_var(var("REQUEST_TIMEOUT_MS"), "REQUEST_TIMEOUT_MS") {
        config.client.request_timeout_ms = ms;
    }
}

fn parse_var<T: std::str::FromStr>(raw: Option<String>, name: &str) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %format!("{ENV_PREFIX}{name}"), value = %raw, "ignoring unparsable env override");
            None
        },
    }
}

fn parse_bool(raw: Option<String>, name: &str) -> Option<bool> {
    let raw = raw?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(var = %format!("{ENV_PREFIX}{name}"), value = %raw, "ignoring unparsable env override");
            None
        },
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::schema::TransportKind, std::io::Write};

    fn write_temp(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_toml() {
        let file = write_temp(
            ".toml",
            r#"
[server]
port = 8931
idle_timeout_ms = 1000
auto_create_session_on_invalid_id = false

[client.mcp_servers.fs]
command = "mcp-fs"
args = ["/srv"]
"#,
        );
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.server.port, 8931);
        assert_eq!(cfg.server.idle_timeout_ms, 1000);
        assert!(!cfg.server.auto_create_session_on_invalid_id);
        assert_eq!(cfg.server.path, "/mcp");
        assert_eq!(
            cfg.client.mcp_servers["fs"].transport_kind(),
            TransportKind::Stdio
        );
    }

    #[test]
    fn loads_yaml_and_json() {
        let yaml = write_temp(
            ".yaml",
            "client:\n  mcpServers:\n    remote:\n      url: ws://127.0.0.1:9001\n",
        );
        let cfg = load_config(yaml.path()).unwrap();
        assert_eq!(
            cfg.client.mcp_servers["remote"].transport_kind(),
            TransportKind::Websocket
        );

        let json = write_temp(".json", r#"{"server": {"production": true}}"#);
        assert!(load_config(json.path()).unwrap().server.production);
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = write_temp(".ini", "port=1");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let err = load_or_discover(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = SwitchboardConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "SWITCHBOARD_PORT" => Some("9100".into()),
            "SWITCHBOARD_PRODUCTION" => Some("yes".into()),
            "SWITCHBOARD_ALLOWED_ORIGINS" => Some("https://a.test, https://b.test".into()),
            "SWITCHBOARD_IDLE_TIMEOUT_MS" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(cfg.server.port, 9100);
        assert!(cfg.server.production);
        assert_eq!(cfg.server.allowed_origins, vec![
            "https://a.test".to_string(),
            "https://b.test".to_string()
        ]);
        assert_eq!(cfg.server.idle_timeout_ms, 300_000);
    }
}
