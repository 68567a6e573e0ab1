//! Configuration loading, env substitution, and validation.
//!
//! Config files: `switchboard.toml`, `switchboard.yaml`, `switchboard.yml` or
//! `switchboard.json`, searched in `./` then the user config directory.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in all values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, load_config, load_or_discover},
    schema::{ClientConfig, McpServerConfig, ServerConfig, SwitchboardConfig, TransportKind},
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
