//! Configuration loading for mcp-uplink.
//!
//! Configuration is resolved from three fallback sources (tried in order):
//!
//! 1. **JSON file** via `--config <path>` CLI flag
//! 2. **JSON file** via `UPLINK_CONFIG` environment variable
//! 3. **Environment variables** — `UPLINK_SERVER_URL` + `UPLINK_CREDENTIAL`
//!    (+ optional `UPLINK_AGENT_NAME`), with no locally seeded endpoints
//!
//! The JSON format carries the control-plane coordinates plus an optional
//! list of endpoint descriptors to track before the control plane pushes
//! its own state. See `uplink.example.json` for an example.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::endpoint::EndpointDescriptor;

/// Bump this when the config format changes (new required fields, renamed
/// keys, etc.). mcp-uplink will warn if the on-disk version is older, so
/// users know to update.
pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_AGENT_NAME: &str = "mcp-uplink";

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(
    name = "mcp-uplink",
    about = "Outbound agent exposing local MCP tool servers to a remote control plane"
)]
pub struct Cli {
    /// Path to agent config file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Raw JSON config file structure.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    /// Config format version — checked against `CONFIG_VERSION` to detect
    /// stale files.
    config_version: Option<u32>,
    server_url: String,
    agent_name: Option<String>,
    credential: String,
    #[serde(default)]
    endpoints: Vec<EndpointDescriptor>,
}

/// Validated configuration, immutable for the life of the process.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub server_url: String,
    pub agent_name: String,
    pub credential: String,
    /// Endpoints to track at startup, before any control-plane push.
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Load and validate configuration from CLI args, env vars, or config file.
pub fn load_config(cli: &Cli) -> Result<AgentConfig, String> {
    if let Some(path) = &cli.config {
        load_from_file(&expand_tilde(path))
    } else if let Ok(path) = std::env::var("UPLINK_CONFIG") {
        load_from_file(&expand_tilde(&PathBuf::from(path)))
    } else {
        load_from_env()
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.clone()
}

fn load_from_file(path: &PathBuf) -> Result<AgentConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

    let config: ConfigFile = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))?;

    match config.config_version {
        None => tracing::warn!(
            "{} has no configVersion field (expected {}). \
             Config may be outdated — check uplink.example.json for the current format.",
            path.display(),
            CONFIG_VERSION
        ),
        Some(v) if v < CONFIG_VERSION => tracing::warn!(
            "{} has configVersion {} but mcp-uplink expects {}. \
             Config may be outdated — check uplink.example.json for the current format.",
            path.display(),
            v,
            CONFIG_VERSION
        ),
        _ => {}
    }

    validate(AgentConfig {
        server_url: config.server_url,
        agent_name: config
            .agent_name
            .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string()),
        credential: config.credential,
        endpoints: config.endpoints,
    })
}

fn load_from_env() -> Result<AgentConfig, String> {
    let server_url = std::env::var("UPLINK_SERVER_URL")
        .map_err(|_| "No config file and UPLINK_SERVER_URL not set")?;
    let credential = std::env::var("UPLINK_CREDENTIAL")
        .map_err(|_| "No config file and UPLINK_CREDENTIAL not set")?;
    let agent_name =
        std::env::var("UPLINK_AGENT_NAME").unwrap_or_else(|_| DEFAULT_AGENT_NAME.to_string());

    validate(AgentConfig {
        server_url,
        agent_name,
        credential,
        endpoints: Vec::new(),
    })
}

fn validate(config: AgentConfig) -> Result<AgentConfig, String> {
    if config.server_url.is_empty() {
        return Err("server url is empty".into());
    }
    if !["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| config.server_url.starts_with(scheme))
    {
        return Err(format!(
            "server url '{}' must start with http(s):// or ws(s)://",
            config.server_url
        ));
    }
    if config.credential.is_empty() {
        return Err("credential is empty".into());
    }
    if config.agent_name.is_empty() {
        return Err("agent name is empty".into());
    }

    let mut seen = HashSet::new();
    for endpoint in &config.endpoints {
        endpoint.validate()?;
        if !seen.insert(endpoint.id.as_str()) {
            return Err(format!("duplicate endpoint id '{}'", endpoint.id));
        }
    }
    Ok(config)
}
