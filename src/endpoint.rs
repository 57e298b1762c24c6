//! Endpoint and tool descriptor types.
//!
//! An [`EndpointDescriptor`] declares one downstream MCP tool server. The
//! control plane owns these entirely — the agent never edits fields, it only
//! replaces whole descriptors when told to. Wire spelling is camelCase to
//! match the control-channel protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the agent reaches a downstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Spawn a child process and speak line-delimited JSON-RPC over stdio.
    #[serde(rename = "subprocess")]
    Subprocess,
    /// Streamable HTTP — JSON-RPC POSTed per request, responses possibly
    /// delivered as a one-shot SSE stream.
    #[serde(rename = "http-stream")]
    HttpStream,
    /// Legacy HTTP+SSE — persistent GET stream plus a POST message URL.
    #[serde(rename = "server-sent-events")]
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Subprocess => "subprocess",
            TransportKind::HttpStream => "http-stream",
            TransportKind::Sse => "server-sent-events",
        }
    }
}

/// Declaration of one downstream tool server, supplied by the control plane
/// (or the local endpoints file at startup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    /// Unique, stable endpoint id — the key of the orchestrator's map.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Identifies this agent to the downstream server (MCP clientInfo.name).
    pub namespace: String,
    pub transport_kind: TransportKind,
    /// Required for http-stream / server-sent-events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Required for subprocess.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment variables merged over the agent's own environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Extra HTTP headers for http-stream / server-sent-events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EndpointDescriptor {
    /// Check the command/url exclusivity invariant against the transport kind.
    pub fn validate(&self) -> Result<(), String> {
        match self.transport_kind {
            TransportKind::Subprocess => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(format!("endpoint '{}': subprocess requires a command", self.id));
                }
                if self.url.is_some() {
                    return Err(format!("endpoint '{}': subprocess must not set url", self.id));
                }
            }
            TransportKind::HttpStream | TransportKind::Sse => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(format!(
                        "endpoint '{}': {} requires a url",
                        self.id,
                        self.transport_kind.as_str()
                    ));
                }
                if self.command.is_some() {
                    return Err(format!(
                        "endpoint '{}': {} must not set command",
                        self.id,
                        self.transport_kind.as_str()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A tool discovered on a downstream endpoint, trimmed to the fields the
/// control plane cares about. Extra fields from `tools/list` are dropped at
/// deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Lifecycle state of a downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
