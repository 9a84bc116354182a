use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Separator between server and tool in a namespaced tool name.
/// Forbidden inside server names so the split is unambiguous.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build the globally unique `{server}__{tool}` name.
pub fn namespaced_name(server_name: &str, tool_name: &str) -> String {
    format!("{server_name}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Split a namespaced name on the first `"__"` into (server, tool).
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

/// Transport used to reach a downstream MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Stdio,
    Sse,
}

/// Authentication style configured for a downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    None,
    Static,
    Forward,
}

/// Advisory connection mode hint for a downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Stateless,
    Stateful,
}

/// Health status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Error,
    Unknown,
}

/// Authentication configuration, stored separately from the server record
/// when the type is not `none`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default = "default_header_name")]
    pub header_name: String,
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

impl AuthConfig {
    #[allow(dead_code)]
    pub fn none() -> Self {
        Self {
            auth_type: AuthType::None,
            headers: None,
            header_name: default_header_name(),
            header_prefix: default_header_prefix(),
        }
    }
}

fn default_header_name() -> String {
    "Authorization".to_string()
}

fn default_header_prefix() -> String {
    "Bearer".to_string()
}

/// Request to register a new downstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub name: String,
    /// MCP endpoint URL, or the command for stdio transport.
    pub url: String,
    pub transport: Transport,
    /// Command to spawn for stdio transport (falls back to `url`).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    pub connection_mode: ConnectionMode,
    pub auth: AuthConfig,
    #[serde(default = "default_true")]
    pub auto_discover: bool,
}

fn default_true() -> bool {
    true
}

/// A registered downstream server as persisted in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    pub url: String,
    pub transport: Transport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    pub connection_mode: ConnectionMode,
    pub auth_type: AuthType,
    pub status: ServerStatus,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A tool as reported by a downstream server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub input_schema: Value,
}

/// Per-tool metadata persisted under `gateway:tool_meta:{namespaced_name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub namespaced_name: String,
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub input_schema: Value,
}

impl ToolMetadata {
    pub fn from_descriptor(server_name: &str, tool: &ToolDescriptor) -> Self {
        Self {
            namespaced_name: namespaced_name(server_name, &tool.name),
            server_name: server_name.to_string(),
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

/// Reference to an indexed tool, returned by search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReference {
    pub server_name: String,
    pub tool_name: String,
    pub namespaced_name: String,
    pub description: String,
    pub input_schema: Value,
    pub defer_loading: bool,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
