use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::ConnectionMode;
use crate::router::{AuthMode, GatewayTransport};

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Redis,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

/// Gateway configuration, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub storage_backend: StorageKind,
    pub redis_url: String,
    /// TTL for the router's schema cache.
    pub tool_cache_ttl: Duration,
    pub default_connection_mode: ConnectionMode,
    /// Deadline for every outbound MCP session.
    pub connection_timeout: Duration,
    /// Reserved for external operations tooling; the core never retries.
    pub max_retries: u32,
    pub http_host: String,
    pub http_port: u16,
    /// Transport the gateway itself is served over.
    pub transport: GatewayTransport,
    pub auth_mode: AuthMode,
    pub server_config_path: Option<PathBuf>,
    pub log_level: String,
}

impl GatewayConfig {
    /// Read configuration from the environment, falling back to defaults on
    /// missing or unparseable values.
    pub fn from_env() -> Self {
        Self {
            storage_backend: env_parsed("STORAGE_BACKEND", StorageKind::Memory),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            tool_cache_ttl: Duration::from_secs(env_parsed("MCP_GATEWAY_TOOL_CACHE_TTL", 300u64)),
            default_connection_mode: match env_or("MCP_GATEWAY_DEFAULT_CONNECTION_MODE", "stateless")
                .as_str()
            {
                "stateful" => ConnectionMode::Stateful,
                _ => ConnectionMode::Stateless,
            },
            connection_timeout: Duration::from_secs_f64(env_parsed(
                "MCP_GATEWAY_CONNECTION_TIMEOUT",
                30.0f64,
            )),
            max_retries: env_parsed("MCP_GATEWAY_MAX_RETRIES", 3u32),
            http_host: env_or("GATEWAY_HTTP_HOST", "0.0.0.0"),
            http_port: env_parsed("GATEWAY_PORT", 8080u16),
            transport: env_parsed("GATEWAY_TRANSPORT", GatewayTransport::Stdio),
            auth_mode: env_parsed("GATEWAY_AUTH_MODE", AuthMode::Auto),
            server_config_path: Some(PathBuf::from(env_or(
                "SERVER_CONFIG_PATH",
                "server_config.json",
            ))),
            log_level: env_or("GATEWAY_LOG_LEVEL", "info"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
