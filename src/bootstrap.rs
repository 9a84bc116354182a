use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::discovery::{self, DISCOVERY_TIMEOUT, DiscoveryTarget};
use crate::models::{
    AuthConfig, AuthType, ConnectionMode, ServerRegistration, ServerStatus, Transport,
};
use crate::server::GatewayServer;

/// Root of the declarative server config file.
#[derive(Debug, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default = "default_version")]
    #[allow(dead_code)]
    pub version: String,
    #[serde(default)]
    pub servers: Vec<ServerConfigEntry>,
}

/// One pre-configured server. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct ServerConfigEntry {
    pub name: String,
    pub url: String,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default = "default_connection_mode")]
    pub connection_mode: ConnectionMode,
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub auth_headers: Option<HashMap<String, String>>,
    #[serde(default = "default_header_name")]
    pub auth_header_name: String,
    #[serde(default = "default_true")]
    pub auto_discover: bool,
    /// Whether to load this server at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Expose discovered tools in tools/list immediately instead of waiting
    /// for search-driven activation.
    #[serde(default)]
    pub expose_tools: bool,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_transport() -> Transport {
    Transport::Http
}

fn default_connection_mode() -> ConnectionMode {
    ConnectionMode::Stateless
}

fn default_auth_type() -> AuthType {
    AuthType::None
}

fn default_header_name() -> String {
    "Authorization".to_string()
}

fn default_true() -> bool {
    true
}

/// Outcome of one bootstrap pass.
#[derive(Debug, Default, Serialize)]
pub struct BootstrapSummary {
    pub servers_loaded: u32,
    pub servers_failed: u32,
    pub servers_skipped: u32,
    pub total_tools: u32,
    pub servers: Vec<LoadedServer>,
}

#[derive(Debug, Serialize)]
pub struct LoadedServer {
    pub name: String,
    pub url: String,
    pub transport: Transport,
    pub tool_count: u32,
}

/// Loads and registers servers from a declarative JSON config file.
///
/// Failures are isolated per entry: one server failing to register or
/// discover never aborts the loader.
pub struct ServerConfigLoader {
    config_path: PathBuf,
}

impl ServerConfigLoader {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub async fn load_and_register(&self, gateway: &GatewayServer) -> BootstrapSummary {
        if !self.config_path.exists() {
            info!(path = %self.config_path.display(), "server config file not found");
            return BootstrapSummary::default();
        }

        let raw = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(path = %self.config_path.display(), error = %e, "failed to read server config");
                return BootstrapSummary::default();
            }
        };

        let config: ServerConfigFile = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %self.config_path.display(), error = %e, "failed to parse server config");
                return BootstrapSummary::default();
            }
        };

        // Schema violations invalidate the whole file
        if config.servers.iter().any(|entry| entry.name.is_empty()) {
            error!(
                path = %self.config_path.display(),
                "invalid server config: entries must have non-empty names"
            );
            return BootstrapSummary::default();
        }

        let mut summary = BootstrapSummary::default();

        for entry in &config.servers {
            if !entry.enabled {
                debug!(server = %entry.name, "skipping disabled server");
                summary.servers_skipped += 1;
                continue;
            }

            match self.register_entry(gateway, entry).await {
                Ok(tool_count) => {
                    summary.servers_loaded += 1;
                    summary.total_tools += tool_count;
                    summary.servers.push(LoadedServer {
                        name: entry.name.clone(),
                        url: entry.url.clone(),
                        transport: entry.transport,
                        tool_count,
                    });
                }
                Err(e) => {
                    summary.servers_failed += 1;
                    warn!(server = %entry.name, error = %e, "failed to load server from config");
                }
            }
        }

        info!(
            loaded = summary.servers_loaded,
            failed = summary.servers_failed,
            skipped = summary.servers_skipped,
            total_tools = summary.total_tools,
            "server config loaded"
        );
        if !summary.servers.is_empty() {
            let tool_summary: Vec<String> = summary
                .servers
                .iter()
                .map(|s| format!("{}({} tools)", s.name, s.tool_count))
                .collect();
            info!(servers = %tool_summary.join(", "), "bootstrap summary");
        }

        summary
    }

    async fn register_entry(
        &self,
        gateway: &GatewayServer,
        entry: &ServerConfigEntry,
    ) -> Result<u32> {
        let auth = AuthConfig {
            auth_type: entry.auth_type,
            headers: entry.auth_headers.clone(),
            header_name: entry.auth_header_name.clone(),
            header_prefix: "Bearer".to_string(),
        };

        gateway
            .registry()
            .register(ServerRegistration {
                name: entry.name.clone(),
                url: entry.url.clone(),
                transport: entry.transport,
                command: entry.command.clone(),
                args: entry.args.clone(),
                env: entry.env.clone(),
                connection_mode: entry.connection_mode,
                auth,
                auto_discover: entry.auto_discover,
            })
            .await
            .with_context(|| format!("failed to register server '{}'", entry.name))?;
        info!(server = %entry.name, "registered server from config");

        if !entry.auto_discover {
            return Ok(0);
        }

        let discovered = discovery::discover_tools(
            &DiscoveryTarget {
                server_name: entry.name.clone(),
                url: entry.url.clone(),
                transport: entry.transport,
                command: entry.command.clone(),
                args: entry.args.clone().unwrap_or_default(),
                env: entry.env.clone().unwrap_or_default(),
                auth_headers: entry.auth_headers.clone(),
            },
            DISCOVERY_TIMEOUT,
        )
        .await;

        let tools = match discovered {
            Ok(tools) => tools,
            Err(e) => {
                let _ = gateway
                    .registry()
                    .update_status(&entry.name, ServerStatus::Error, Some(e.to_string()))
                    .await;
                return Err(anyhow::Error::new(e)
                    .context(format!("tool discovery failed for '{}'", entry.name)));
            }
        };

        if tools.is_empty() {
            return Ok(0);
        }

        gateway.registry().store_tools(&entry.name, &tools).await?;
        gateway.index_tools(&entry.name, &tools).await;
        gateway
            .registry()
            .update_tool_count(&entry.name, tools.len() as u32)
            .await?;
        gateway
            .registry()
            .update_status(&entry.name, ServerStatus::Active, None)
            .await?;

        if entry.expose_tools {
            for tool in tools.iter().filter(|t| !t.name.is_empty()) {
                gateway.expose_tool(&entry.name, tool);
            }
            info!(server = %entry.name, tools = tools.len(), "exposed tools in tools/list");
        } else {
            info!(
                server = %entry.name,
                tools = tools.len(),
                "registered tools (use call_remote_tool to invoke)"
            );
        }

        Ok(tools.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerRegistry;
    use crate::router::{AuthMode, GatewayTransport, ToolRouter};
    use crate::search::SearchIndex;
    use crate::storage::memory::MemoryStorage;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    fn make_gateway() -> GatewayServer {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(ServerRegistry::new(storage));
        let search = Arc::new(RwLock::new(SearchIndex::new()));
        let router = Arc::new(ToolRouter::new(
            Duration::from_secs(5),
            Duration::from_secs(300),
            AuthMode::Auto,
            GatewayTransport::Stdio,
        ));
        GatewayServer::new(registry, search, router)
    }

    async fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_config.json");
        tokio::fs::write(&path, content).await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_missing_file_returns_zero_summary() {
        let gateway = make_gateway();
        let loader = ServerConfigLoader::new(PathBuf::from("/nonexistent/server_config.json"));
        let summary = loader.load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 0);
        assert_eq!(summary.servers_failed, 0);
        assert_eq!(summary.servers_skipped, 0);
        assert_eq!(summary.total_tools, 0);
        assert!(summary.servers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_returns_zero_summary() {
        let gateway = make_gateway();
        let (_dir, path) = write_config("not json at all").await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 0);
        assert_eq!(summary.servers_failed, 0);
    }

    #[tokio::test]
    async fn test_empty_name_invalidates_whole_file() {
        let gateway = make_gateway();
        let config = json!({
            "version": "1.0",
            "servers": [
                {"name": "good", "url": "https://a/mcp", "auto_discover": false},
                {"name": "", "url": "https://b/mcp"}
            ]
        });
        let (_dir, path) = write_config(&config.to_string()).await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 0);
        assert!(gateway.registry().get("good").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_entries_are_skipped() {
        let gateway = make_gateway();
        let config = json!({
            "version": "1.0",
            "servers": [
                {"name": "on", "url": "https://on/mcp", "auto_discover": false},
                {"name": "off", "url": "https://off/mcp", "enabled": false}
            ]
        });
        let (_dir, path) = write_config(&config.to_string()).await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 1);
        assert_eq!(summary.servers_skipped, 1);
        assert!(gateway.registry().get("on").await.unwrap().is_some());
        assert!(gateway.registry().get("off").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registers_without_discovery() {
        let gateway = make_gateway();
        let config = json!({
            "version": "1.0",
            "servers": [{
                "name": "manual",
                "url": "https://manual/mcp",
                "transport": "http",
                "auth_type": "static",
                "auth_headers": {"Authorization": "Bearer token"},
                "auto_discover": false
            }]
        });
        let (_dir, path) = write_config(&config.to_string()).await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 1);
        assert_eq!(summary.total_tools, 0);

        let record = gateway.registry().get("manual").await.unwrap().unwrap();
        assert_eq!(record.transport, Transport::Http);
        let auth = gateway
            .registry()
            .get_auth_config("manual")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth.headers.unwrap().get("Authorization").unwrap(), "Bearer token");
    }

    #[tokio::test]
    async fn test_failed_discovery_is_isolated() {
        let gateway = make_gateway();
        // Middle server's discovery fails (unspawnable command); the others
        // load fine without discovery
        let config = json!({
            "version": "1.0",
            "servers": [
                {"name": "first", "url": "https://first/mcp", "auto_discover": false},
                {
                    "name": "second",
                    "url": "/nonexistent/toolgate-test-binary",
                    "transport": "stdio",
                    "auto_discover": true
                },
                {"name": "third", "url": "https://third/mcp", "auto_discover": false}
            ]
        });
        let (_dir, path) = write_config(&config.to_string()).await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 2);
        assert_eq!(summary.servers_failed, 1);
        assert_eq!(summary.servers_skipped, 0);

        // The third server still loaded despite the second failing
        assert!(gateway.registry().get("third").await.unwrap().is_some());

        // The failing server is marked errored with a health-check stamp
        let second = gateway.registry().get("second").await.unwrap().unwrap();
        assert_eq!(second.status, ServerStatus::Error);
        assert!(second.error_message.is_some());
        assert!(second.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_name_counts_as_failed() {
        let gateway = make_gateway();
        let config = json!({
            "version": "1.0",
            "servers": [
                {"name": "dup", "url": "https://one/mcp", "auto_discover": false},
                {"name": "dup", "url": "https://two/mcp", "auto_discover": false}
            ]
        });
        let (_dir, path) = write_config(&config.to_string()).await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;

        assert_eq!(summary.servers_loaded, 1);
        assert_eq!(summary.servers_failed, 1);
        // First registration wins
        let record = gateway.registry().get("dup").await.unwrap().unwrap();
        assert_eq!(record.url, "https://one/mcp");
    }

    #[tokio::test]
    async fn test_unknown_fields_are_ignored() {
        let gateway = make_gateway();
        let config = json!({
            "version": "1.0",
            "future_field": {"nested": true},
            "servers": [{
                "name": "fwd",
                "url": "https://fwd/mcp",
                "auto_discover": false,
                "another_unknown": 42
            }]
        });
        let (_dir, path) = write_config(&config.to_string()).await;
        let summary = ServerConfigLoader::new(path).load_and_register(&gateway).await;
        assert_eq!(summary.servers_loaded, 1);
    }

    #[test]
    fn test_entry_defaults() {
        let entry: ServerConfigEntry =
            serde_json::from_value(json!({"name": "s", "url": "https://s/mcp"})).unwrap();
        assert_eq!(entry.transport, Transport::Http);
        assert_eq!(entry.connection_mode, ConnectionMode::Stateless);
        assert_eq!(entry.auth_type, AuthType::None);
        assert_eq!(entry.auth_header_name, "Authorization");
        assert!(entry.auto_discover);
        assert!(entry.enabled);
        assert!(!entry.expose_tools);
    }
}
