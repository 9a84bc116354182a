use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::models::{
    AuthConfig, AuthType, NAMESPACE_SEPARATOR, ServerRecord, ServerRegistration, ServerStatus,
    ToolDescriptor, ToolMetadata, namespaced_name,
};
use crate::storage::{StorageBackend, StorageError};

/// Hash of all registered servers, field name -> ServerRecord.
const SERVERS_KEY: &str = "gateway:servers";
const TOOL_META_PREFIX: &str = "gateway:tool_meta:";

fn auth_key(name: &str) -> String {
    format!("gateway:server:{name}:auth")
}

fn tools_key(name: &str) -> String {
    format!("gateway:server:{name}:tools")
}

fn meta_key(namespaced: &str) -> String {
    format!("{TOOL_META_PREFIX}{namespaced}")
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server '{0}' is already registered")]
    Conflict(String),

    #[error("invalid server name '{0}': must be non-empty and must not contain '__'")]
    InvalidName(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Registry for downstream MCP servers and their discovered tools.
///
/// Records are created by `register`, mutated only by `update_status`,
/// `update_tool_count` and `store_tools`, and destroyed by `unregister`,
/// which also removes the auth config, the tool bundle, and every
/// per-tool metadata key for the server.
pub struct ServerRegistry {
    storage: Arc<dyn StorageBackend>,
}

impl ServerRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn register(
        &self,
        registration: ServerRegistration,
    ) -> Result<ServerRecord, RegistryError> {
        if registration.name.is_empty() || registration.name.contains(NAMESPACE_SEPARATOR) {
            return Err(RegistryError::InvalidName(registration.name));
        }
        if self.get(&registration.name).await?.is_some() {
            return Err(RegistryError::Conflict(registration.name));
        }

        let record = ServerRecord {
            name: registration.name.clone(),
            url: registration.url,
            transport: registration.transport,
            command: registration.command,
            args: registration.args,
            env: registration.env,
            connection_mode: registration.connection_mode,
            auth_type: registration.auth.auth_type,
            status: ServerStatus::Unknown,
            registered_at: Utc::now(),
            last_health_check: None,
            tool_count: 0,
            error_message: None,
        };

        self.storage
            .hset(SERVERS_KEY, &record.name, serde_json::to_value(&record)?)
            .await?;

        // Auth config lives in its own hash, only when auth is in play
        if registration.auth.auth_type != AuthType::None {
            self.storage
                .hset(
                    &auth_key(&record.name),
                    "config",
                    serde_json::to_value(&registration.auth)?,
                )
                .await?;
        }

        debug!(server = %record.name, "server registered");
        Ok(record)
    }

    /// Unregister a server, removing its record, auth config, tool bundle
    /// and all per-tool metadata. Returns false if the server was unknown.
    #[allow(dead_code)]
    pub async fn unregister(&self, name: &str) -> Result<bool, RegistryError> {
        if self.get(name).await?.is_none() {
            return Ok(false);
        }

        self.storage.hdel(SERVERS_KEY, name).await?;
        self.storage.delete(&auth_key(name)).await?;
        self.storage.delete(&tools_key(name)).await?;
        self.remove_tool_metadata(name).await?;

        debug!(server = %name, "server unregistered");
        Ok(true)
    }

    pub async fn get(&self, name: &str) -> Result<Option<ServerRecord>, RegistryError> {
        match self.storage.hget(SERVERS_KEY, name).await? {
            Some(data) => Ok(Some(
                serde_json::from_value(data).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        let servers = self.storage.hgetall(SERVERS_KEY).await?;
        servers
            .into_values()
            .map(|data| {
                serde_json::from_value(data)
                    .map_err(StorageError::from)
                    .map_err(RegistryError::from)
            })
            .collect()
    }

    /// Update health status. Also stamps `last_health_check`. Returns false
    /// on unknown name.
    pub async fn update_status(
        &self,
        name: &str,
        status: ServerStatus,
        error_message: Option<String>,
    ) -> Result<bool, RegistryError> {
        let Some(mut record) = self.get(name).await? else {
            return Ok(false);
        };

        record.status = status;
        record.last_health_check = Some(Utc::now());
        if error_message.is_some() {
            record.error_message = error_message;
        }

        self.storage
            .hset(SERVERS_KEY, name, serde_json::to_value(&record)?)
            .await?;
        Ok(true)
    }

    pub async fn update_tool_count(&self, name: &str, count: u32) -> Result<bool, RegistryError> {
        let Some(mut record) = self.get(name).await? else {
            return Ok(false);
        };

        record.tool_count = count;
        self.storage
            .hset(SERVERS_KEY, name, serde_json::to_value(&record)?)
            .await?;
        Ok(true)
    }

    pub async fn get_auth_config(&self, name: &str) -> Result<Option<AuthConfig>, RegistryError> {
        match self.storage.hget(&auth_key(name), "config").await? {
            Some(data) => Ok(Some(
                serde_json::from_value(data).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Store the tool bundle for a server plus a metadata entry per tool.
    /// Tools with empty names stay in the bundle but get no metadata key.
    pub async fn store_tools(
        &self,
        name: &str,
        tools: &[ToolDescriptor],
    ) -> Result<(), RegistryError> {
        self.storage
            .set(&tools_key(name), serde_json::to_value(tools)?, None)
            .await?;

        for tool in tools.iter().filter(|t| !t.name.is_empty()) {
            self.store_tool_metadata(name, tool).await?;
        }
        Ok(())
    }

    pub async fn store_tool_metadata(
        &self,
        server_name: &str,
        tool: &ToolDescriptor,
    ) -> Result<(), RegistryError> {
        let metadata = ToolMetadata::from_descriptor(server_name, tool);
        self.storage
            .set(
                &meta_key(&metadata.namespaced_name),
                serde_json::to_value(&metadata)?,
                None,
            )
            .await?;
        Ok(())
    }

    /// Tool bundle for a server; empty when absent.
    #[allow(dead_code)]
    pub async fn get_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, RegistryError> {
        match self.storage.get(&tools_key(name)).await? {
            Some(data) => Ok(serde_json::from_value(data).map_err(StorageError::from)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_tool_metadata(
        &self,
        namespaced: &str,
    ) -> Result<Option<ToolMetadata>, RegistryError> {
        match self.storage.get(&meta_key(namespaced)).await? {
            Some(data) => Ok(Some(
                serde_json::from_value(data).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Metadata for all tools across all servers. Used to rebuild the
    /// search index without rediscovering downstream servers.
    pub async fn get_all_tool_metadata(&self) -> Result<Vec<ToolMetadata>, RegistryError> {
        let keys = self.storage.keys(&format!("{TOOL_META_PREFIX}*")).await?;

        let mut all = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(data) = self.storage.get(&key).await? {
                all.push(serde_json::from_value(data).map_err(StorageError::from)?);
            }
        }
        Ok(all)
    }

    /// Remove every metadata key belonging to a server.
    pub async fn remove_tool_metadata(&self, server_name: &str) -> Result<(), RegistryError> {
        let pattern = meta_key(&namespaced_name(server_name, "*"));
        for key in self.storage.keys(&pattern).await? {
            self.storage.delete(&key).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionMode, Transport};
    use crate::storage::memory::MemoryStorage;
    use serde_json::json;
    use std::collections::HashMap;

    fn make_registry() -> ServerRegistry {
        ServerRegistry::new(Arc::new(MemoryStorage::new()))
    }

    fn registration(name: &str) -> ServerRegistration {
        ServerRegistration {
            name: name.to_string(),
            url: "https://test.example.com/mcp".to_string(),
            transport: Transport::Http,
            command: None,
            args: None,
            env: None,
            connection_mode: ConnectionMode::Stateless,
            auth: AuthConfig::none(),
            auto_discover: true,
        }
    }

    fn tool(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[tokio::test]
    async fn test_register() {
        let registry = make_registry();
        let record = registry.register(registration("test-server")).await.unwrap();

        assert_eq!(record.name, "test-server");
        assert_eq!(record.status, ServerStatus::Unknown);
        assert_eq!(record.tool_count, 0);
        assert_eq!(record.auth_type, AuthType::None);
        assert!(record.last_health_check.is_none());

        // Reading back yields an equal record
        let fetched = registry.get("test-server").await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_register_duplicate_conflicts() {
        let registry = make_registry();
        registry.register(registration("test-server")).await.unwrap();

        let err = registry
            .register(registration("test-server"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(name) if name == "test-server"));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_names() {
        let registry = make_registry();

        let err = registry.register(registration("")).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));

        let err = registry
            .register(registration("bad__name"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_auth_config_stored_only_when_configured() {
        let registry = make_registry();

        let mut with_auth = registration("secured");
        with_auth.auth = AuthConfig {
            auth_type: AuthType::Static,
            headers: Some(HashMap::from([(
                "Authorization".to_string(),
                "Bearer secret".to_string(),
            )])),
            header_name: "Authorization".to_string(),
            header_prefix: "Bearer".to_string(),
        };
        registry.register(with_auth).await.unwrap();
        registry.register(registration("open")).await.unwrap();

        let auth = registry.get_auth_config("secured").await.unwrap().unwrap();
        assert_eq!(auth.auth_type, AuthType::Static);
        assert_eq!(
            auth.headers.unwrap().get("Authorization").unwrap(),
            "Bearer secret"
        );

        assert!(registry.get_auth_config("open").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregister_removes_everything() {
        let registry = make_registry();

        let mut reg = registration("s1");
        reg.auth = AuthConfig {
            auth_type: AuthType::Static,
            headers: Some(HashMap::from([(
                "Authorization".to_string(),
                "Bearer x".to_string(),
            )])),
            header_name: "Authorization".to_string(),
            header_prefix: "Bearer".to_string(),
        };
        registry.register(reg).await.unwrap();
        registry
            .store_tools("s1", &[tool("alpha", "First"), tool("beta", "Second")])
            .await
            .unwrap();

        assert!(registry.unregister("s1").await.unwrap());

        assert!(registry.get("s1").await.unwrap().is_none());
        assert!(registry.get_auth_config("s1").await.unwrap().is_none());
        assert!(registry.get_tools("s1").await.unwrap().is_empty());
        assert!(registry.get_all_tool_metadata().await.unwrap().is_empty());

        let leftover = registry
            .storage()
            .keys("gateway:tool_meta:s1__*")
            .await
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_returns_false() {
        let registry = make_registry();
        assert!(!registry.unregister("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_unregister_leaves_other_servers_intact() {
        let registry = make_registry();
        registry.register(registration("s1")).await.unwrap();
        registry.register(registration("s2")).await.unwrap();
        registry.store_tools("s1", &[tool("a", "")]).await.unwrap();
        registry.store_tools("s2", &[tool("b", "")]).await.unwrap();

        registry.unregister("s1").await.unwrap();

        let remaining = registry.get_all_tool_metadata().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].server_name, "s2");
        assert_eq!(registry.get_tools("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_all() {
        let registry = make_registry();
        registry.register(registration("a")).await.unwrap();
        registry.register(registration("b")).await.unwrap();

        let mut names: Vec<String> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_update_status() {
        let registry = make_registry();
        registry.register(registration("s1")).await.unwrap();

        assert!(
            registry
                .update_status("s1", ServerStatus::Error, Some("boom".to_string()))
                .await
                .unwrap()
        );

        let record = registry.get("s1").await.unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert!(record.last_health_check.is_some());

        // Status update without a message keeps the previous one
        registry
            .update_status("s1", ServerStatus::Active, None)
            .await
            .unwrap();
        let record = registry.get("s1").await.unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Active);
        assert_eq!(record.error_message.as_deref(), Some("boom"));

        assert!(
            !registry
                .update_status("ghost", ServerStatus::Active, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_store_tools_and_tool_count() {
        let registry = make_registry();
        registry.register(registration("s1")).await.unwrap();

        let tools = vec![tool("t1", "One"), tool("t2", "Two")];
        registry.store_tools("s1", &tools).await.unwrap();
        registry
            .update_tool_count("s1", tools.len() as u32)
            .await
            .unwrap();

        assert_eq!(registry.get("s1").await.unwrap().unwrap().tool_count, 2);
        assert_eq!(registry.get_tools("s1").await.unwrap(), tools);
        assert_eq!(registry.get_all_tool_metadata().await.unwrap().len(), 2);

        let meta = registry.get_tool_metadata("s1__t1").await.unwrap().unwrap();
        assert_eq!(meta.server_name, "s1");
        assert_eq!(meta.tool_name, "t1");
        assert_eq!(meta.description, "One");
    }

    #[tokio::test]
    async fn test_store_tools_drops_empty_names_from_metadata() {
        let registry = make_registry();
        registry.register(registration("s1")).await.unwrap();

        let tools = vec![tool("named", "Has a name"), tool("", "Anonymous")];
        registry.store_tools("s1", &tools).await.unwrap();

        // Bundle keeps both, metadata only the named tool
        assert_eq!(registry.get_tools("s1").await.unwrap().len(), 2);
        let meta = registry.get_all_tool_metadata().await.unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].tool_name, "named");
    }

    #[tokio::test]
    async fn test_metadata_round_trips_namespaced_name() {
        let registry = make_registry();
        registry.register(registration("srv")).await.unwrap();
        registry
            .store_tools("srv", &[tool("my__tool", "separator inside tool name")])
            .await
            .unwrap();

        for meta in registry.get_all_tool_metadata().await.unwrap() {
            let (server, tool_name) =
                crate::models::split_namespaced(&meta.namespaced_name).unwrap();
            assert_eq!(server, meta.server_name);
            assert_eq!(tool_name, meta.tool_name);
        }
    }

    #[tokio::test]
    async fn test_get_tools_absent_is_empty() {
        let registry = make_registry();
        assert!(registry.get_tools("ghost").await.unwrap().is_empty());
        assert!(
            registry
                .get_tool_metadata("ghost__t")
                .await
                .unwrap()
                .is_none()
        );
    }
}
