use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{
        router::tool::ToolRouter as McpToolRouter, tool::ToolCallContext, wrapper::Parameters,
    },
    model::*,
    schemars,
    service::RequestContext,
    tool, tool_router,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::{ServerRecord, ToolDescriptor, ToolReference, split_namespaced};
use crate::registry::{RegistryError, ServerRegistry};
use crate::router::{CallSpec, RouterError, ToolRouter};
use crate::search::{SearchError, SearchIndex};

/// Longest accepted `tool_search` query.
const MAX_QUERY_LEN: usize = 200;

// --- Parameter structs for the gateway-owned tools ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ToolSearchParams {
    /// Natural language query (BM25) or regex pattern if use_regex is set.
    pub query: String,
    /// Maximum number of results (clamped to 1-10).
    #[serde(default = "default_max_results")]
    pub max_results: i64,
    /// Treat the query as a regex pattern instead of BM25 keywords.
    #[serde(default)]
    pub use_regex: bool,
}

fn default_max_results() -> i64 {
    3
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CallRemoteToolParams {
    /// Full tool name in the form 'server__tool' (e.g. 'context7__query-docs').
    pub tool_name: String,
    /// Tool arguments forwarded verbatim to the downstream server.
    #[serde(default)]
    pub arguments: Option<JsonObject>,
    /// Auth header for this call, overriding the registered auth config.
    #[serde(default)]
    pub auth_header: Option<String>,
}

/// A deferred tool promoted to a live, invocable tool.
#[derive(Debug, Clone)]
struct ActiveTool {
    server_name: String,
    tool_name: String,
    description: String,
    input_schema: Value,
}

/// The gateway's own MCP server: two meta-tools plus every activated
/// downstream tool under its namespaced name.
#[derive(Clone)]
pub struct GatewayServer {
    registry: Arc<ServerRegistry>,
    search: Arc<RwLock<SearchIndex>>,
    router: Arc<ToolRouter>,
    /// Activated tools, keyed by namespaced name. Membership doubles as the
    /// idempotency set for deferred activation.
    active_tools: Arc<DashMap<String, ActiveTool>>,
    mcp_router: McpToolRouter<Self>,
}

impl GatewayServer {
    pub fn new(
        registry: Arc<ServerRegistry>,
        search: Arc<RwLock<SearchIndex>>,
        router: Arc<ToolRouter>,
    ) -> Self {
        Self {
            registry,
            search,
            router,
            active_tools: Arc::new(DashMap::new()),
            mcp_router: Self::tool_router(),
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Index freshly discovered tools for search.
    pub async fn index_tools(&self, server_name: &str, tools: &[ToolDescriptor]) {
        self.search.write().await.index_tools(server_name, tools);
    }

    /// Drop a server's tools from the search index.
    #[allow(dead_code)]
    pub async fn deindex_server(&self, server_name: &str) {
        self.search.write().await.remove_server_tools(server_name);
    }

    /// Rebuild the in-memory search index from stored tool metadata. The
    /// index is a derived view; this brings it up to date with persistent
    /// state (e.g. after a restart against a remote storage backend).
    pub async fn rebuild_search_index(&self) -> Result<usize, RegistryError> {
        let metadata = self.registry.get_all_tool_metadata().await?;
        let mut index = self.search.write().await;
        index.index_all_metadata(&metadata);
        Ok(metadata.len())
    }

    /// Eagerly promote a discovered tool to a live tool (bootstrap
    /// `expose_tools`). Idempotent.
    pub fn expose_tool(&self, server_name: &str, tool: &ToolDescriptor) {
        let namespaced = crate::models::namespaced_name(server_name, &tool.name);
        self.active_tools.entry(namespaced).or_insert_with(|| ActiveTool {
            server_name: server_name.to_string(),
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        });
    }

    /// Number of currently activated downstream tools.
    pub fn active_tool_count(&self) -> usize {
        self.active_tools.len()
    }

    /// Promote search hits to live tools. Skips already-active names and
    /// names with no stored metadata.
    async fn activate_tools(&self, refs: &[ToolReference]) -> Result<(), RegistryError> {
        for reference in refs {
            let namespaced = &reference.namespaced_name;
            if self.active_tools.contains_key(namespaced) {
                continue;
            }

            let Some((server_name, tool_name)) = split_namespaced(namespaced) else {
                warn!(tool = %namespaced, "invalid namespaced tool name, skipping activation");
                continue;
            };

            let Some(meta) = self.registry.get_tool_metadata(namespaced).await? else {
                warn!(tool = %namespaced, "metadata not found for tool, skipping activation");
                continue;
            };

            self.active_tools.insert(
                namespaced.clone(),
                ActiveTool {
                    server_name: server_name.to_string(),
                    tool_name: tool_name.to_string(),
                    description: meta.description,
                    input_schema: meta.input_schema,
                },
            );
            debug!(tool = %namespaced, "activated deferred tool");
        }
        Ok(())
    }

    /// Forward one call to a downstream server through the router.
    async fn route_call(
        &self,
        record: &ServerRecord,
        tool_name: &str,
        arguments: Option<JsonObject>,
        auth_headers: Option<HashMap<String, String>>,
    ) -> Result<CallToolResult, RouterError> {
        self.router
            .call_tool(CallSpec {
                server_name: record.name.clone(),
                url: record.url.clone(),
                tool_name: tool_name.to_string(),
                arguments,
                transport: record.transport,
                command: record.command.clone(),
                args: record.args.clone().unwrap_or_default(),
                env: record.env.clone().unwrap_or_default(),
                server_auth_headers: auth_headers,
                client_auth_header: None,
            })
            .await
    }

    /// Dispatch a call to an activated downstream tool.
    async fn call_active_tool(
        &self,
        request: CallToolRequestParams,
    ) -> Result<CallToolResult, McpError> {
        let name = request.name.to_string();
        let Some(active) = self.active_tools.get(&name).map(|entry| entry.value().clone())
        else {
            return Err(McpError::invalid_params(
                format!("Unknown tool '{name}'. Use tool_search to discover tools."),
                None,
            ));
        };

        let record = self
            .registry
            .get(&active.server_name)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?
            .ok_or_else(|| {
                McpError::invalid_params(
                    format!("Server '{}' not found", active.server_name),
                    None,
                )
            })?;

        let auth_headers = self
            .registry
            .get_auth_config(&active.server_name)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?
            .and_then(|config| config.headers);

        match self
            .route_call(&record, &active.tool_name, request.arguments, auth_headers)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    fn json_result(payload: &Value, is_error: bool) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(payload)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let content = vec![Content::text(text)];
        Ok(if is_error {
            CallToolResult::error(content)
        } else {
            CallToolResult::success(content)
        })
    }

    fn search_failure(error_code: &str, message: String) -> Result<CallToolResult, McpError> {
        Self::json_result(
            &json!({
                "success": false,
                "error_code": error_code,
                "error": message,
            }),
            true,
        )
    }
}

#[tool_router]
impl GatewayServer {
    #[tool(
        description = "Search for tools across all registered MCP servers using BM25 relevance ranking or regex pattern matching. Searches tool names, descriptions and argument names/descriptions, and returns tool_reference blocks for the discovered tools."
    )]
    pub async fn tool_search(
        &self,
        Parameters(params): Parameters<ToolSearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let max_results = params.max_results.clamp(1, 10) as usize;

        if params.query.chars().count() > MAX_QUERY_LEN {
            return Self::search_failure(
                "query_too_long",
                format!("Query exceeds {MAX_QUERY_LEN} character limit"),
            );
        }

        let search_result = {
            let index = self.search.read().await;
            index.search(&params.query, max_results, params.use_regex)
        };

        let refs = match search_result {
            Ok(refs) => refs,
            Err(SearchError::InvalidPattern(message)) => {
                warn!(query = %params.query, error = %message, "invalid regex pattern");
                return Self::search_failure(
                    "invalid_pattern",
                    format!("Invalid regex pattern: {message}"),
                );
            }
        };

        if let Err(e) = self.activate_tools(&refs).await {
            warn!(error = %e, "tool activation failed");
            return Self::search_failure("unavailable", format!("Search service error: {e}"));
        }

        let tool_references: Vec<Value> = refs
            .iter()
            .map(|r| {
                json!({
                    "type": "tool_reference",
                    "tool_name": r.namespaced_name,
                })
            })
            .collect();

        // Full metadata for clients that do not resolve tool references
        let tools: Vec<Value> = refs
            .iter()
            .map(|r| {
                json!({
                    "type": "tool_reference",
                    "tool_name": r.namespaced_name,
                    "description": r.description,
                    "input_schema": r.input_schema,
                })
            })
            .collect();

        Self::json_result(
            &json!({
                "success": true,
                "tool_references": tool_references,
                "tools": tools,
                "total_matches": refs.len(),
                "query": params.query,
                "search_type": if params.use_regex { "regex" } else { "bm25" },
            }),
            false,
        )
    }

    #[tool(
        description = "Call a tool directly on a registered downstream MCP server. The tool name must be in the format 'server_name__tool_name' (e.g. 'context7__query-docs'). Returns the raw tool result from the remote server."
    )]
    pub async fn call_remote_tool(
        &self,
        Parameters(params): Parameters<CallRemoteToolParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some((server_name, tool_name)) = split_namespaced(&params.tool_name) else {
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "Invalid tool name format '{}'. Expected format: 'server_name__tool_name'.",
                params.tool_name
            ))]));
        };

        let record = match self.registry.get(server_name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Ok(CallToolResult::error(vec![Content::text(format!(
                    "Server '{server_name}' not found. Add it to the server config to register."
                ))]));
            }
            Err(e) => return Err(McpError::internal_error(e.to_string(), None)),
        };

        // Explicit header wins over the registered auth config
        let auth_headers = match &params.auth_header {
            Some(header) => Some(HashMap::from([(
                "Authorization".to_string(),
                header.clone(),
            )])),
            None => self
                .registry
                .get_auth_config(server_name)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))?
                .and_then(|config| config.headers),
        };

        match self
            .route_call(&record, tool_name, params.arguments.clone(), auth_headers)
            .await
        {
            // Raw downstream result, returned verbatim
            Ok(result) => Ok(result),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "toolgate is an MCP gateway that aggregates tools from downstream MCP servers.\n\n\
                 Workflow:\n\
                 1. tool_search(\"your task\") finds matching downstream tools and activates them\n\
                 2. call_remote_tool(\"server__tool\", {args}) invokes any registered tool directly\n\
                 3. activated tools also appear in tools/list under their namespaced names"
                    .into(),
            ),
        }
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "tool_search" | "call_remote_tool" => {
                let ctx = ToolCallContext::new(self, request, context);
                self.mcp_router.call(ctx).await
            }
            _ => self.call_active_tool(request).await,
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let mut tools = self.mcp_router.list_all();

        // Activated downstream tools surface their stored input schema
        // through the native schema hook
        for entry in self.active_tools.iter() {
            let active = entry.value();
            let schema = match &active.input_schema {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            tools.push(Tool {
                name: entry.key().clone().into(),
                title: None,
                description: Some(active.description.clone().into()),
                input_schema: Arc::new(schema),
                output_schema: None,
                icons: None,
                annotations: None,
                execution: None,
                meta: None,
            });
        }

        Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools,
        })
    }
}
