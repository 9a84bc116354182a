use dashmap::DashMap;
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParams, CallToolResult},
    service::RunningService,
    transport::{
        ConfigureCommandExt, SseClientTransport, TokioChildProcess,
        sse_client::SseClientConfig,
        streamable_http_client::{
            StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
        },
    },
};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Transport, namespaced_name};

/// How the gateway resolves auth headers for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Auto,
    Static,
    Forward,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "static" => Ok(Self::Static),
            "forward" => Ok(Self::Forward),
            other => Err(format!("unknown auth mode '{other}'")),
        }
    }
}

/// Transport the gateway itself is served over. In `auto` auth mode this
/// decides whether client auth headers are forwarded downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayTransport {
    Stdio,
    Sse,
    Http,
    StreamableHttp,
}

impl GatewayTransport {
    fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::StreamableHttp)
    }
}

impl FromStr for GatewayTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "http" => Ok(Self::Http),
            "streamable-http" => Ok(Self::StreamableHttp),
            other => Err(format!("unknown gateway transport '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid HTTP URL for server '{server}': {url}")]
    InvalidUrl { server: String, url: String },

    #[error("call to server '{server}' timed out after {timeout:?}")]
    Timeout { server: String, timeout: Duration },

    #[error("failed to connect to server '{server}': {message}")]
    Connection { server: String, message: String },

    #[error("tool call '{tool}' on server '{server}' failed: {message}")]
    Call {
        server: String,
        tool: String,
        message: String,
    },

    #[error("tool discovery on server '{server}' failed: {message}")]
    Discovery { server: String, message: String },
}

pub(crate) type McpSession = RunningService<rmcp::RoleClient, ()>;

/// Everything needed to open an MCP session to one downstream server.
pub(crate) struct SessionTarget<'a> {
    pub server_name: &'a str,
    pub url: &'a str,
    pub transport: Transport,
    pub command: Option<&'a str>,
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub headers: Option<&'a HashMap<String, String>>,
    pub timeout: Duration,
}

/// Open one MCP client session. `serve` performs the initialize handshake.
/// The caller owns teardown: `cancel()` on success paths, drop on timeout.
pub(crate) async fn open_session(target: &SessionTarget<'_>) -> Result<McpSession, RouterError> {
    match target.transport {
        Transport::Http => {
            if !(target.url.starts_with("http://") || target.url.starts_with("https://")) {
                return Err(RouterError::InvalidUrl {
                    server: target.server_name.to_string(),
                    url: target.url.to_string(),
                });
            }

            let client = http_client(target.server_name, target.headers, target.timeout)?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(target.url.to_string()),
            );

            ().serve(transport).await.map_err(|e| RouterError::Connection {
                server: target.server_name.to_string(),
                message: e.to_string(),
            })
        }
        Transport::Stdio => {
            let command = target.command.unwrap_or(target.url);
            let transport = TokioChildProcess::new(
                tokio::process::Command::new(command).configure(|cmd| {
                    cmd.args(target.args)
                        .envs(target.env.iter())
                        .stderr(std::process::Stdio::null());
                }),
            )
            .map_err(|e| RouterError::Connection {
                server: target.server_name.to_string(),
                message: format!("failed to spawn '{command}': {e}"),
            })?;

            ().serve(transport).await.map_err(|e| RouterError::Connection {
                server: target.server_name.to_string(),
                message: e.to_string(),
            })
        }
        Transport::Sse => {
            let client = http_client(target.server_name, target.headers, target.timeout)?;
            let transport = SseClientTransport::start_with_client(
                client,
                SseClientConfig {
                    sse_endpoint: target.url.to_string().into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RouterError::Connection {
                server: target.server_name.to_string(),
                message: e.to_string(),
            })?;

            ().serve(transport).await.map_err(|e| RouterError::Connection {
                server: target.server_name.to_string(),
                message: e.to_string(),
            })
        }
    }
}

/// Build a reqwest client carrying the resolved headers as defaults so they
/// are sent on every request of the session.
fn http_client(
    server_name: &str,
    headers: Option<&HashMap<String, String>>,
    timeout: Duration,
) -> Result<reqwest::Client, RouterError> {
    let mut default_headers = reqwest::header::HeaderMap::new();
    if let Some(headers) = headers {
        for (key, value) in headers {
            match (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(val)) => {
                    default_headers.insert(name, val);
                }
                _ => {
                    warn!(server = %server_name, header = %key, "skipping unparseable header");
                }
            }
        }
    }

    reqwest::Client::builder()
        .default_headers(default_headers)
        .timeout(timeout)
        .build()
        .map_err(|e| RouterError::Connection {
            server: server_name.to_string(),
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// A single outbound tool call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub server_name: String,
    /// MCP endpoint URL, or the command for stdio servers without `command`.
    pub url: String,
    pub tool_name: String,
    pub arguments: Option<serde_json::Map<String, Value>>,
    pub transport: Transport,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Static headers from the server registration.
    pub server_auth_headers: Option<HashMap<String, String>>,
    /// Auth header from the incoming caller, if any.
    pub client_auth_header: Option<String>,
}

const SCHEMA_CACHE_CAPACITY: usize = 1000;

struct CachedSchema {
    schema: Value,
    expires_at: Instant,
}

/// Bounded TTL map for tool schemas, keyed `{server}__{tool}`. Advisory:
/// callers must tolerate misses.
pub struct SchemaCache {
    entries: DashMap<String, CachedSchema>,
    ttl: Duration,
    capacity: usize,
}

impl SchemaCache {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if Instant::now() > entry.expires_at => true,
            Some(entry) => return Some(entry.schema.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn insert(&self, key: String, schema: Value) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(
            key,
            CachedSchema {
                schema,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop expired entries; if the cache is still full, drop the entry
    /// closest to expiry.
    fn evict(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);

        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.expires_at)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
            }
        }
    }

    fn clear(&self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Routes tool calls to downstream MCP servers, opening exactly one session
/// per call. No pooling; every session is torn down before the call returns.
pub struct ToolRouter {
    timeout: Duration,
    auth_mode: AuthMode,
    gateway_transport: GatewayTransport,
    schema_cache: SchemaCache,
}

impl ToolRouter {
    pub fn new(
        timeout: Duration,
        cache_ttl: Duration,
        auth_mode: AuthMode,
        gateway_transport: GatewayTransport,
    ) -> Self {
        Self {
            timeout,
            auth_mode,
            gateway_transport,
            schema_cache: SchemaCache::new(cache_ttl, SCHEMA_CACHE_CAPACITY),
        }
    }

    fn should_forward_auth(&self) -> bool {
        match self.auth_mode {
            AuthMode::Static => false,
            AuthMode::Forward => true,
            AuthMode::Auto => self.gateway_transport.is_http(),
        }
    }

    /// Resolve the headers for an outbound call. In forwarding modes a
    /// client-supplied header wins; otherwise the server's static headers
    /// apply; otherwise no headers.
    pub fn effective_auth_headers(
        &self,
        server_auth_headers: Option<&HashMap<String, String>>,
        client_auth_header: Option<&str>,
    ) -> Option<HashMap<String, String>> {
        if self.should_forward_auth()
            && let Some(header) = client_auth_header
        {
            return Some(HashMap::from([(
                "Authorization".to_string(),
                header.to_string(),
            )]));
        }
        server_auth_headers.cloned()
    }

    /// Call one tool on a downstream server. The whole exchange (connect,
    /// handshake, call) runs under a single deadline; on timeout the session
    /// future is dropped, which closes the transport and reaps any
    /// subprocess. The raw MCP result is returned verbatim.
    pub async fn call_tool(&self, spec: CallSpec) -> Result<CallToolResult, RouterError> {
        let headers = self.effective_auth_headers(
            spec.server_auth_headers.as_ref(),
            spec.client_auth_header.as_deref(),
        );

        info!(
            server = %spec.server_name,
            tool = %spec.tool_name,
            transport = ?spec.transport,
            "routing tool call"
        );

        let target = SessionTarget {
            server_name: &spec.server_name,
            url: &spec.url,
            transport: spec.transport,
            command: spec.command.as_deref(),
            args: &spec.args,
            env: &spec.env,
            headers: headers.as_ref(),
            timeout: self.timeout,
        };

        let exchange = async {
            let session = open_session(&target).await?;
            let result = session
                .call_tool(CallToolRequestParams {
                    meta: None,
                    name: spec.tool_name.clone().into(),
                    arguments: spec.arguments.clone(),
                    task: None,
                })
                .await;
            let _ = session.cancel().await;

            result.map_err(|e| RouterError::Call {
                server: spec.server_name.clone(),
                tool: spec.tool_name.clone(),
                message: e.to_string(),
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::Timeout {
                server: spec.server_name,
                timeout: self.timeout,
            }),
        }
    }

    #[allow(dead_code)]
    pub fn cache_schema(&self, server_name: &str, tool_name: &str, schema: Value) {
        let key = namespaced_name(server_name, tool_name);
        debug!(key = %key, "caching tool schema");
        self.schema_cache.insert(key, schema);
    }

    #[allow(dead_code)]
    pub fn get_cached_schema(&self, server_name: &str, tool_name: &str) -> Option<Value> {
        let key = namespaced_name(server_name, tool_name);
        let schema = self.schema_cache.get(&key);
        if schema.is_some() {
            debug!(key = %key, "schema cache hit");
        }
        schema
    }

    #[allow(dead_code)]
    pub fn clear_cache(&self) {
        self.schema_cache.clear();
        debug!("schema cache cleared");
    }
}
