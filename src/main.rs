mod bootstrap;
mod config;
mod discovery;
mod models;
mod registry;
mod router;
mod search;
mod server;
mod storage;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::{
    ServiceExt,
    transport::{
        stdio,
        streamable_http_server::{
            StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
        },
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{GatewayConfig, StorageKind};
use crate::registry::ServerRegistry;
use crate::router::{GatewayTransport, ToolRouter};
use crate::search::SearchIndex;
use crate::server::GatewayServer;
use crate::storage::{StorageBackend, memory::MemoryStorage, redis::RedisStorage};

#[derive(Parser)]
#[command(
    name = "toolgate",
    version,
    about = "MCP gateway that aggregates downstream MCP servers behind a single endpoint"
)]
struct Cli {
    /// Path to the server bootstrap file (overrides SERVER_CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve the gateway over 'stdio' or 'http' (overrides GATEWAY_TRANSPORT).
    #[arg(long)]
    transport: Option<GatewayTransportArg>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum GatewayTransportArg {
    Stdio,
    Http,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    if let Some(path) = cli.config {
        config.server_config_path = Some(path);
    }
    if let Some(transport) = cli.transport {
        config.transport = match transport {
            GatewayTransportArg::Stdio => GatewayTransport::Stdio,
            GatewayTransportArg::Http => GatewayTransport::Http,
        };
    }

    // Logs go to stderr so the stdio transport stays clean
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        storage = ?config.storage_backend,
        transport = ?config.transport,
        auth_mode = ?config.auth_mode,
        connection_mode = ?config.default_connection_mode,
        timeout = ?config.connection_timeout,
        max_retries = config.max_retries,
        "toolgate starting"
    );

    let storage: Arc<dyn StorageBackend> = match config.storage_backend {
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
        StorageKind::Redis => Arc::new(RedisStorage::new(&config.redis_url)),
    };

    let registry = Arc::new(ServerRegistry::new(Arc::clone(&storage)));
    let search = Arc::new(RwLock::new(SearchIndex::new()));
    let router = Arc::new(ToolRouter::new(
        config.connection_timeout,
        config.tool_cache_ttl,
        config.auth_mode,
        config.transport,
    ));
    let gateway = GatewayServer::new(registry, search, router);

    // Persistent backends may already hold tool metadata from a previous run
    match gateway.rebuild_search_index().await {
        Ok(0) => {}
        Ok(indexed) => info!(tools = indexed, "search index rebuilt from stored metadata"),
        Err(e) => debug!(error = %e, "no stored metadata to index"),
    }

    if let Some(path) = config.server_config_path.clone() {
        if path.exists() {
            info!(path = %path.display(), "loading server configuration");
            let loader = bootstrap::ServerConfigLoader::new(path);
            let summary = loader.load_and_register(&gateway).await;
            info!(
                loaded = summary.servers_loaded,
                failed = summary.servers_failed,
                skipped = summary.servers_skipped,
                total_tools = summary.total_tools,
                "bootstrap complete"
            );
        } else {
            debug!(path = %path.display(), "server config file not found, skipping bootstrap");
        }
    }

    match gateway.registry().list_all().await {
        Ok(servers) => info!(servers = servers.len(), "registry ready"),
        Err(e) => debug!(error = %e, "could not enumerate registered servers"),
    }

    match config.transport {
        GatewayTransport::Http | GatewayTransport::StreamableHttp => {
            serve_http(gateway, &config.http_host, config.http_port).await?;
        }
        _ => {
            info!("serving MCP over stdio");
            let service = gateway
                .serve(stdio())
                .await
                .context("failed to start stdio server")?;
            service.waiting().await?;
        }
    }

    storage.close().await.ok();
    Ok(())
}

/// Serve the gateway over streamable HTTP at `/mcp`.
async fn serve_http(gateway: GatewayServer, host: &str, port: u16) -> Result<()> {
    let service = StreamableHttpService::new(
        move || Ok(gateway.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let app = axum::Router::new().nest_service("/mcp", service);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "serving MCP over streamable HTTP at /mcp");
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
