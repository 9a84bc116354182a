use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

use crate::models::{ToolDescriptor, Transport};
use crate::router::{RouterError, SessionTarget, open_session};

/// Default deadline for a discovery session.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A downstream server to discover tools on.
#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub server_name: String,
    pub url: String,
    pub transport: Transport,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub auth_headers: Option<HashMap<String, String>>,
}

/// Open a transient MCP session, list the server's tools, and normalize
/// them. The `tools/list` call happens inside the session scope; the session
/// is cancelled before returning. An empty list is not a failure.
pub async fn discover_tools(
    target: &DiscoveryTarget,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, RouterError> {
    let session_target = SessionTarget {
        server_name: &target.server_name,
        url: &target.url,
        transport: target.transport,
        command: target.command.as_deref(),
        args: &target.args,
        env: &target.env,
        headers: target.auth_headers.as_ref(),
        timeout,
    };

    let exchange = async {
        let session = open_session(&session_target).await?;
        let listed = session.list_all_tools().await;
        let _ = session.cancel().await;

        listed.map_err(|e| RouterError::Discovery {
            server: target.server_name.clone(),
            message: e.to_string(),
        })
    };

    let tools = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(tools)) => tools,
        Ok(Err(e)) => {
            error!(server = %target.server_name, error = %e, "tool discovery failed");
            return Err(e);
        }
        Err(_) => {
            error!(server = %target.server_name, "tool discovery timed out");
            return Err(RouterError::Timeout {
                server: target.server_name.clone(),
                timeout,
            });
        }
    };

    let descriptors: Vec<ToolDescriptor> = tools
        .into_iter()
        .map(|tool| ToolDescriptor {
            name: tool.name.to_string(),
            description: tool
                .description
                .map(|d| d.to_string())
                .unwrap_or_default(),
            input_schema: serde_json::to_value(&tool.input_schema)
                .unwrap_or(Value::Object(Default::default())),
        })
        .collect();

    info!(
        server = %target.server_name,
        tools = descriptors.len(),
        "discovered tools"
    );
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(transport: Transport, url: &str, command: Option<&str>) -> DiscoveryTarget {
        DiscoveryTarget {
            server_name: "probe".to_string(),
            url: url.to_string(),
            transport,
            command: command.map(String::from),
            args: Vec::new(),
            env: HashMap::new(),
            auth_headers: None,
        }
    }

    #[tokio::test]
    async fn test_discovery_rejects_invalid_http_url() {
        let err = discover_tools(
            &target(Transport::Http, "not-a-url", None),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RouterError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_discovery_surfaces_spawn_failure() {
        let err = discover_tools(
            &target(
                Transport::Stdio,
                "/nonexistent/toolgate-test-binary",
                None,
            ),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(!matches!(err, RouterError::InvalidUrl { .. }));
    }
}
