//! Per-server transport interface and the child-process implementation.
//!
//! The broker only needs two things from a running server: list its actions
//! with schemas, and invoke one action. Framing and protocol details live
//! behind these traits; production servers speak MCP over stdio via `rmcp`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::{
    model::CallToolRequestParam,
    service::RunningService,
    transport::{ConfigureCommandExt, TokioChildProcess},
    RoleClient, ServiceExt,
};
use tracing::{info, warn};

use crate::{
    catalog::ToolSchema,
    config::ServerConfig,
    error::{BrokerError, BrokerResult},
};

type McpClient = RunningService<RoleClient, ()>;

/// A live request/response channel to one running tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// List the actions the server exposes, with parameter schemas.
    async fn list_actions(&self) -> BrokerResult<Vec<ToolSchema>>;

    /// Invoke one action and return its raw result payload.
    async fn invoke(
        &self,
        action: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BrokerResult<serde_json::Value>;

    /// Close the channel and reap the subprocess. Idempotent.
    async fn close(&self) -> BrokerResult<()>;
}

/// Launches a server and completes the protocol handshake.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, name: &str, config: &ServerConfig) -> BrokerResult<Arc<dyn ToolTransport>>;
}

/// Production launcher: spawns the configured command as a local subprocess
/// speaking MCP over its stdio.
pub struct ChildProcessLauncher;

#[async_trait]
impl ServerLauncher for ChildProcessLauncher {
    async fn launch(&self, name: &str, config: &ServerConfig) -> BrokerResult<Arc<dyn ToolTransport>> {
        let transport = TokioChildProcess::new(tokio::process::Command::new(&config.command).configure(
            |cmd| {
                cmd.args(&config.args)
                    .envs(config.env.iter())
                    .stderr(std::process::Stdio::inherit());
            },
        ))
        .map_err(|e| BrokerError::LaunchFailed {
            server: name.to_string(),
            message: e.to_string(),
        })?;

        let client = ().serve(transport).await.map_err(|e| BrokerError::HandshakeFailed {
            server: name.to_string(),
            message: e.to_string(),
        })?;

        info!("launched server '{}' ({})", name, config.command);
        Ok(Arc::new(ChildProcessTransport {
            server: name.to_string(),
            client: Mutex::new(Some(Arc::new(client))),
        }))
    }
}

/// Transport over a spawned MCP server process.
pub struct ChildProcessTransport {
    server: String,
    client: Mutex<Option<Arc<McpClient>>>,
}

impl ChildProcessTransport {
    fn client(&self) -> BrokerResult<Arc<McpClient>> {
        self.client
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| BrokerError::ServerUnavailable(self.server.clone()))
    }
}

#[async_trait]
impl ToolTransport for ChildProcessTransport {
    async fn list_actions(&self) -> BrokerResult<Vec<ToolSchema>> {
        let client = self.client()?;
        let tools = client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| BrokerError::ServerUnavailable(format!("{}: {}", self.server, e)))?;

        Ok(tools
            .into_iter()
            .map(|tool| {
                ToolSchema::new(
                    tool.name.to_string(),
                    tool.description.as_ref().map(|d| d.to_string()),
                    serde_json::Value::Object((*tool.input_schema).clone()),
                )
            })
            .collect())
    }

    async fn invoke(
        &self,
        action: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BrokerResult<serde_json::Value> {
        let client = self.client()?;
        let request = CallToolRequestParam {
            name: std::borrow::Cow::Owned(action.to_string()),
            arguments: args,
        };
        let result = client
            .call_tool(request)
            .await
            .map_err(|e| BrokerError::ServerUnavailable(format!("{}: {}", self.server, e)))?;

        serde_json::to_value(result)
            .map_err(|e| BrokerError::InvalidArguments(format!("unencodable result: {}", e)))
    }

    async fn close(&self) -> BrokerResult<()> {
        let Some(client) = self.client.lock().take() else {
            return Ok(());
        };
        match Arc::try_unwrap(client) {
            Ok(client) => {
                if let Err(e) = client.cancel().await {
                    warn!("error closing server '{}': {}", self.server, e);
                }
            }
            Err(_) => {
                // An in-flight call still holds the client; the process is
                // reaped when the last reference drops.
                warn!("server '{}' still has active calls on close", self.server);
            }
        }
        Ok(())
    }
}
