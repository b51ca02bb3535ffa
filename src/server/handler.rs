//! MCP server handler implementation.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::{ServerError, SessionError};
use crate::provider::{CommandLine, HttpProvider};
use crate::session::{CommandDispatcher, CommandRequest, Reaper, SandboxSpec};

/// Parameters of `create_sandbox`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct CreateSandboxParams {
    /// Lifetime of the sandbox in seconds. The sandbox is torn down when it
    /// elapses, whatever it is doing.
    pub timeout_seconds: Option<i64>,
    /// Name of a configured resource profile (CPU, memory, GPU).
    pub resource_profile: Option<String>,
    /// Snapshot to restore the filesystem from, as returned by `snapshot_sandbox`.
    pub image_id: Option<String>,
}

/// Parameters of `run_command` and `run_command_background`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct RunCommandParams {
    /// Sandbox handle returned by `create_sandbox`.
    pub handle: String,
    /// Shell command line, run with `sh -c`.
    pub command: String,
    /// Working directory inside the sandbox.
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl From<RunCommandParams> for CommandRequest {
    fn from(params: RunCommandParams) -> Self {
        Self {
            command: CommandLine::Shell(params.command),
            cwd: params.cwd,
            env: params.env,
        }
    }
}

/// Parameters of `install_package`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct InstallPackageParams {
    /// Sandbox handle returned by `create_sandbox`.
    pub handle: String,
    /// Package name, optionally with a version specifier.
    pub package: String,
}

/// Parameters of tools that only take a handle.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct HandleParams {
    /// Sandbox handle returned by `create_sandbox`.
    pub handle: String,
}

/// Parameters of `wait_for_process`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct WaitForProcessParams {
    /// Sandbox handle returned by `create_sandbox`.
    pub handle: String,
    /// Process id returned by `run_command_background`.
    pub process_id: String,
}

/// Renders a dispatcher outcome as a tool response body.
///
/// Returns the JSON body and whether it describes an error. Errors take the
/// shape `{"error": {"kind": ..., "message": ...}}`.
///
/// # Errors
///
/// Fails only if `T` cannot be serialized.
pub fn render<T: Serialize>(outcome: Result<T, SessionError>) -> serde_json::Result<(Value, bool)> {
    match outcome {
        Ok(value) => Ok((serde_json::to_value(value)?, false)),
        Err(e) => Ok((
            json!({ "error": { "kind": e.kind(), "message": e.to_string() } }),
            true,
        )),
    }
}

fn respond<T: Serialize>(outcome: Result<T, SessionError>) -> Result<CallToolResult, McpError> {
    let (body, is_error) =
        render(outcome).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    let content = vec![Content::text(body.to_string())];

    Ok(if is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    })
}

/// The MCP server exposing sandbox tools.
#[derive(Clone)]
pub struct SandboxServer {
    dispatcher: Arc<CommandDispatcher>,
    tool_router: ToolRouter<Self>,
}

impl SandboxServer {
    /// Create a new sandbox server backed by `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    /// Returns the dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }
}

#[tool_router]
impl SandboxServer {
    #[tool(
        name = "create_sandbox",
        description = "Create a remote sandbox. Returns a handle used by every other tool. \
                       The sandbox is destroyed after timeout_seconds."
    )]
    pub async fn create_sandbox(
        &self,
        Parameters(params): Parameters<CreateSandboxParams>,
    ) -> Result<CallToolResult, McpError> {
        let spec = SandboxSpec {
            timeout_seconds: params.timeout_seconds,
            resource_profile: params.resource_profile,
            image_id: params.image_id,
        };
        respond(self.dispatcher.create_sandbox(spec).await)
    }

    #[tool(
        name = "run_command",
        description = "Run a shell command in a sandbox and wait for it. Returns exit_code, \
                       stdout, stderr, duration_ms and whether output was truncated."
    )]
    pub async fn run_command(
        &self,
        Parameters(params): Parameters<RunCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let handle = params.handle.clone();
        respond(self.dispatcher.run_command(&handle, params.into()).await)
    }

    #[tool(
        name = "install_package",
        description = "Install a system package in a sandbox with the configured package manager."
    )]
    pub async fn install_package(
        &self,
        Parameters(params): Parameters<InstallPackageParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.dispatcher
                .install_package(&params.handle, &params.package)
                .await,
        )
    }

    #[tool(
        name = "terminate_sandbox",
        description = "Destroy a sandbox. Terminating an already retired sandbox is a no-op."
    )]
    pub async fn terminate_sandbox(
        &self,
        Parameters(params): Parameters<HandleParams>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self.dispatcher.terminate(&params.handle).await;
        respond(outcome.map(|status| json!({ "status": status })))
    }

    #[tool(
        name = "get_sandbox_status",
        description = "Describe a sandbox: status, creation time, timeout and deadline."
    )]
    pub async fn get_sandbox_status(
        &self,
        Parameters(params): Parameters<HandleParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(self.dispatcher.status(&params.handle).await)
    }

    #[tool(name = "list_sandboxes", description = "List every sandbox this server knows about.")]
    pub async fn list_sandboxes(&self) -> Result<CallToolResult, McpError> {
        let sandboxes = self.dispatcher.list().await;
        respond(Ok(json!({ "sandboxes": sandboxes })))
    }

    #[tool(
        name = "snapshot_sandbox",
        description = "Snapshot a sandbox filesystem. The returned image_id can be passed to \
                       create_sandbox to restore it."
    )]
    pub async fn snapshot_sandbox(
        &self,
        Parameters(params): Parameters<HandleParams>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self.dispatcher.snapshot(&params.handle).await;
        respond(outcome.map(|image_id| json!({ "image_id": image_id })))
    }

    #[tool(
        name = "run_command_background",
        description = "Start a shell command in a sandbox without waiting for it. \
                       Returns a process_id for wait_for_process."
    )]
    pub async fn run_command_background(
        &self,
        Parameters(params): Parameters<RunCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let handle = params.handle.clone();
        let outcome = self
            .dispatcher
            .spawn_background(&handle, params.into())
            .await;
        respond(outcome.map(|process_id| json!({ "process_id": process_id })))
    }

    #[tool(
        name = "wait_for_process",
        description = "Wait for a background process and return its output, like run_command."
    )]
    pub async fn wait_for_process(
        &self,
        Parameters(params): Parameters<WaitForProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.dispatcher
                .wait_for_process(&params.handle, &params.process_id)
                .await,
        )
    }
}

#[tool_handler]
impl rmcp::ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let config = self.dispatcher.config();
        ServerInfo {
            instructions: Some(format!(
                "Remote sandboxes for running code. Create one with create_sandbox, run commands \
                 with run_command, and terminate it when done. Resource profiles: {}. \
                 Maximum timeout: {}s.",
                config.profile_names().join(", "),
                config.max_timeout_seconds
            )),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Run the MCP server.
///
/// Serves tools over stdio until the client disconnects or the process is
/// interrupted, then tears down every sandbox still alive.
///
/// # Errors
///
/// Returns error if the configuration is invalid, the provider cannot be
/// configured, or server initialization or transport fails.
pub async fn run(config: BridgeConfig) -> crate::error::Result<()> {
    info!("Starting sandbox session bridge");
    config.validate()?;

    let config = Arc::new(config);
    let provider = Arc::new(HttpProvider::new(&config.provider)?);
    let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&config), provider));
    let reaper = Reaper::spawn(Arc::clone(&dispatcher), config.sweep_interval());

    debug!("Using stdio transport");
    let service = SandboxServer::new(Arc::clone(&dispatcher))
        .serve(stdio())
        .await
        .map_err(|e| ServerError::InitializationFailed(e.to_string()))?;

    info!("Server initialized, waiting for requests");

    let outcome = tokio::select! {
        quit = service.waiting() => quit
            .map(|_| ())
            .map_err(|e| ServerError::Transport(e.to_string())),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    reaper.stop().await;
    dispatcher.shutdown().await;

    outcome?;
    info!("Server shutdown complete");
    Ok(())
}
