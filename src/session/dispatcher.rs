//! Translation of tool intents into remote sandbox operations.
//!
//! The [`CommandDispatcher`] is the only entry point tool calls use. Every
//! operation first runs a light deadline sweep, then validates its arguments,
//! claims the sandbox through the registry and finally talks to the provider
//! with no registry lock held.
//!
//! Nothing here retries: a command that failed half way may already have had
//! side effects inside the sandbox, so the decision is left to the caller.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{BridgeConfig, PACKAGE_PLACEHOLDER};
use crate::error::{ProviderError, SessionError};
use crate::provider::{CommandLine, ExecRequest, ProvisionRequest, SandboxProvider};
use crate::session::registry::ActiveOperation;
use crate::session::{CommandResult, SandboxHandle, SandboxRecord, SandboxRegistry, SandboxStatus};

/// Arguments of `create_sandbox`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Lifetime in seconds; the configured default when absent.
    pub timeout_seconds: Option<i64>,
    /// Whitelisted profile name; the configured default when absent.
    pub resource_profile: Option<String>,
    /// Snapshot to restore the filesystem from.
    pub image_id: Option<String>,
}

impl SandboxSpec {
    /// A spec with an explicit timeout and defaults otherwise.
    #[must_use]
    pub fn with_timeout(timeout_seconds: i64) -> Self {
        Self {
            timeout_seconds: Some(timeout_seconds),
            ..Self::default()
        }
    }

    /// Sets the resource profile.
    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.resource_profile = Some(profile.into());
        self
    }

    /// Sets the snapshot to restore from.
    #[must_use]
    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }
}

/// A command to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: CommandLine,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

impl CommandRequest {
    /// A shell command line with no working directory or env overrides.
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: CommandLine::Shell(command.into()),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// An argument vector with no working directory or env overrides.
    #[must_use]
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: CommandLine::Argv(argv.into_iter().map(Into::into).collect()),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.command.is_empty() {
            return Err(SessionError::invalid_argument("command cannot be empty"));
        }
        if self.cwd.as_deref().is_some_and(|cwd| cwd.trim().is_empty()) {
            return Err(SessionError::invalid_argument("cwd cannot be empty"));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(SessionError::invalid_argument(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful `create_sandbox`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedSandbox {
    pub handle: SandboxHandle,
    pub status: SandboxStatus,
    pub resource_profile: String,
    pub timeout_seconds: u64,
    pub deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tunnels: BTreeMap<u16, String>,
}

/// How an in-flight remote call ended.
enum Settled<T> {
    Done(T),
    Failed(ProviderError),
    LimitElapsed,
    DeadlineElapsed,
}

/// Single entry point for all sandbox tool calls.
pub struct CommandDispatcher {
    config: Arc<BridgeConfig>,
    registry: SandboxRegistry,
    provider: Arc<dyn SandboxProvider>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("provider", &self.provider.name())
            .field("sandboxes", &self.registry.len())
            .finish()
    }
}

impl CommandDispatcher {
    /// Creates a dispatcher with an empty registry.
    #[must_use]
    pub fn new(config: Arc<BridgeConfig>, provider: Arc<dyn SandboxProvider>) -> Self {
        let registry =
            SandboxRegistry::new(config.max_timeout_seconds, config.retired_retention_seconds);
        Self {
            config,
            registry,
            provider,
        }
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Provisions a new sandbox.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidArgument` for out-of-range timeouts, unknown
    ///   resource profiles or an empty `image_id`
    /// - `SessionError::Provisioning` if the provider fails; the sandbox is
    ///   then recorded as `Failed`
    #[instrument(skip(self))]
    pub async fn create_sandbox(&self, spec: SandboxSpec) -> Result<CreatedSandbox, SessionError> {
        self.sweep_now().await;

        let profile_name = spec
            .resource_profile
            .as_deref()
            .unwrap_or(&self.config.default_profile);
        let profile = self.config.profile(profile_name).ok_or_else(|| {
            SessionError::invalid_argument(format!(
                "unknown resource_profile '{profile_name}'; allowed: {}",
                self.config.profile_names().join(", ")
            ))
        })?;
        if spec.image_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(SessionError::invalid_argument("image_id cannot be empty"));
        }

        let timeout_seconds = spec.timeout_seconds.unwrap_or_else(|| {
            i64::try_from(self.config.default_timeout_seconds).unwrap_or(i64::MAX)
        });
        let handle = self
            .registry
            .create(timeout_seconds, &profile.name, spec.image_id.clone())?;
        let record = self.registry.describe(handle)?;

        let request = ProvisionRequest {
            profile,
            timeout: Duration::from_secs(record.timeout_seconds),
            image_id: spec.image_id.as_deref(),
        };

        let provisioned = match self.provider.provision(&request).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                let detail = e.to_string();
                warn!(%handle, error = %detail, "Provisioning failed");
                self.registry.mark_failed(handle, &detail)?;
                return Err(SessionError::Provisioning { detail });
            }
        };

        match self.registry.mark_ready(handle, &provisioned) {
            Ok(record) => {
                info!(%handle, remote_id = %provisioned.remote_id, profile = %profile.name, "Sandbox ready");
                Ok(CreatedSandbox {
                    handle,
                    status: record.status,
                    resource_profile: record.resource_profile,
                    timeout_seconds: record.timeout_seconds,
                    deadline: record.deadline,
                    tunnels: record.tunnels,
                })
            }
            Err(e) => {
                // Retired while provisioning (e.g. shutdown); don't leak the remote side.
                self.release_remote(handle, &provisioned.remote_id).await;
                Err(SessionError::Provisioning {
                    detail: format!("sandbox was retired during provisioning: {e}"),
                })
            }
        }
    }

    /// Runs a command to completion in a `Ready` sandbox.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` for unknown handles
    /// - `SessionError::InvalidStateTransition` unless the sandbox is `Ready`
    /// - `SessionError::InvalidArgument` for an empty command
    /// - `SessionError::Execution` if the provider fails or the command
    ///   exceeds the per-command limit
    /// - `SessionError::Timeout` if the sandbox deadline elapses meanwhile
    #[instrument(skip(self, request), fields(command = %request.command))]
    pub async fn run_command(
        &self,
        handle: &str,
        request: CommandRequest,
    ) -> Result<CommandResult, SessionError> {
        self.sweep_now().await;
        let handle = SandboxHandle::parse(handle)?;
        request.validate()?;

        let op = self.registry.begin_operation(handle, "run a command in")?;
        let limit = self.config.command_timeout();
        let exec = ExecRequest {
            command: &request.command,
            cwd: request.cwd.as_deref(),
            env: &request.env,
            timeout: limit,
        };

        let started = Instant::now();
        let raw = self
            .guarded(&op, limit, self.provider.exec(&op.remote_id, &exec))
            .await?;

        let result = CommandResult::from_raw(raw, self.config.output_byte_cap, started.elapsed());
        debug!(%handle, exit_code = result.exit_code, truncated = result.truncated, "Command finished");
        Ok(result)
    }

    /// Installs a package with the configured install command.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidArgument` for package names with characters
    /// outside `[A-Za-z0-9._+-=@:/]` or starting with `-`; otherwise as
    /// [`run_command`](Self::run_command).
    #[instrument(skip(self))]
    pub async fn install_package(
        &self,
        handle: &str,
        package: &str,
    ) -> Result<CommandResult, SessionError> {
        let package = package.trim();
        if !is_valid_package(package) {
            return Err(SessionError::invalid_argument(format!(
                "invalid package name: {package:?}"
            )));
        }

        let quoted = shell_escape::escape(Cow::Borrowed(package));
        let command = self
            .config
            .install_command
            .replace(PACKAGE_PLACEHOLDER, &quoted);

        self.run_command(handle, CommandRequest::shell(command))
            .await
    }

    /// Tears a sandbox down. Idempotent.
    ///
    /// Returns the sandbox's final status. A retired sandbox is left as is
    /// and its status returned.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` for unknown handles
    /// - `SessionError::InvalidStateTransition` while `Pending` or `Running`
    /// - `SessionError::Execution` if the provider refuses; the sandbox stays
    ///   `Ready` so termination can be retried
    #[instrument(skip(self))]
    pub async fn terminate(&self, handle: &str) -> Result<SandboxStatus, SessionError> {
        self.sweep_now().await;
        let handle = SandboxHandle::parse(handle)?;

        let op = match self.registry.begin_operation(handle, "terminate") {
            Ok(op) => op,
            Err(SessionError::InvalidStateTransition { from, .. }) if from.is_retired() => {
                debug!(%handle, status = %from, "Sandbox already retired");
                return Ok(from);
            }
            Err(e) => return Err(e),
        };

        match self.provider.terminate(&op.remote_id).await {
            Ok(()) => match self.registry.update_status(handle, SandboxStatus::Terminated) {
                Ok(record) => {
                    info!(%handle, "Sandbox terminated");
                    Ok(record.status)
                }
                Err(e) => {
                    // Retired meanwhile by a deadline sweep or shutdown.
                    let record = self.registry.describe(handle)?;
                    if record.status.is_retired() {
                        debug!(%handle, status = %record.status, "Sandbox retired during termination");
                        Ok(record.status)
                    } else {
                        Err(e)
                    }
                }
            },
            Err(e) => {
                // The sweep may have expired it meanwhile; that is a terminal outcome too.
                if self.registry.finish_operation(handle).is_err() {
                    return Ok(self.registry.describe(handle)?.status);
                }
                Err(SessionError::Execution {
                    detail: format!("failed to terminate sandbox: {e}"),
                })
            }
        }
    }

    /// Returns the record of any known sandbox, after a deadline check.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound` for unknown handles.
    #[instrument(skip(self))]
    pub async fn status(&self, handle: &str) -> Result<SandboxRecord, SessionError> {
        self.sweep_now().await;
        let handle = SandboxHandle::parse(handle)?;
        self.registry.describe(handle)
    }

    /// Returns every known sandbox, oldest first.
    pub async fn list(&self) -> Vec<SandboxRecord> {
        self.sweep_now().await;
        self.registry.list()
    }

    /// Snapshots the filesystem of a `Ready` sandbox.
    ///
    /// # Errors
    ///
    /// As [`run_command`](Self::run_command).
    #[instrument(skip(self))]
    pub async fn snapshot(&self, handle: &str) -> Result<String, SessionError> {
        self.sweep_now().await;
        let handle = SandboxHandle::parse(handle)?;

        let op = self.registry.begin_operation(handle, "snapshot")?;
        let limit = self.config.command_timeout();
        let image_id = self
            .guarded(&op, limit, self.provider.snapshot(&op.remote_id))
            .await?;

        info!(%handle, %image_id, "Filesystem snapshot taken");
        Ok(image_id)
    }

    /// Starts a command without waiting for it. The sandbox stays `Ready`.
    ///
    /// # Errors
    ///
    /// As [`run_command`](Self::run_command).
    #[instrument(skip(self, request), fields(command = %request.command))]
    pub async fn spawn_background(
        &self,
        handle: &str,
        request: CommandRequest,
    ) -> Result<String, SessionError> {
        self.sweep_now().await;
        let handle = SandboxHandle::parse(handle)?;
        request.validate()?;

        let op = self.registry.begin_operation(handle, "start a process in")?;
        let limit = self.config.command_timeout();
        let exec = ExecRequest {
            command: &request.command,
            cwd: request.cwd.as_deref(),
            env: &request.env,
            timeout: limit,
        };

        let process_id = self
            .guarded(&op, limit, self.provider.spawn(&op.remote_id, &exec))
            .await?;
        self.registry.add_process(handle, &process_id)?;

        debug!(%handle, %process_id, "Background process started");
        Ok(process_id)
    }

    /// Waits for a background process started with
    /// [`spawn_background`](Self::spawn_background). The process id is
    /// forgotten afterwards, whatever the outcome.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound` if the process was not started in this
    /// sandbox (or was already waited for); otherwise as
    /// [`run_command`](Self::run_command).
    #[instrument(skip(self))]
    pub async fn wait_for_process(
        &self,
        handle: &str,
        process_id: &str,
    ) -> Result<CommandResult, SessionError> {
        self.sweep_now().await;
        let handle = SandboxHandle::parse(handle)?;
        let record = self.registry.describe(handle)?;
        if record.status == SandboxStatus::Ready && !record.processes.contains(process_id) {
            return Err(SessionError::NotFound {
                handle: format!("process {process_id} in sandbox {handle}"),
            });
        }

        let op = self.registry.begin_operation(handle, "wait for a process in")?;
        let limit = self.config.command_timeout();
        let started = Instant::now();

        // A vanished process is not a vanished sandbox.
        let wait = async {
            match self.provider.wait(&op.remote_id, process_id, limit).await {
                Err(ProviderError::Gone(body)) => Err(ProviderError::Rejected { status: 404, body }),
                other => other,
            }
        };

        let outcome = self.guarded(&op, limit, wait).await;
        self.registry.remove_process(handle, process_id);
        let raw = outcome?;

        Ok(CommandResult::from_raw(
            raw,
            self.config.output_byte_cap,
            started.elapsed(),
        ))
    }

    /// Expires sandboxes past their deadline and releases their remote side.
    ///
    /// Runs before every dispatcher operation and periodically from the
    /// [`Reaper`](crate::session::Reaper).
    pub async fn sweep_now(&self) -> usize {
        let expired = self.registry.sweep(Utc::now());
        let count = expired.len();
        for sandbox in expired {
            info!(handle = %sandbox.handle, "Sandbox timed out");
            if let Some(remote_id) = sandbox.remote_id {
                self.release_remote(sandbox.handle, &remote_id).await;
            }
        }
        count
    }

    /// Best-effort teardown of every sandbox still alive. Used on process exit.
    ///
    /// Returns the number of sandboxes retired.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> usize {
        let live = self.registry.live();
        let mut retired = 0;

        for (handle, status, remote_id) in live {
            let next = match status {
                SandboxStatus::Pending => self
                    .registry
                    .mark_failed(handle, "process shut down during provisioning"),
                _ => self.registry.update_status(handle, SandboxStatus::Terminated),
            };
            if let Err(e) = next {
                warn!(%handle, error = %e, "Could not retire sandbox on shutdown");
                continue;
            }
            retired += 1;

            if let Some(remote_id) = remote_id {
                self.release_remote(handle, &remote_id).await;
            }
        }

        info!(retired, "Shutdown cleanup complete");
        retired
    }

    /// Awaits a remote call on a claimed sandbox, bounded by both `limit` and
    /// the sandbox deadline, and settles the sandbox state accordingly.
    async fn guarded<T, F>(
        &self,
        op: &ActiveOperation,
        limit: Duration,
        call: F,
    ) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let remaining = (op.deadline - Utc::now()).to_std().unwrap_or_default();
        let bound = remaining.min(limit);

        let settled = match tokio::time::timeout(bound, call).await {
            Ok(Ok(value)) => Settled::Done(value),
            Ok(Err(e)) => Settled::Failed(e),
            Err(_) if remaining <= limit => Settled::DeadlineElapsed,
            Err(_) => Settled::LimitElapsed,
        };

        let handle = op.handle;
        match settled {
            Settled::Done(value) => match self.registry.finish_operation(handle) {
                Ok(()) => Ok(value),
                // Retired concurrently; the result is discarded.
                Err(_) => Err(self.retired_error(op)),
            },
            Settled::DeadlineElapsed => {
                self.expire(op).await;
                Err(self.timeout_error(op))
            }
            Settled::LimitElapsed => {
                self.release(op)?;
                Err(SessionError::Execution {
                    detail: format!("remote call did not finish within {}s", limit.as_secs()),
                })
            }
            Settled::Failed(ProviderError::Gone(detail)) => {
                warn!(%handle, %detail, "Remote sandbox is gone");
                if self.registry.mark_failed(handle, &detail).is_err() {
                    return Err(self.retired_error(op));
                }
                Err(SessionError::Execution {
                    detail: format!("sandbox no longer exists: {detail}"),
                })
            }
            Settled::Failed(e) => {
                self.release(op)?;
                Err(SessionError::Execution {
                    detail: e.to_string(),
                })
            }
        }
    }

    fn release(&self, op: &ActiveOperation) -> Result<(), SessionError> {
        self.registry
            .finish_operation(op.handle)
            .map_err(|_| self.retired_error(op))
    }

    /// Error for an operation whose sandbox was retired while it was in flight.
    fn retired_error(&self, op: &ActiveOperation) -> SessionError {
        match self.registry.describe(op.handle).map(|r| r.status) {
            Ok(SandboxStatus::TimedOut) | Err(_) => self.timeout_error(op),
            Ok(status) => SessionError::Execution {
                detail: format!(
                    "sandbox {} became {status} while the operation was in flight",
                    op.handle
                ),
            },
        }
    }

    fn timeout_error(&self, op: &ActiveOperation) -> SessionError {
        SessionError::Timeout {
            handle: op.handle.to_string(),
            timeout_seconds: op.timeout_seconds,
        }
    }

    /// Retires a claimed sandbox whose deadline elapsed mid-operation.
    async fn expire(&self, op: &ActiveOperation) {
        match self
            .registry
            .update_status(op.handle, SandboxStatus::TimedOut)
        {
            Ok(_) => {
                info!(handle = %op.handle, "Sandbox timed out during an operation");
                self.release_remote(op.handle, &op.remote_id).await;
            }
            // Already retired by the sweep, which released it.
            Err(e) => debug!(handle = %op.handle, error = %e, "Sandbox already retired"),
        }
    }

    async fn release_remote(&self, handle: SandboxHandle, remote_id: &str) {
        if let Err(e) = self.provider.terminate(remote_id).await {
            warn!(%handle, %remote_id, error = %e, "Failed to release remote sandbox");
        }
    }
}

/// A leading `-` would be read as an option by the package manager.
fn is_valid_package(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-' | '=' | '@' | ':' | '/')
        })
}
