//! Shared fixtures for integration tests.
//!
//! [`FakeProvider`] stands in for the remote sandbox service: it keeps
//! sandboxes in memory, answers `echo` commands, and can be told to fail or
//! to be slow.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sandbox_session_bridge::config::BridgeConfig;
use sandbox_session_bridge::error::ProviderError;
use sandbox_session_bridge::provider::{
    CommandLine, ExecRequest, ProvisionRequest, Provisioned, RawOutput, SandboxProvider,
};
use sandbox_session_bridge::session::CommandDispatcher;

/// Failure modes the fake can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The remote sandbox has disappeared.
    Gone,
    /// The provider refuses the request.
    Rejected,
    /// The connection drops.
    Transport,
}

impl Fault {
    fn error(self) -> ProviderError {
        match self {
            Self::Gone => ProviderError::Gone("no such sandbox".into()),
            Self::Rejected => ProviderError::Rejected {
                status: 503,
                body: "quota exceeded".into(),
            },
            Self::Transport => ProviderError::Transport("connection reset".into()),
        }
    }
}

#[derive(Default)]
pub struct FakeProvider {
    provision_fault: Mutex<Option<Fault>>,
    exec_fault: Mutex<Option<Fault>>,
    terminate_fault: Mutex<Option<Fault>>,
    provision_delay: Mutex<Duration>,
    terminate_delay: Mutex<Duration>,
    exec_delay: Mutex<Duration>,
    exec_output: Mutex<Option<RawOutput>>,
    tunnels: Mutex<BTreeMap<u16, String>>,

    next_id: AtomicUsize,
    live: Mutex<Vec<String>>,
    processes: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
    provisioned_images: Mutex<Vec<Option<String>>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_provisioning(&self, fault: Fault) {
        *self.provision_fault.lock() = Some(fault);
    }

    pub fn fail_exec(&self, fault: Fault) {
        *self.exec_fault.lock() = Some(fault);
    }

    pub fn fail_terminate(&self, fault: Option<Fault>) {
        *self.terminate_fault.lock() = fault;
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock() = delay;
    }

    pub fn set_terminate_delay(&self, delay: Duration) {
        *self.terminate_delay.lock() = delay;
    }

    /// Drops every background process on the remote side.
    pub fn forget_processes(&self) {
        self.processes.lock().clear();
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock() = delay;
    }

    /// Replaces the default `echo` behaviour with fixed output.
    pub fn set_exec_output(&self, output: RawOutput) {
        *self.exec_output.lock() = Some(output);
    }

    pub fn set_tunnels(&self, tunnels: BTreeMap<u16, String>) {
        *self.tunnels.lock() = tunnels;
    }

    /// Commands received by `exec` and `spawn`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn last_command(&self) -> Option<String> {
        self.commands.lock().last().cloned()
    }

    /// Remote ids passed to `terminate`, in order.
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn provisioned_images(&self) -> Vec<Option<String>> {
        self.provisioned_images.lock().clone()
    }

    fn check_live(&self, remote_id: &str) -> Result<(), ProviderError> {
        if self.live.lock().iter().any(|id| id == remote_id) {
            Ok(())
        } else {
            Err(Fault::Gone.error())
        }
    }

    fn respond(&self, command: &CommandLine) -> RawOutput {
        if let Some(output) = self.exec_output.lock().clone() {
            return output;
        }

        let line = command.to_string();
        match line.strip_prefix("echo ") {
            Some(text) => RawOutput {
                exit_code: 0,
                stdout: format!("{text}\n").into_bytes(),
                stderr: Vec::new(),
            },
            None => RawOutput {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<Provisioned, ProviderError> {
        let delay = *self.provision_delay.lock();
        pause(delay).await;
        if let Some(fault) = *self.provision_fault.lock() {
            return Err(fault.error());
        }

        let remote_id = format!("sb-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().push(remote_id.clone());
        self.provisioned_images
            .lock()
            .push(request.image_id.map(str::to_string));

        Ok(Provisioned {
            remote_id,
            tunnels: self.tunnels.lock().clone(),
        })
    }

    async fn terminate(&self, remote_id: &str) -> Result<(), ProviderError> {
        let delay = *self.terminate_delay.lock();
        pause(delay).await;
        if let Some(fault) = *self.terminate_fault.lock() {
            return Err(fault.error());
        }
        self.terminated.lock().push(remote_id.to_string());
        self.live.lock().retain(|id| id != remote_id);
        Ok(())
    }

    async fn exec(
        &self,
        remote_id: &str,
        request: &ExecRequest<'_>,
    ) -> Result<RawOutput, ProviderError> {
        self.commands.lock().push(request.command.to_string());

        let delay = *self.exec_delay.lock();
        pause(delay).await;

        if let Some(fault) = *self.exec_fault.lock() {
            return Err(fault.error());
        }
        self.check_live(remote_id)?;
        Ok(self.respond(request.command))
    }

    async fn spawn(
        &self,
        remote_id: &str,
        request: &ExecRequest<'_>,
    ) -> Result<String, ProviderError> {
        self.check_live(remote_id)?;
        self.commands.lock().push(request.command.to_string());

        let process_id = format!("proc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.processes
            .lock()
            .insert(process_id.clone(), request.command.to_string());
        Ok(process_id)
    }

    async fn wait(
        &self,
        remote_id: &str,
        process_id: &str,
        _timeout: Duration,
    ) -> Result<RawOutput, ProviderError> {
        self.check_live(remote_id)?;
        let command = self
            .processes
            .lock()
            .remove(process_id)
            .ok_or_else(|| ProviderError::Gone(format!("no process {process_id}")))?;
        Ok(self.respond(&CommandLine::Shell(command)))
    }

    async fn snapshot(&self, remote_id: &str) -> Result<String, ProviderError> {
        self.check_live(remote_id)?;
        Ok(format!("im-{remote_id}"))
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Configuration with a small timeout ceiling, suitable for tests.
pub fn test_config() -> BridgeConfig {
    BridgeConfig::default()
        .with_endpoint("http://provider.invalid")
        .with_max_timeout_seconds(3600)
        .with_output_byte_cap(64)
}

pub fn dispatcher_with(config: BridgeConfig, provider: Arc<FakeProvider>) -> CommandDispatcher {
    CommandDispatcher::new(Arc::new(config), provider)
}

pub fn dispatcher(provider: Arc<FakeProvider>) -> CommandDispatcher {
    dispatcher_with(test_config(), provider)
}
