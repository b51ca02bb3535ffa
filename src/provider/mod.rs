//! Remote sandbox provider abstraction.
//!
//! Defines the [`SandboxProvider`] capability trait the session manager drives.
//! The provider owns the actual compute; the bridge only ever refers to it by
//! the opaque `remote_id` returned from [`SandboxProvider::provision`].
//!
//! - [`http::HttpProvider`]: JSON REST client for a hosted sandbox service

pub mod http;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ResourceProfile;
use crate::error::ProviderError;

pub use http::HttpProvider;

/// What to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A shell command line, run through `sh -c`.
    Shell(String),
    /// An argument vector executed directly.
    Argv(Vec<String>),
}

impl CommandLine {
    /// Returns the argument vector sent to the provider.
    #[must_use]
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            Self::Argv(argv) => argv.clone(),
        }
    }

    /// Returns true if there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(line) => line.trim().is_empty(),
            Self::Argv(argv) => argv.first().is_none_or(|program| program.is_empty()),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell(line) => write!(f, "{line}"),
            Self::Argv(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// Parameters for creating a remote sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    /// Resource profile from the whitelist.
    pub profile: &'a ResourceProfile,
    /// Lifetime the provider should enforce on its side as well.
    pub timeout: Duration,
    /// Filesystem snapshot to restore from.
    pub image_id: Option<&'a str>,
}

/// A successfully provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// Provider-side identifier.
    pub remote_id: String,
    /// Exposed ports mapped to their public URLs.
    pub tunnels: BTreeMap<u16, String>,
}

/// Parameters for running a command in a sandbox.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub command: &'a CommandLine,
    pub cwd: Option<&'a str>,
    pub env: &'a HashMap<String, String>,
    /// Round-trip limit the provider should apply.
    pub timeout: Duration,
}

/// Raw output of a finished command as returned by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Capability interface to the remote sandbox service.
///
/// Implementations must be safe to call concurrently for different sandboxes.
/// None of the methods retry on their own: remote side effects may not be
/// idempotent.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Human-readable provider name for logging.
    fn name(&self) -> &str;

    /// Create a sandbox.
    async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<Provisioned, ProviderError>;

    /// Tear a sandbox down. Implementations map "already gone" to `Ok(())`.
    async fn terminate(&self, remote_id: &str) -> Result<(), ProviderError>;

    /// Run a command to completion.
    async fn exec(&self, remote_id: &str, request: &ExecRequest<'_>)
    -> Result<RawOutput, ProviderError>;

    /// Start a command without waiting for it. Returns a provider process id.
    async fn spawn(&self, remote_id: &str, request: &ExecRequest<'_>)
    -> Result<String, ProviderError>;

    /// Wait for a previously spawned command to finish.
    async fn wait(
        &self,
        remote_id: &str,
        process_id: &str,
        timeout: Duration,
    ) -> Result<RawOutput, ProviderError>;

    /// Snapshot the sandbox filesystem. Returns an image id usable for restore.
    async fn snapshot(&self, remote_id: &str) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_argv() {
        let cmd = CommandLine::Shell("echo hi".into());
        assert_eq!(cmd.to_argv(), vec!["sh", "-c", "echo hi"]);
        assert_eq!(cmd.to_string(), "echo hi");
    }

    #[test]
    fn test_argv_passthrough() {
        let cmd = CommandLine::Argv(vec!["ls".into(), "-l".into(), "/".into()]);
        assert_eq!(cmd.to_argv(), vec!["ls", "-l", "/"]);
        assert_eq!(cmd.to_string(), "ls -l /");
    }

    #[test]
    fn test_empty_commands() {
        assert!(CommandLine::Shell("   ".into()).is_empty());
        assert!(CommandLine::Argv(vec![]).is_empty());
        assert!(CommandLine::Argv(vec![String::new()]).is_empty());
        assert!(!CommandLine::Argv(vec!["true".into()]).is_empty());
    }
}
