//! Sandbox session management.
//!
//! This module is the core of the bridge: it tracks which sandboxes exist,
//! what state each one is in, and turns tool intents into remote operations.
//!
//! # Architecture
//!
//! - [`SandboxRegistry`] is the single source of truth for sandbox state. All
//!   mutation goes through its transition-checked operations.
//! - [`CommandDispatcher`] validates tool calls, drives the registry state
//!   machine and calls the [`SandboxProvider`](crate::provider::SandboxProvider).
//! - [`Reaper`] periodically expires sandboxes past their deadline.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──► Ready ◄──► Running
//!    │          │           │
//!    ▼          ▼           ▼
//!  Failed   Terminated | TimedOut | Failed
//! ```
//!
//! Only `Ready` sandboxes accept commands or termination; retired sandboxes
//! (`Terminated`, `TimedOut`, `Failed`) accept nothing but an idempotent
//! terminate and informational status queries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandbox_session_bridge::config::BridgeConfig;
//! use sandbox_session_bridge::provider::HttpProvider;
//! use sandbox_session_bridge::session::{CommandDispatcher, CommandRequest, SandboxSpec};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(BridgeConfig::default().with_endpoint("https://sandboxes.example.com"));
//! let provider = Arc::new(HttpProvider::new(&config.provider)?);
//! let dispatcher = CommandDispatcher::new(config, provider);
//!
//! let created = dispatcher.create_sandbox(SandboxSpec::with_timeout(3600)).await?;
//! let handle = created.handle.to_string();
//! let result = dispatcher
//!     .run_command(&handle, CommandRequest::shell("echo hi"))
//!     .await?;
//! assert_eq!(result.stdout, "hi\n");
//!
//! dispatcher.terminate(&handle).await?;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod meta;
mod output;
mod reaper;
mod registry;

pub use dispatcher::{CommandDispatcher, CommandRequest, CreatedSandbox, SandboxSpec};
pub use meta::{SandboxRecord, SandboxStatus};
pub use output::{CommandResult, truncate_output};
pub use reaper::Reaper;
pub use registry::{ActiveOperation, ExpiredSandbox, SandboxRegistry};

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Caller-facing identifier of a sandbox.
///
/// Distinct from the provider's `remote_id`; stable for the lifetime of one
/// sandbox and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxHandle(Uuid);

impl SandboxHandle {
    /// Allocates a fresh, unique handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a handle supplied by a tool caller.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound`: a string that is not a handle cannot
    /// name any sandbox.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| SessionError::NotFound {
                handle: raw.to_string(),
            })
    }
}

impl Default for SandboxHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SandboxHandle {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = SandboxHandle::new();
        let b = SandboxHandle::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_roundtrips_through_display() {
        let handle = SandboxHandle::new();
        let parsed: SandboxHandle = handle.to_string().parse().expect("failed to parse");
        assert_eq!(parsed, handle);
    }

    #[test]
    fn test_garbage_handle_is_not_found() {
        let err = SandboxHandle::parse("not-a-handle").expect_err("should not parse");
        assert_eq!(
            err,
            SessionError::NotFound {
                handle: "not-a-handle".into()
            }
        );
    }
}
