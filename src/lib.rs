//! Sandbox Session Bridge - MCP tools for remote code sandboxes.
//!
//! This crate lets an AI assistant create short-lived remote sandboxes, run
//! commands and install packages in them, and tear them down again. It keeps
//! an in-process registry of every sandbox, enforces each sandbox's lifetime,
//! and talks to the sandbox provider over HTTP.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_session_bridge::{config::BridgeConfig, server};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let config = BridgeConfig::default().with_endpoint("https://sandboxes.example.com");
//!
//!     // Serve tools over stdio
//!     server::run(config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod provider;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use error::{Error, Result, SessionError};
pub use provider::{HttpProvider, SandboxProvider};
pub use session::{CommandDispatcher, CommandResult, SandboxHandle, SandboxStatus};
