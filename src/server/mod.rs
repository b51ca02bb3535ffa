//! MCP server implementation.
//!
//! Exposes the session manager as MCP tools over stdio. Tool failures are
//! reported as tool results with `is_error` set, never as protocol errors.

mod handler;

pub use handler::{
    CreateSandboxParams, HandleParams, InstallPackageParams, RunCommandParams, SandboxServer,
    WaitForProcessParams, render, run,
};
