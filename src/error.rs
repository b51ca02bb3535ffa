//! Error types for the sandbox session bridge.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use crate::session::SandboxStatus;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error")]
    #[diagnostic(code(bridge::config))]
    Config(#[from] ConfigError),

    /// MCP server error
    #[error("MCP server error")]
    #[diagnostic(code(bridge::server))]
    Server(#[from] ServerError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(bridge::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read configuration file {path}")]
    #[diagnostic(code(bridge::config::read_failed))]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML or has unknown fields
    #[error("Failed to parse configuration file {path}: {reason}")]
    #[diagnostic(
        code(bridge::config::parse_failed),
        help("Compare the file against config.example.toml")
    )]
    ParseFailed { path: String, reason: String },

    /// A value is out of range or inconsistent with another value
    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(bridge::config::invalid))]
    Invalid(String),

    /// No provider endpoint was configured
    #[error("No sandbox provider endpoint configured")]
    #[diagnostic(
        code(bridge::config::no_provider),
        help("Pass --provider-url or set SANDBOX_PROVIDER_URL")
    )]
    MissingEndpoint,
}

/// Errors related to the MCP server.
#[derive(Error, Debug, Diagnostic)]
pub enum ServerError {
    /// Failed to initialize server
    #[error("Failed to initialize MCP server: {0}")]
    #[diagnostic(code(bridge::server::init))]
    InitializationFailed(String),

    /// Transport error
    #[error("Transport error: {0}")]
    #[diagnostic(code(bridge::server::transport))]
    Transport(String),
}

/// Errors surfaced to tool callers by the session manager.
///
/// Every variant maps to a stable [`ErrorKind`] so the assistant can decide
/// whether to retry, report, or adjust its request.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Bad tool-call parameters
    #[error("Invalid argument: {reason}")]
    #[diagnostic(code(bridge::session::invalid_argument))]
    InvalidArgument { reason: String },

    /// Unknown handle, or a handle that can no longer be used
    #[error("Sandbox not found: {handle}")]
    #[diagnostic(
        code(bridge::session::not_found),
        help("Create a sandbox with create_sandbox first")
    )]
    NotFound { handle: String },

    /// Operation not valid for the sandbox's current lifecycle state
    #[error("Cannot {action} sandbox {handle} while it is {from}")]
    #[diagnostic(code(bridge::session::invalid_state))]
    InvalidStateTransition {
        handle: String,
        from: SandboxStatus,
        action: String,
    },

    /// Remote provider failed to create the sandbox
    #[error("Provisioning failed: {detail}")]
    #[diagnostic(code(bridge::session::provisioning))]
    Provisioning { detail: String },

    /// Remote provider failed while running an operation in the sandbox
    #[error("Execution failed: {detail}")]
    #[diagnostic(code(bridge::session::execution))]
    Execution { detail: String },

    /// The sandbox deadline elapsed
    #[error("Sandbox {handle} exceeded its {timeout_seconds}s deadline")]
    #[diagnostic(
        code(bridge::session::timeout),
        help("Create a new sandbox, optionally with a larger timeout_seconds")
    )]
    Timeout { handle: String, timeout_seconds: u64 },
}

/// Stable, serializable classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidStateTransition,
    ProvisioningError,
    ExecutionError,
    Timeout,
}

impl SessionError {
    /// Shorthand for an [`SessionError::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns the error's kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::Provisioning { .. } => ErrorKind::ProvisioningError,
            Self::Execution { .. } => ErrorKind::ExecutionError,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Errors reported by a [`crate::provider::SandboxProvider`].
///
/// These never reach the tool caller directly; the dispatcher converts them
/// into [`SessionError`] variants depending on the operation.
#[derive(Error, Debug, Diagnostic)]
pub enum ProviderError {
    /// The provider could not be reached at all
    #[error("provider unavailable: {0}")]
    #[diagnostic(code(bridge::provider::unavailable))]
    Unavailable(String),

    /// The remote sandbox (or process) no longer exists
    #[error("remote resource no longer exists: {0}")]
    #[diagnostic(code(bridge::provider::gone))]
    Gone(String),

    /// The provider refused the request
    #[error("provider rejected request ({status}): {body}")]
    #[diagnostic(code(bridge::provider::rejected))]
    Rejected { status: u16, body: String },

    /// The connection dropped mid-request
    #[error("transport error: {0}")]
    #[diagnostic(code(bridge::provider::transport))]
    Transport(String),

    /// The remote call did not finish in time
    #[error("remote call timed out after {seconds}s")]
    #[diagnostic(code(bridge::provider::timeout))]
    Timeout { seconds: u64 },

    /// The provider answered with something we could not understand
    #[error("unexpected provider response: {0}")]
    #[diagnostic(code(bridge::provider::protocol))]
    Protocol(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
