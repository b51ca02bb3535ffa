//! Sandbox Session Bridge - Entry Point
//!
//! This is the main entry point for the MCP server binary.

use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, fmt};

use sandbox_session_bridge::{config::BridgeConfig, server};

/// Sandbox Session Bridge - Remote code sandboxes for AI agents.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the sandbox provider API
    #[arg(long, env = "SANDBOX_PROVIDER_URL")]
    provider_url: Option<String>,

    /// Bearer token for the sandbox provider API
    #[arg(long, env = "SANDBOX_PROVIDER_TOKEN", hide_env_values = true)]
    provider_token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // MCP requires that logs go to stderr (stdout is for JSON-RPC)
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Sandbox Session Bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            BridgeConfig::load(path)
                .inspect_err(|_| error!("Configuration could not be loaded"))?
        }
        None => BridgeConfig::default(),
    };

    if let Some(url) = args.provider_url {
        config = config.with_endpoint(url);
    }
    if let Some(token) = args.provider_token {
        config = config.with_token(token);
    }

    server::run(config).await.into_diagnostic()
}
