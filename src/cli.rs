//! Command-line interface

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::config::Config;

/// MCP server for Kubernetes with OAuth 2.1 and multi-cluster federation
#[derive(Parser, Debug)]
#[command(name = "mcp-kubernetes")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_KUBERNETES_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides `logging.level`
    #[arg(long, env = "MCP_KUBERNETES_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json); overrides `logging.format`
    #[arg(long, env = "MCP_KUBERNETES_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve(ServeArgs),

    /// Load and validate the configuration, then exit
    ValidateConfig,

    /// Print version information
    Version,
}

/// Overrides for `serve`
#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, env = "MCP_KUBERNETES_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_KUBERNETES_PORT")]
    pub port: Option<u16>,

    /// Public base URL (OAuth issuer)
    #[arg(long, env = "MCP_KUBERNETES_BASE_URL")]
    pub base_url: Option<String>,

    /// Enable the OAuth authorization server
    #[arg(long, action = ArgAction::SetTrue, overrides_with = "no_oauth")]
    pub oauth: bool,

    /// Disable the OAuth authorization server
    #[arg(long, action = ArgAction::SetTrue, overrides_with = "oauth")]
    pub no_oauth: bool,
}

impl ServeArgs {
    /// Apply flags on top of file and environment configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(base_url) = &self.base_url {
            config.oauth.base_url.clone_from(base_url);
        }
        if self.oauth {
            config.oauth.enabled = true;
        } else if self.no_oauth {
            config.oauth.enabled = false;
        }
    }
}
