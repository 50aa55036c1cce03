//! MCP Kubernetes - MCP server with OAuth 2.1 and multi-cluster federation

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use mcp_kubernetes::{
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Missing .env is normal
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Version)) {
        println!("mcp-kubernetes {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    if let Err(e) = setup_tracing(level, Some(format)) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let warnings = match config.validate() {
        Ok(warnings) => warnings,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    for warning in &warnings {
        warn!("{warning}");
    }

    match cli.command {
        Some(Command::ValidateConfig) => {
            info!(warnings = warnings.len(), "Configuration is valid");
            ExitCode::SUCCESS
        }
        _ => match run_server(config).await {
            Ok(()) => {
                info!("Shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Server error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Defaults, then file, then `MCP_KUBERNETES_*` environment, then flags
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(Command::Serve(args)) = &cli.command {
        args.apply(&mut config);
    }
    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        oauth = config.oauth.enabled,
        federation = config.federation.enabled,
        "Starting MCP Kubernetes"
    );
    let server = Server::new(config).await.context("initialising server")?;
    server.run().await.context("serving")?;
    Ok(())
}
