//! pipeagent - main entry point
//!
//! Loads settings, builds the agent with injected components, and drives
//! it until a termination signal arrives.

use clap::{Parser, Subcommand};
use pipeagent::config::AgentSettings;
use pipeagent::observability::init_default_logging;
use pipeagent::AgentCoordinator;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Deadline for the shutdown sequence
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Node-side management agent for centrally-managed log pipeline fleets
#[derive(Parser)]
#[command(name = "pipeagent")]
#[command(about = "Node-side management agent for centrally-managed log pipeline fleets")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting pipeagent v{}", env!("CARGO_PKG_VERSION"));

    let settings = match load_settings(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(settings).await,
        Commands::Config { show } => handle_config_command(settings, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_settings(
    config_path: &Option<PathBuf>,
) -> Result<AgentSettings, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(AgentSettings::load_from_file(path)?)
        }
        None => {
            // Try default locations
            let default_paths = vec!["pipeagent.toml", "config/pipeagent.toml", "/etc/pipeagent/pipeagent.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(AgentSettings::load_from_file(&path)?);
                }
            }

            error!(
                "No configuration file found. Please provide one with -c/--config or create pipeagent.toml"
            );
            process::exit(1);
        }
    }
}

async fn run_agent(settings: AgentSettings) -> Result<(), Box<dyn std::error::Error>> {
    let agent = AgentCoordinator::from_settings(settings).await?;
    info!("Agent id: {}", agent.agent_id());

    agent.start().await?;

    // Wait for a termination signal
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Agent is running");
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    agent.stop(SHUTDOWN_DEADLINE).await?;
    Ok(())
}

fn handle_config_command(
    settings: AgentSettings,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&settings)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
