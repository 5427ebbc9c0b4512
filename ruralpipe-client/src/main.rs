use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ruralpipe_core::control::{ClientConfig, ConfigRecord};

mod runtime;

/// RuralPipe client daemon.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run in the foreground until interrupted.
    Run,

    /// Write a config file with the default settings.
    InitConfig {
        /// Replace the file if it already exists.
        #[arg(long)]
        force: bool,
    },

    /// Show which config file would be used.
    PrintConfigPath,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => ClientConfig::default_path()?,
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = ClientConfig::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            runtime::run_client(config).await
        }
        Command::InitConfig { force } => {
            ClientConfig::default().save(&path, force)?;
            println!("Wrote default config to {}", path.display());
            Ok(())
        }
        Command::PrintConfigPath => {
            println!("{}", path.display());
            Ok(())
        }
    }
}
