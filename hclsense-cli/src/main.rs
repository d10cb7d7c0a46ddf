//! # hclsense CLI
//!
//! Command-line interface for the hclsense analysis engine.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hclsense")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = hclsense_features::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every configuration directory below DIR and report diagnostics
    Check {
        /// Root directory to analyze
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Emit JSON lines instead of text
        #[arg(long)]
        json: bool,

        /// Print job statistics after the run
        #[arg(long)]
        stats: bool,
    },

    /// Analyze DIR, then re-analyze on file changes until interrupted
    Watch {
        /// Root directory to watch
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Check { dir, json, stats } => {
            commands::check(&cli.config, &dir, commands::CheckOptions { json, stats }).await
        }
        Commands::Watch { dir } => commands::watch(&cli.config, &dir).await,
    }
}
