//! Market data ingestion CLI
//!
//! A command-line tool for inspecting quota usage and pipeline health
//! reported by a running ingestd.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, stats};

/// Market data ingestion CLI
#[derive(Parser)]
#[command(name = "ingestctl")]
#[command(author, version, about = "CLI for the market data ingestion daemon", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via INGEST_API_URL env var)
    #[arg(long, env = "INGEST_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show quota usage and call statistics
    Stats,

    /// Show the latest health check results
    Health,

    /// Show persisted health results, newest first
    History {
        /// Maximum number of results
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let format = cli
        .format
        .or_else(|| config.default_format.as_deref().and_then(output::OutputFormat::from_name))
        .unwrap_or_default();

    // Initialize client
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url))?;

    // Execute command
    match cli.command {
        Commands::Stats => stats::show_stats(&client, format).await?,
        Commands::Health => health::show_health(&client, format).await?,
        Commands::History { limit } => health::show_history(&client, limit, format).await?,
    }

    Ok(())
}
