//! Resumable CLI - restart-safe HTTP downloads
//!
//! Progress is kept in a SQLite database, so an interrupted `get` picks up
//! where it stopped the next time it runs for the same URL.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resumable - download over flaky connections
#[derive(Parser)]
#[command(name = "resumable")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the progress database
    #[arg(long, env = "RESUMABLE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON file with transfer settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL, resuming any stored progress
    Get {
        /// URL to download
        url: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Extra request header, as 'Name: value'
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Discard stored progress and start from zero
        #[arg(long)]
        fresh: bool,

        /// Bytes requested per continuation window
        #[arg(long)]
        step_window: Option<u64>,

        /// Consecutive transient failures tolerated
        #[arg(long)]
        max_retries: Option<u32>,

        /// Give up after this many seconds
        #[arg(long)]
        max_duration: Option<u64>,
    },

    /// Show stored progress for a URL
    Status {
        /// URL of the transfer
        url: String,
    },

    /// Drop stored progress for a URL
    Forget {
        /// URL of the transfer
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("resumable"))
            .unwrap_or_else(|| PathBuf::from(".resumable"))
    });
    let db_path = data_dir.join("transfers.db");

    match cli.command {
        Commands::Get {
            url,
            output,
            headers,
            fresh,
            step_window,
            max_retries,
            max_duration,
        } => {
            let mut settings = commands::load_settings(cli.config.as_deref()).await?;
            if let Some(step) = step_window {
                settings.step_window = step;
            }
            if let Some(retries) = max_retries {
                settings.retry.max_retries = Some(retries);
            }
            if let Some(secs) = max_duration {
                settings.max_duration_secs = Some(secs);
            }

            let request = commands::GetRequest {
                url,
                output,
                headers,
                fresh,
            };
            commands::get(&db_path, request, settings, cli.output).await?
        }

        Commands::Status { url } => commands::status(&db_path, &url, cli.output).await?,

        Commands::Forget { url } => commands::forget(&db_path, &url, cli.output).await?,
    }

    Ok(())
}
