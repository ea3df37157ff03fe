//! resumedl CLI - resumable downloads from the terminal
//!
//! Fetches a URL over several parallel streams, keeps a history of every
//! download and picks interrupted ones back up where they stopped.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use resumedl_types::EngineSettings;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// resumedl - Resumable multi-stream downloader
#[derive(Parser)]
#[command(name = "resumedl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the download history
    #[arg(long, env = "RESUMEDL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON file with engine settings
    #[arg(long, env = "RESUMEDL_CONFIG")]
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
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL and wait for it to finish
    #[command(alias = "add")]
    Get {
        /// URL to download
        url: String,

        /// Directory to save into
        #[arg(short = 'd', long)]
        dir: Option<PathBuf>,

        /// Number of parallel streams
        #[arg(short, long)]
        streams: Option<u32>,
    },

    /// List downloads from the history
    #[command(alias = "history")]
    List {
        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Resume an interrupted download and wait for it to finish
    Resume {
        /// Download ID
        id: u32,
    },

    /// Remove a download from the history
    Remove {
        /// Download ID
        id: u32,
    },

    /// Probe URLs for size, name and range support
    Probe {
        /// URLs to probe
        urls: Vec<String>,
    },

    /// Show the effective settings
    Config,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<EngineSettings> {
    let Some(path) = path else {
        return Ok(EngineSettings::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "resumedl", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("resumedl"))
            .unwrap_or_else(|| PathBuf::from(".resumedl"))
    });
    let mut settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Get { url, dir, streams } => {
            if let Some(dir) = dir {
                settings.default_download_path = dir;
            }
            if let Some(streams) = streams {
                settings.parallel_streams = streams.max(1);
            }
            commands::get(settings, data_dir, &url, cli.output).await?
        }

        Commands::List { all } => commands::list_downloads(data_dir, all, cli.output).await?,

        Commands::Resume { id } => commands::resume_download(settings, data_dir, id, cli.output).await?,

        Commands::Remove { id } => commands::remove_download(settings, data_dir, id, cli.output).await?,

        Commands::Probe { urls } => commands::probe_urls(settings, urls, cli.output).await?,

        Commands::Config => output::print_json(&settings)?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
