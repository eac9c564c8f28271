use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memoria::config::MemoriaConfig;
use memoria::{cli, server};

#[derive(Parser)]
#[command(name = "memoria", version, about = "Conversational memory for agent tool APIs")]
struct Cli {
    /// Config file (defaults to ~/.memoria/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server and the background indexer
    Serve,
    /// Rebuild the vector index from the event store
    Reindex,
    /// Check database integrity, counts, and indexer lag
    Doctor,
    /// List sessions with recent activity
    Sessions {
        /// Look-back window in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
    /// Manage the local embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the ONNX model and tokenizer to embedding.cache_dir
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => MemoriaConfig::load_from(path)?,
        None => MemoriaConfig::load()?,
    };

    // stderr keeps stdout clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve(config).await?,
        Command::Reindex => cli::reindex::reindex(config).await?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Sessions { hours } => cli::sessions::sessions(config, hours).await?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
    }

    Ok(())
}
