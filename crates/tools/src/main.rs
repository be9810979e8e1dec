use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use streaming::PipelineConfig;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{archive, decode, encode, pack, query, simulate};

/// Decode, fetch and stream vector tile data from the command line.
#[derive(Parser, Debug)]
#[command(name = "tilepipe", author, version)]
struct Cli {
    /// Pipeline configuration (JSON); missing fields keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Decode(decode::DecodeArgs),
    Encode(encode::EncodeArgs),
    Pack(pack::PackArgs),
    Archive(archive::ArchiveArgs),
    Query(query::QueryArgs),
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Decode(args) => decode::run_decode(args, &config),
        Commands::Encode(args) => encode::run_encode(args),
        Commands::Pack(args) => pack::run_pack(args),
        Commands::Archive(args) => archive::run_archive(args, config).await,
        Commands::Query(args) => query::run_query(args, config).await,
        Commands::Simulate(args) => simulate::run_simulate(args, config).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    PipelineConfig::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
}
