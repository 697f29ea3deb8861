//! Nether Reel CLI - Inspect recorded replay streams
//!
//! # Commands
//!
//! - `nether-reel info` - Header fields, totals and metadata
//! - `nether-reel segments` - The segment table
//! - `nether-reel dump` - Entries of one snapshot
//! - `nether-reel verify` - Load every segment and check its integrity
//!
//! # Usage
//!
//! ```bash
//! # Summary of a recording
//! nether-reel info session.nreel
//!
//! # Snapshot closest to t=12.5s, with pointers left as stored
//! nether-reel dump session.nreel --time 12.5 --raw
//!
//! # Use custom storage settings
//! nether-reel --config reel.toml verify session.nreel
//! ```

mod dump;
mod info;
mod segments;
mod stream;
mod verify;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Nether Reel CLI - Inspect recorded replay streams
#[derive(Parser)]
#[command(name = "nether-reel")]
#[command(about = "Inspect Nether Reel replay streams")]
#[command(version)]
struct Cli {
    /// TOML file with storage settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output from the storage engine
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header fields, totals and metadata
    Info {
        /// Stream file (.nreel)
        file: PathBuf,
    },

    /// List the segment table
    Segments {
        /// Stream file (.nreel)
        file: PathBuf,
    },

    /// Print the entries of one snapshot
    Dump(dump::DumpArgs),

    /// Load every segment and check table contiguity and pointers
    Verify {
        /// Stream file (.nreel)
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = stream::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info { file } => info::execute(&file, config),
        Commands::Segments { file } => segments::execute(&file, config),
        Commands::Dump(args) => dump::execute(args, config),
        Commands::Verify { file } => verify::execute(&file, config).map(|_| ()),
    }
}
