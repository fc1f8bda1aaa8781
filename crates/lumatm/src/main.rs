//! LumaTM - Transaction journal tool
//!
//! Inspects the dual-file journal of a LumaTM transaction manager:
//! - dump every record of both journal files
//! - list the transactions recovery still has to complete
//! - print the effective configuration

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

mod cli;

#[derive(Parser)]
#[command(name = "lumatm")]
#[command(author, version, about = "LumaTM - XA transaction journal tool", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "LUMATM_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the header and every record of both journal files
    Dump {
        /// First journal file
        #[arg(long, default_value = "lumatm1.tlog")]
        part1: PathBuf,

        /// Second journal file
        #[arg(long, default_value = "lumatm2.tlog")]
        part2: PathBuf,

        /// Skip records failing their checksum
        #[arg(long)]
        skip_corrupted: bool,
    },

    /// List transactions left in doubt in the configured journal
    Dangling {
        /// Configuration file path (TOML or JSON)
        #[arg(short, long, env = "LUMATM_CONFIG")]
        config: PathBuf,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Configuration file path (TOML or JSON)
        #[arg(short, long, env = "LUMATM_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("lumatm={}", cli.log_level).parse()?)
                .add_directive(format!("lumatm_journal={}", cli.log_level).parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Dump {
            part1,
            part2,
            skip_corrupted,
        } => {
            debug!("dumping {} and {}", part1.display(), part2.display());
            let mut out = std::io::stdout().lock();
            cli::dump(&mut out, &part1, skip_corrupted)?;
            cli::dump(&mut out, &part2, skip_corrupted)?;
        }

        Commands::Dangling { config } => {
            let config = lumatm_common::Config::load(&config)?;
            cli::dangling(&mut std::io::stdout().lock(), &config)?;
        }

        Commands::Config { config } => {
            let config = match config {
                Some(path) => lumatm_common::Config::load(path)?,
                None => lumatm_common::Config::default(),
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Version => {
            println!("LumaTM version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
