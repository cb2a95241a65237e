//! tillsync CLI
//!
//! Operator tools for a station's local data directory.
//!
//! # Commands
//!
//! - `inspect` - Show record counts, queue state and log sizes
//! - `queue` - List mutation queue entries
//! - `dead-letters` - List quarantined queue frames
//! - `retry-failed` - Return `Failed` entries to the queue
//! - `gc` - Drop acknowledged entries and compact logs
//! - `verify` - Check every log frame by frame without modifying anything
//!
//! Every command except `verify` takes the directory lock, so it cannot run
//! while the station itself has the directory open.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tillsync station data tools.
#[derive(Parser)]
#[command(name = "tillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the station data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts, queue state and log sizes
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List mutation queue entries
    Queue {
        /// Only entries in this state (pending, in-flight, failed, done)
        #[arg(short, long)]
        state: Option<String>,

        /// Maximum number of entries to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List quarantined queue frames
    DeadLetters {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Return failed entries to the queue
    RetryFailed {
        /// Entry id (hex) to retry
        entry: Option<String>,

        /// Retry every failed entry
        #[arg(short, long)]
        all: bool,
    },

    /// Drop acknowledged entries past retention and compact logs
    Gc {
        /// Also rewrite every collection log
        #[arg(short, long)]
        compact: bool,
    },

    /// Check every log frame by frame
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Data directory required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::Queue {
            state,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for queue")?;
            commands::queue::run(&path, state.as_deref(), limit, format)?;
        }
        Commands::DeadLetters { format } => {
            let path = cli.path.ok_or("Data directory required for dead-letters")?;
            commands::dead_letters::run(&path, format)?;
        }
        Commands::RetryFailed { entry, all } => {
            let path = cli.path.ok_or("Data directory required for retry-failed")?;
            commands::retry::run(&path, entry.as_deref(), all)?;
        }
        Commands::Gc { compact } => {
            let path = cli.path.ok_or("Data directory required for gc")?;
            commands::gc::run(&path, compact)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Data directory required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("tillsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "log format v{}",
                tillsync_core::frame::FORMAT_VERSION
            );
        }
    }

    Ok(())
}
