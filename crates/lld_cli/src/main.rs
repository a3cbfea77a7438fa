//! LLD CLI
//!
//! Command-line tools for LLD context directories.
//!
//! # Commands
//!
//! - `inspect` - Display per-instance statistics
//! - `verify` - Check journals, commit record, bloom snapshots and sectors
//! - `recover` - Resolve journals left by an interrupted commit
//! - `get` - Print the value of a key
//! - `keys` - List the keys of an instance

mod commands;

use clap::{Args, Parser, Subcommand};
use lld_core::{Instance, DEFAULT_BUCKETS};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LLD command-line database tools.
#[derive(Parser)]
#[command(name = "lld")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the context directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(flatten)]
    geometry: Geometry,

    #[command(subcommand)]
    command: Commands,
}

/// Hashmap keychain geometry the context was created with.
#[derive(Args, Debug, Clone, Copy)]
pub struct Geometry {
    /// Hashmap bucket count
    #[arg(global = true, long, default_value_t = DEFAULT_BUCKETS)]
    pub buckets: u32,

    /// Largest key a hashmap slot holds
    #[arg(global = true, long, default_value_t = 64)]
    pub max_key_size: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// Display per-instance statistics
    Inspect {
        /// Only this instance
        #[arg(short, long)]
        instance: Option<Instance>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify context integrity
    Verify {
        /// Read every value, not just the metadata
        #[arg(short, long)]
        deep: bool,
    },

    /// Resolve journals left by an interrupted commit
    Recover {
        /// Show what would be done without changing anything
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Print the value of a key
    Get {
        /// Instance holding the key
        instance: Instance,

        /// Key, as text or as 0x-prefixed hex
        key: String,

        /// Print the value as hex
        #[arg(short = 'x', long)]
        hex: bool,
    },

    /// List the keys of an instance
    Keys {
        /// Instance to list
        instance: Instance,

        /// Maximum number of keys to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { instance, format } => {
            let path = cli.path.ok_or("Context path required for inspect")?;
            commands::inspect::run(&path, cli.geometry, instance, &format)?;
        }
        Commands::Verify { deep } => {
            let path = cli.path.ok_or("Context path required for verify")?;
            commands::verify::run(&path, cli.geometry, deep)?;
        }
        Commands::Recover { dry_run } => {
            let path = cli.path.ok_or("Context path required for recover")?;
            commands::recover::run(&path, cli.geometry, dry_run)?;
        }
        Commands::Get { instance, key, hex } => {
            let path = cli.path.ok_or("Context path required for get")?;
            commands::get::run(&path, cli.geometry, instance, &key, hex)?;
        }
        Commands::Keys { instance, limit } => {
            let path = cli.path.ok_or("Context path required for keys")?;
            commands::keys::run(&path, cli.geometry, instance, limit)?;
        }
        Commands::Version => {
            println!("LLD CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("LLD Core v{}", lld_core::VERSION);
        }
    }

    Ok(())
}
