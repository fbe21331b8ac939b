//! xpub-tracker CLI Application
//!
//! A command-line interface for inspecting derivation schemes and managing
//! the tracked set in a data directory.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use xpub_tracker::cli;
use xpub_tracker::core::Network;
use xpub_tracker::indexer::ExplorerConfig;

#[derive(Parser)]
#[command(name = "xpub-tracker")]
#[command(version = "0.1.0")]
#[command(about = "Watch-only HD wallet tracker", long_about = None)]
struct Cli {
    /// Data directory for the store
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network: main, test or regtest
    #[arg(short, long)]
    network: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unused scripts kept ahead of the highest used one
    #[arg(short, long)]
    gap_limit: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the canonical form and keys of a scheme
    Inspect { scheme: String },

    /// Derive scripts of a scheme
    Derive {
        scheme: String,

        /// deposit or change
        #[arg(short, long, default_value = "deposit")]
        feature: String,

        /// First index
        #[arg(long, default_value = "0")]
        from: u32,

        /// Number of scripts
        #[arg(long, default_value = "10")]
        count: u32,
    },

    /// Start tracking a scheme
    Track { scheme: String },

    /// Stop tracking a scheme
    Untrack { scheme: String },

    /// List tracked schemes
    List,

    /// Show the next unused script
    Unused {
        scheme: String,

        #[arg(short, long, default_value = "deposit")]
        feature: String,

        /// Unused scripts to pass over
        #[arg(short, long, default_value = "0")]
        skip: usize,
    },

    /// Find the scheme and key path of a script
    Lookup {
        /// Script in hex
        script: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExplorerConfig::load(path)?,
        None => ExplorerConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(network) = &cli.network {
        config.network = network.parse::<Network>()?;
    }
    if let Some(gap_limit) = cli.gap_limit {
        if gap_limit == 0 {
            return Err("gap limit must be at least 1".into());
        }
        config.gap_limit = gap_limit;
    }

    match cli.command {
        Commands::Inspect { scheme } => cli::cmd_inspect(config.network, &scheme)?,
        Commands::Derive {
            scheme,
            feature,
            from,
            count,
        } => cli::cmd_derive(config.network, &scheme, &feature, from, count)?,
        Commands::Track { scheme } => cli::cmd_track(&cli::open_explorer(config)?, &scheme)?,
        Commands::Untrack { scheme } => {
            cli::cmd_untrack(&cli::open_explorer(config)?, &scheme)?
        }
        Commands::List => cli::cmd_list(&cli::open_explorer(config)?)?,
        Commands::Unused {
            scheme,
            feature,
            skip,
        } => cli::cmd_unused(&cli::open_explorer(config)?, &scheme, &feature, skip)?,
        Commands::Lookup { script } => cli::cmd_lookup(&cli::open_explorer(config)?, &script)?,
    }

    Ok(())
}
