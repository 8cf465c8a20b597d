//! wallet-sync CLI
//!
//! Operator surface over the synchronization engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wallet_sync::config::{default_config_path, Config};

mod commands;

#[derive(Parser)]
#[command(name = "wallet-sync")]
#[command(about = "Hierarchical wallet synchronized with an Electrum-style server")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Custom config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List root and derived nodes with their balances
    Nodes,

    /// Generate a new random root node
    AddRoot,

    /// Import a root node from an extended private key
    ImportRoot {
        /// Extended private key (prompted for when omitted)
        key: Option<String>,
    },

    /// Derive a child node from the active root node
    Derive {
        /// Child index (defaults to the next unused one)
        #[arg(long)]
        index: Option<u32>,

        /// Derive public key material only
        #[arg(long)]
        watch_only: bool,
    },

    /// Remove a node
    Remove {
        /// Node fingerprint (0x-prefixed)
        fingerprint: String,

        /// Child index within the parent
        child_index: u32,
    },

    /// Synchronize and follow chain updates
    Sync {
        /// Exit after the first reconciliation pass
        #[arg(long)]
        once: bool,
    },

    /// Send funds from the active derived node
    Send {
        /// Recipient address
        address: String,

        /// Amount in the smallest currency unit
        amount: u64,

        /// Fee in the smallest currency unit
        #[arg(long)]
        fee: u64,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    wallet_sync::logging::init(cli.verbose);

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Nodes => commands::nodes::run(&config).await,
        Commands::AddRoot => commands::add_root::run(&config).await,
        Commands::ImportRoot { key } => commands::import_root::run(&config, key).await,
        Commands::Derive { index, watch_only } => {
            commands::derive::run(&config, index, watch_only).await
        }
        Commands::Remove {
            fingerprint,
            child_index,
        } => commands::remove::run(&config, &fingerprint, child_index).await,
        Commands::Sync { once } => commands::sync::run(&config, once).await,
        Commands::Send {
            address,
            amount,
            fee,
            yes,
        } => commands::send::run(&config, &address, amount, fee, yes).await,
    }
}
