//! MobiSync CLI
//!
//! Command-line tools for inspecting the offline store of a MobiSync client.
//!
//! # Commands
//!
//! - `queue` - List pending operations
//! - `errors` - List recorded push failures
//! - `tokens` - List incremental pull delta tokens
//! - `reset-token` - Forget a delta token so the next pull starts over

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// MobiSync offline store tools.
#[derive(Parser)]
#[command(name = "mobisync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store snapshot file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending operations in push order
    Queue {
        /// Only show operations for this table
        #[arg(short, long)]
        table: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List push failures that were recorded but not acknowledged
    Errors {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List delta tokens of incremental pulls
    Tokens {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Forget a delta token
    ResetToken {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// Query id
        #[arg(short, long)]
        query_id: String,
    },

    /// Show version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Queue { table, format } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            commands::queue::run(&path, table.as_deref(), &format).await?;
        }
        Commands::Errors { format } => {
            let path = cli.path.ok_or("Store path required for errors")?;
            commands::errors::run(&path, &format).await?;
        }
        Commands::Tokens { format } => {
            let path = cli.path.ok_or("Store path required for tokens")?;
            commands::tokens::list(&path, &format).await?;
        }
        Commands::ResetToken { table, query_id } => {
            let path = cli.path.ok_or("Store path required for reset-token")?;
            commands::tokens::reset(&path, &table, &query_id).await?;
        }
        Commands::Version => {
            println!("MobiSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("MobiSync Core v{}", mobisync_core::VERSION);
        }
    }

    Ok(())
}
