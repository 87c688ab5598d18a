//! Steward node binary.
//!
//! Runs one maintenance command against a standalone node: backups and restores of the
//! local datastore, and management of the backup artifacts.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use steward::backup::Page;
use steward_telemetry::tracing::init_tracing;
use tracing::info;

use crate::config::load_node_config;
use crate::core::{build_node, wait_for};

mod config;
mod core;
mod store;

#[derive(Parser)]
#[command(name = "steward-node", about = "Backup and restore maintenance for a steward node")]
struct Args {
    /// Directory holding the base and environment configuration files.
    #[arg(long, default_value = "configuration")]
    config_dir: PathBuf,

    /// Directory holding the datastore records.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up the datastore
    Backup,
    /// List backups, newest first
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show the most recent backup
    Latest,
    /// Delete a backup
    Delete { name: String },
    /// Restore the datastore from a backup
    Restore { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_node_config(&args.config_dir)?;
    init_tracing(env!("CARGO_BIN_NAME"));

    let node = build_node(&config, &args.data_dir)?;
    let removed = node.recover().await?;
    if removed > 0 {
        info!(removed, "removed partial archives of an interrupted backup");
    }

    match args.command {
        Command::Backup => {
            let monitor = node.start_backup().await?;
            wait_for(&monitor).await?;
            if let Some(latest) = node.get_latest().await? {
                println!("{}", serde_json::to_string_pretty(&latest)?);
            }
        }
        Command::List { offset, limit } => {
            let page = node.find_all(Page::new(offset, limit)).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Latest => match node.get_latest().await? {
            Some(latest) => println!("{}", serde_json::to_string_pretty(&latest)?),
            None => println!("no backups"),
        },
        Command::Delete { name } => {
            node.delete(&name).await?;
            println!("deleted {name}");
        }
        Command::Restore { name } => {
            let monitor = node.start_restore(&name).await?;
            wait_for(&monitor).await?;
            println!("restored {name}");
        }
    }

    Ok(())
}
