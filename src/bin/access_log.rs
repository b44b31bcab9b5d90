//! access_log - inspect and prune the camwatch access log

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use camwatch::config::CamwatchConfig;
use camwatch::event_log::AccessLogStore;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the access log database (defaults to the configured path).
    #[arg(long)]
    db_path: Option<String>,
    /// Snapshot image directory (defaults to the configured directory).
    #[arg(long)]
    images_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print entries newest-first as JSON lines.
    List {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Delete one entry and its snapshot.
    Delete { id: String },
    /// Delete every entry and snapshot.
    Clear,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = CamwatchConfig::load()?;

    let db_path = args.db_path.unwrap_or(cfg.access_log.db_path);
    let images_dir = args
        .images_dir
        .map(PathBuf::from)
        .unwrap_or(cfg.access_log.images_dir);
    let store = AccessLogStore::open(&db_path, &images_dir, cfg.access_log.max_entries)?;

    match args.command {
        Command::List { limit } => {
            for entry in store.list(limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Delete { id } => {
            if !store.delete(&id)? {
                return Err(anyhow!("no access log entry {}", id));
            }
            println!("deleted {}", id);
        }
        Command::Clear => {
            let cleared = store.clear()?;
            println!("cleared {} entries", cleared);
        }
    }
    Ok(())
}
