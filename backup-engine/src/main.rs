//! Backup Engine - command line entry point
//!
//! One-shot runs for cron jobs and systemd timers.

use anyhow::{Context, Result};
use backup_engine::{config::Config, consolidator::ConsolidationOutcome, utils, Engine};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a new raw generation of the storage root
    Backup,
    /// Consolidate the newest raw generation into a local archive
    Archive,
    /// Apply retention to local archives and bucket generations
    Sweep,
    /// Dump, compress and upload the session database
    DbBackup,
    /// Decrypt a local archive generation into a directory
    Restore {
        /// Directory to restore into
        #[arg(short, long)]
        target: PathBuf,

        /// Generation name (default: newest local archive)
        #[arg(short, long)]
        generation: Option<String>,
    },
    /// List generations in the bucket
    List,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "backup-engine v{} (role: {})",
        env!("CARGO_PKG_VERSION"),
        config.role
    );

    let engine = Engine::from_config(config)?;

    match args.command {
        Command::Backup => print_json(&engine.backup()?)?,
        Command::Archive => {
            let outcome = engine.archive()?;
            if let ConsolidationOutcome::NothingToDo = outcome {
                tracing::warn!("No raw generation found in the bucket");
            }
            print_json(&outcome)?
        }
        Command::Sweep => print_json(&engine.sweep()?)?,
        Command::DbBackup => print_json(&engine.backup_db()?)?,
        Command::Restore { target, generation } => {
            print_json(&engine.restore(generation.as_deref(), &target)?)?
        }
        Command::List => {
            for generation in engine.list_generations()? {
                println!(
                    "{}\t{:?}\t{} objects\t{}",
                    generation.name,
                    generation.state,
                    generation.object_count,
                    utils::format::format_bytes(generation.total_bytes)
                );
            }
        }
    }

    Ok(())
}
