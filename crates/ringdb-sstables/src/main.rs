#![warn(missing_docs)]

//! `ringdb-sstdir`: inspects an SSTable directory the way every shard of a
//! node would see it, and optionally removes leftovers of interrupted writes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use ringdb_sstables::component::EntryDescriptor;
use ringdb_sstables::directory::remove_files;
use ringdb_sstables::{
    Generation, MissingTocPolicy, ScanOutcome, Scanner, ShardId, SstableVersion, SstablesConfig,
};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ringdb-sstdir")]
#[command(about = "RingDB SSTable directory tool", long_about = None)]
struct Cli {
    /// JSON or TOML configuration; command-line flags win over it.
    #[arg(short, long, env = "RINGDB_SSTABLES_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scans a table directory on behalf of every shard.
    Scan {
        /// Table directory; defaults to the configured data_dir.
        dir: Option<PathBuf>,
        /// Number of shards sharing the directory.
        #[arg(short, long)]
        shards: Option<u32>,
        /// Only report what this shard would see.
        #[arg(long)]
        shard: Option<u32>,
        /// Fail on generations without a TOC instead of scheduling them for removal.
        #[arg(long)]
        strict: bool,
        /// Delete the scheduled files once every shard scanned cleanly.
        #[arg(long)]
        commit: bool,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Parses a component file name.
    Parse {
        /// File name, e.g. `me-3-big-Data.db`.
        name: String,
    },
}

#[derive(Debug, Serialize)]
struct ShardReport {
    shard: u32,
    generations: Vec<Generation>,
    files_for_removal: Vec<PathBuf>,
    highest_generation_seen: Generation,
    highest_version_seen: SstableVersion,
}

impl ShardReport {
    fn new(shard: ShardId, outcome: &ScanOutcome) -> Self {
        Self {
            shard: shard.as_u32(),
            generations: outcome.descriptors.iter().map(|d| d.generation).collect(),
            files_for_removal: outcome.files_for_removal.iter().cloned().collect(),
            highest_generation_seen: outcome.max_generation_seen,
            highest_version_seen: outcome.max_version_seen,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SstablesConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SstablesConfig::default(),
    };

    match cli.command {
        Command::Scan {
            dir,
            shards,
            shard,
            strict,
            commit,
            json,
        } => {
            let dir = dir.unwrap_or_else(|| config.data_dir.clone());
            let shard_count = shards.unwrap_or(config.shard_count).max(1);
            let policy = if strict {
                MissingTocPolicy::Fatal
            } else {
                config.directory.missing_toc
            };
            if let Some(shard) = shard {
                anyhow::ensure!(
                    shard < shard_count,
                    "shard {} out of range for {} shards",
                    shard,
                    shard_count
                );
            }
            scan(&dir, shard_count, shard, policy, commit, json).await
        }
        Command::Parse { name } => {
            let desc = EntryDescriptor::parse(Path::new("."), &name)?;
            println!(
                "generation {} version {} format {} component {:?}",
                desc.generation, desc.version, desc.format, desc.component
            );
            Ok(())
        }
    }
}

async fn scan(
    dir: &Path,
    shard_count: u32,
    only: Option<u32>,
    policy: MissingTocPolicy,
    commit: bool,
    json: bool,
) -> Result<()> {
    tracing::info!(dir = %dir.display(), shard_count, "scanning sstable directory");
    let shards: Vec<ShardId> = match only {
        Some(id) => vec![ShardId::new(id)],
        None => (0..shard_count).map(ShardId::new).collect(),
    };
    let scanners: Vec<Scanner> = shards
        .iter()
        .map(|shard| Scanner::new(dir, *shard, shard_count, policy))
        .collect();
    let outcomes = try_join_all(scanners.iter().map(|s| s.scan()))
        .await
        .with_context(|| format!("scanning {}", dir.display()))?;

    let reports: Vec<ShardReport> = shards
        .iter()
        .zip(&outcomes)
        .map(|(shard, outcome)| ShardReport::new(*shard, outcome))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!(
                "shard {}: {} sstables, {} files to remove, highest generation {} ({})",
                report.shard,
                report.generations.len(),
                report.files_for_removal.len(),
                report.highest_generation_seen,
                report.highest_version_seen
            );
            for path in &report.files_for_removal {
                println!("  remove {}", path.display());
            }
        }
    }

    if commit {
        let removals: BTreeSet<PathBuf> = outcomes
            .into_iter()
            .flat_map(|o| o.files_for_removal)
            .collect();
        remove_files(&removals)
            .await
            .with_context(|| format!("removing leftovers in {}", dir.display()))?;
        tracing::info!(files = removals.len(), "leftovers removed");
    }
    Ok(())
}
