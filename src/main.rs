//! chronicle-head CLI
//!
//! Offline tooling for head stores:
//! - Inspect WAL groups of a store
//! - Verify WAL directories by replaying them
//! - Query chunk refs straight from WALs
//! - Generate a default config

use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use chronicle_head::config::{generate_default_config, Config};
use chronicle_head::storage::{legacy_wals, list_segments, wal_groups, WalIdentifier};
use chronicle_head::{
    recover_head, ChunkIndex, ChunkQuery, Matcher, QueryContext, RecoveryMode, StoreLayout,
    TenantHeads,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "chronicle-head")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect, verify and query head index WALs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List WAL groups and legacy WALs of a store
    Inspect {
        /// Root data directory (default: from config)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Store name (default: from config)
        #[arg(long)]
        store: Option<String>,
    },

    /// Replay WAL directories and report damage
    Verify {
        /// WAL directories, oldest first
        #[arg(required = true)]
        wals: Vec<PathBuf>,
        /// List every repaired segment tail and exit with 2 if any
        #[arg(long)]
        strict: bool,
    },

    /// Replay WAL directories and print matching chunk refs
    Query {
        /// WAL directories, oldest first
        #[arg(required = true)]
        wals: Vec<PathBuf>,
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,
        /// Label matcher, e.g. 'app="api"' or 'env=~"prod|staging"'
        #[arg(short, long = "matcher")]
        matchers: Vec<String>,
        /// Range start (Unix ms, inclusive)
        #[arg(long, default_value_t = i64::MIN, allow_hyphen_values = true)]
        from: i64,
        /// Range end (Unix ms, inclusive)
        #[arg(long, default_value_t = i64::MAX, allow_hyphen_values = true)]
        through: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config);

    match cli.command {
        Commands::Inspect { dir, store } => {
            let dir = dir.unwrap_or_else(|| PathBuf::from(&config.head.data_dir));
            let store = store.unwrap_or_else(|| config.head.store_name.clone());
            inspect(&config, &StoreLayout::new(store, dir))?;
        }

        Commands::Verify { wals, strict } => {
            let mode = if strict {
                RecoveryMode::Strict
            } else {
                RecoveryMode::Lenient
            };
            let heads = TenantHeads::new(Utc::now(), config.head.stripe_size.max(1));
            let report = recover_head(&identify(&wals)?, &heads, mode)
                .context("WAL replay failed")?;

            print!("{}", report);
            println!("Head:        {}", heads.stats());

            if strict && !report.is_clean() {
                std::process::exit(2);
            }
        }

        Commands::Query {
            wals,
            tenant,
            matchers,
            from,
            through,
            json,
        } => {
            let matchers = matchers
                .iter()
                .map(|m| m.parse::<Matcher>())
                .collect::<Result<Vec<_>, _>>()?;

            let heads = TenantHeads::new(Utc::now(), config.head.stripe_size.max(1));
            recover_head(&identify(&wals)?, &heads, RecoveryMode::Lenient)
                .context("WAL replay failed")?;

            let query = ChunkQuery::new(&tenant, from, through).matchers(&matchers);
            let mut refs = Vec::new();
            heads.get_chunk_refs(&QueryContext::new(), &query, &mut refs)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&refs)?);
            } else {
                println!(
                    "{:<18} {:>15} {:>15} {:>10}",
                    "FINGERPRINT", "START", "END", "CHECKSUM"
                );
                for r in &refs {
                    println!(
                        "{:<18} {:>15} {:>15} {:>10}",
                        format!("{:016x}", r.fingerprint),
                        r.start,
                        r.end,
                        r.checksum
                    );
                }
                println!();
                println!("{} chunk refs for tenant {}", refs.len(), tenant);
            }
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {:?}", path))?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn inspect(config: &Config, layout: &StoreLayout) -> anyhow::Result<()> {
    let period = config.manager_options()?.period;
    let groups = wal_groups(&layout.wal_dir(), period)?;

    println!("Store {} in {:?}", layout.name(), layout.root());
    println!("Rotation period: {}s", period.duration().as_secs());
    println!();

    if groups.is_empty() {
        println!("No unbuilt WAL groups");
    }
    for group in &groups {
        println!(
            "Period {} (from {})",
            group.period,
            period.time_for_period(group.period).to_rfc3339()
        );
        print_wals(&group.wals)?;
    }

    let legacy = legacy_wals(layout)?;
    if !legacy.is_empty() {
        println!();
        println!("Legacy WALs in {:?}", layout.legacy_wal_dir());
        print_wals(&legacy)?;
    }
    Ok(())
}

fn print_wals(wals: &[WalIdentifier]) -> anyhow::Result<()> {
    for wal in wals {
        let segments = list_segments(&wal.path)?;
        let bytes: u64 = segments
            .iter()
            .filter_map(|(_, p)| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        println!(
            "  {:?}  {}  {} segments, {} bytes",
            wal.path,
            wal.ts.to_rfc3339(),
            segments.len(),
            bytes
        );
    }
    Ok(())
}

/// WAL directories given on the command line, timestamped by name when possible
fn identify(paths: &[PathBuf]) -> anyhow::Result<Vec<WalIdentifier>> {
    paths
        .iter()
        .map(|path| {
            if !path.is_dir() {
                bail!("{:?} is not a WAL directory", path);
            }
            Ok(WalIdentifier {
                ts: dir_timestamp(path).unwrap_or_else(Utc::now),
                path: path.clone(),
            })
        })
        .collect()
}

fn dir_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let secs = path.file_name()?.to_str()?.parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}
