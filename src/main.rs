// src/main.rs

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use keepsake::{MemoryConfig, MemoryService, UnitId};

#[derive(Parser)]
#[command(name = "keepsake", about = "Maintenance tools for the NPC memory store")]
struct Cli {
    /// Data directory holding memory documents and index files.
    #[arg(long, env = "KEEPSAKE_DATA_ROOT")]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild vector indexes from the stored documents.
    Rebuild {
        /// Single unit as `<profile>/<npc>` or `<profile>/world`;
        /// all units when omitted.
        #[arg(long)]
        unit: Option<String>,
        /// Restrict an all-units rebuild to one profile.
        #[arg(long)]
        profile: Option<String>,
        /// Ingest legacy save history from this directory first.
        #[arg(long, value_name = "SAVES_ROOT")]
        bootstrap: Option<PathBuf>,
    },
    /// Ingest legacy save history without rebuilding anything else.
    Bootstrap {
        saves_root: PathBuf,
    },
    /// Verify that every indexed reference resolves to a stored record.
    Check,
}

fn parse_unit(raw: &str) -> anyhow::Result<UnitId> {
    let Some((profile, key)) = raw.split_once('/') else {
        bail!("unit must be <profile>/<npc> or <profile>/world, got {raw:?}");
    };
    Ok(if key == "world" {
        UnitId::world(profile)
    } else {
        UnitId::npc(profile, key)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = match &cli.data_root {
        Some(root) => MemoryConfig {
            data_root: root.clone(),
            ..MemoryConfig::from_env()
        },
        None => MemoryConfig::from_env(),
    };
    let service = MemoryService::new(config).context("opening memory store")?;

    match cli.command {
        Command::Rebuild {
            unit,
            profile,
            bootstrap,
        } => {
            if let Some(saves_root) = bootstrap {
                let stats = service.bootstrap(&saves_root).await?;
                info!(
                    slots = stats.slots,
                    units = stats.units_touched,
                    skipped = stats.units_skipped,
                    "bootstrap complete"
                );
            }
            let added = match unit {
                Some(raw) => service.rebuild_index(&parse_unit(&raw)?).await?,
                None => service.rebuild_all(profile.as_deref()).await?,
            };
            info!(records = added, "index rebuild complete");
        }
        Command::Bootstrap { saves_root } => {
            let stats = service.bootstrap(&saves_root).await?;
            println!(
                "slots={} units={} skipped={} short={} long={} world={} indexes={}",
                stats.slots,
                stats.units_touched,
                stats.units_skipped,
                stats.short_added,
                stats.long_added,
                stats.world_added,
                stats.indexes_rebuilt,
            );
        }
        Command::Check => {
            let report = service.check_consistency().await?;
            println!(
                "units={} mapped={} dangling={} corrupt={} stale={}",
                report.units,
                report.mapped_records,
                report.dangling_refs.len(),
                report.corrupt_units.len(),
                report.stale_indexes.len(),
            );
            for entry in &report.dangling_refs {
                println!("dangling: {entry}");
            }
            for entry in &report.corrupt_units {
                println!("corrupt: {entry}");
            }
            for entry in &report.stale_indexes {
                println!("stale index: {entry}");
            }
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
