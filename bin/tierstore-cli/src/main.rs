//! tierstore CLI - local administration of a tierstore data directory
//!
//! Opens the storage described by a configuration file, runs one command
//! and exits, or keeps the background reclaimer running with `serve`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tierstore_client::Connector;
use tierstore_common::Config;
use tierstore_storage::{Storage, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tierstore-cli")]
#[command(about = "tierstore Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tierstore/tierstore.toml")]
    config: String,

    /// Log level (overrides the configured one)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Disk operations
    Disk {
        #[command(subcommand)]
        action: DiskCommands,
    },
    /// Cache operations
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    /// Table operations
    Table {
        #[command(subcommand)]
        action: TableCommands,
    },
    /// Snapshot a table's parts
    Freeze {
        table: String,
        /// Snapshot name (defaults to the next increment)
        #[arg(short, long)]
        name: Option<String>,
        /// Only this partition
        #[arg(short, long)]
        partition: Option<String>,
    },
    /// Release a table's snapshot
    Unfreeze {
        table: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        partition: Option<String>,
    },
    /// Release a snapshot for every table, dropped ones included
    SystemUnfreeze { name: String },
    /// Remove store directories without table metadata
    Sweep,
    /// Run one reclaim cycle
    Reclaim,
    /// Keep the storage open with background reclaim until Ctrl-C
    Serve,
}

#[derive(Subcommand, Debug)]
enum DiskCommands {
    /// List disks with their usage
    List,
    /// Replace a disk instance with a fresh one
    Restart { name: String },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Show cache settings and occupancy
    Describe { name: String },
    /// Empty one cache, or all of them
    Drop { name: Option<String> },
}

#[derive(Subcommand, Debug)]
enum TableCommands {
    /// List tables
    List,
    /// Show table metadata and active parts
    Show { name: String },
    /// Verify part checksums
    Check { name: String },
    /// Merge the parts of each partition
    Optimize {
        name: String,
        #[arg(short, long)]
        partition: Option<String>,
        /// Also rewrite single parts that lack current columns
        #[arg(long)]
        r#final: bool,
    },
    /// Drop a table
    Drop {
        name: String,
        /// Remove files before returning
        #[arg(long)]
        sync: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let storage = Storage::open(&config, Connector::new()).await?;
    let result = run(&storage, args.command).await;
    storage.shutdown().await;
    result
}

async fn run(storage: &Storage, command: Commands) -> Result<()> {
    match command {
        Commands::Disk { action } => match action {
            DiskCommands::List => {
                println!("{:<16} {:<14} {:>20} {:>20} {:>12}", "NAME", "KIND", "CAPACITY", "AVAILABLE", "RESERVED");
                for disk in storage.disks()? {
                    println!(
                        "{:<16} {:<14} {:>20} {:>20} {:>12}",
                        disk.name,
                        disk.kind.to_string(),
                        disk.usage.capacity,
                        disk.usage.available,
                        disk.usage.reserved
                    );
                }
            }
            DiskCommands::Restart { name } => {
                storage.restart_disk(&name)?;
                println!("Disk '{name}' restarted (generation {})", storage.registry().generation(&name)?);
            }
        },
        Commands::Cache { action } => match action {
            CacheCommands::Describe { name } => {
                let cache = storage.describe_cache(&name)?;
                println!("Cache: {}", cache.name);
                println!("  Path:          {}", cache.path.display());
                println!("  Max size:      {}", cache.max_size);
                println!("  Current size:  {}", cache.current_size);
                println!("  Pinned size:   {}", cache.pinned_size);
                println!("  Segments:      {}", cache.entries);
                println!("  Segment size:  {}", cache.segment_size);
                println!("  Pin idx/mrk:   {}", cache.pin_index_and_mark_files);
            }
            CacheCommands::Drop { name } => {
                storage.drop_cache(name.as_deref())?;
                println!("Cache dropped");
            }
        },
        Commands::Table { action } => match action {
            TableCommands::List => {
                for name in storage.tables() {
                    println!("{name}");
                }
            }
            TableCommands::Show { name } => {
                let table = storage.table(&name)?;
                println!("{}", serde_json::to_string_pretty(&*table.metadata())?);
                println!();
                println!("{:<32} {:<8} {:<8} {:>12} {:>14}", "PART", "DISK", "FORMAT", "ROWS", "BYTES");
                for part in table.parts() {
                    println!(
                        "{:<32} {:<8} {:<8} {:>12} {:>14}",
                        part.name,
                        part.disk,
                        part.format.to_string(),
                        part.rows,
                        part.bytes_on_disk()
                    );
                }
                let detached = table.detached_parts().await?;
                if !detached.is_empty() {
                    println!();
                    println!("Detached: {}", detached.join(", "));
                }
            }
            TableCommands::Check { name } => {
                let healthy = storage.table(&name)?.check().await?;
                println!("{name}: {}", if healthy { "OK" } else { "CORRUPTED" });
                if !healthy {
                    anyhow::bail!("check of {name} failed");
                }
            }
            TableCommands::Optimize { name, partition, r#final } => {
                let partition = partition.map(Value::from);
                let merged = storage
                    .table(&name)?
                    .optimize(partition.as_ref(), r#final)
                    .await?;
                println!("Merged {} partitions: {}", merged.len(), merged.join(", "));
            }
            TableCommands::Drop { name, sync } => {
                storage.drop_table(&name, sync).await?;
                println!("Table {name} dropped");
            }
        },
        Commands::Freeze { table, name, partition } => {
            let partition = partition.map(Value::from);
            let result = storage
                .freeze(&table, partition.as_ref(), name.as_deref())
                .await?;
            println!("Snapshot '{}': {} parts", result.name, result.parts.len());
            for part in result.parts {
                println!("  {}:{}", part.disk, part.path);
            }
        }
        Commands::Unfreeze { table, name, partition } => {
            let partition = partition.map(Value::from);
            let scheduled = storage.unfreeze(&table, &name, partition.as_ref()).await?;
            let stats = storage.reclaim_now().await;
            println!("Unfroze {scheduled} parts, removed {} directories", stats.directories);
        }
        Commands::SystemUnfreeze { name } => {
            storage.system_unfreeze(&name).await?;
            let stats = storage.reclaim_now().await;
            println!("Snapshot '{name}' removed from {} disks", stats.directories);
        }
        Commands::Sweep => {
            let removed = storage.sweep_store_orphans().await?;
            println!("Removed {removed} directories from store");
        }
        Commands::Reclaim => {
            let stats = storage.reclaim_now().await;
            println!(
                "Removed {} parts and {} directories ({} failures)",
                stats.parts, stats.directories, stats.failed
            );
        }
        Commands::Serve => {
            storage.start_background();
            info!("Serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }
    Ok(())
}
