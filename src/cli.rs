//! Command-line interface for snapvault

use crate::config::VaultConfig;
use crate::engine::{BackupEngine, CancelFlag};
use crate::gc::RetentionGc;
use crate::lineage::LineageStore;
use crate::lock::StoreLock;
use crate::planner::RestorePlanner;
use crate::restore::RestoreExecutor;
use crate::store::ObjectStore;
use crate::types::{BackupNode, RetentionPolicy};
use crate::{Result, VaultError};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::error;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "Periodic backups with full/incremental lineage and whole-file deduplication")]
#[command(version, author)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Explicit config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup (incremental when a completed full exists)
    Backup {
        /// Source directory to back up
        #[arg(long)]
        source: Option<PathBuf>,
        /// Destination store root
        #[arg(long)]
        store: Option<PathBuf>,
        /// Force a full backup
        #[arg(long)]
        full: bool,
    },
    /// Restore a node (and its chain) into a target directory
    Restore {
        /// Node ID (prefix accepted)
        node_id: String,
        /// Destination store root
        #[arg(long)]
        store: Option<PathBuf>,
        /// Target directory for restore
        #[arg(long, default_value = "./restore_out")]
        target: PathBuf,
    },
    /// Show the restore chain for a node without applying it
    Plan {
        /// Node ID (prefix accepted)
        node_id: String,
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// List backup nodes at a destination
    List {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Reclaim nodes older than the retention cutoff
    Gc {
        #[arg(long)]
        store: Option<PathBuf>,
        /// Override the configured retention age
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// Sweep staging residue and reconcile object refcounts
    Doctor {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

/// Run the CLI and return the process exit code: 0 success, 2
/// success-with-warnings, 1 failure.
pub async fn run() -> i32 {
    let cli = Cli::parse();

    if let Err(e) = crate::logging::init_logging(cli.verbose) {
        eprintln!("failed to initialize logging: {e}");
        return 1;
    }

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    match dispatch(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn load_config(explicit: &Option<PathBuf>) -> Result<VaultConfig> {
    let config = match explicit {
        Some(path) => VaultConfig::load_from(path)?,
        None => VaultConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

async fn dispatch(command: Commands, config: VaultConfig) -> Result<i32> {
    match command {
        Commands::Backup {
            source,
            store,
            full,
        } => {
            let source = source.unwrap_or_else(|| config.source.clone());
            let store = store.unwrap_or_else(|| config.store.clone());

            let engine = BackupEngine::new(&store)
                .with_exclude_patterns(config.exclude.clone())
                .with_transport(
                    std::sync::Arc::new(crate::io::NullTransport),
                    config.transport.remote.clone(),
                );
            let report = engine.backup(&source, full, &CancelFlag::new()).await?;

            println!("Backup {}", report.outcome);
            println!("=================");
            println!("Node:        {} ({})", report.node_id, report.kind);
            println!("Files:       {} stored, {} failed", report.files_stored, report.files_failed);
            println!("New bytes:   {}", report.bytes_stored);
            println!("Deduplicated: {} bytes", report.bytes_deduped);

            Ok(report.outcome.exit_code())
        }
        Commands::Restore {
            node_id,
            store,
            target,
        } => {
            let store = store.unwrap_or_else(|| config.store.clone());
            let id = resolve_node_id(&store, &node_id)?;

            let stats = RestoreExecutor::new(&store).restore(&id, &target).await?;

            println!("Restore completed!");
            println!("==================");
            println!("Nodes applied:  {}", stats.nodes_applied);
            println!("Files restored: {}", stats.files_restored);
            println!("Bytes:          {}", stats.bytes_restored);
            println!("Target:         {}", target.display());
            Ok(0)
        }
        Commands::Plan { node_id, store } => {
            let store = store.unwrap_or_else(|| config.store.clone());
            let id = resolve_node_id(&store, &node_id)?;

            let lineage = LineageStore::open(&store)?;
            let plan = RestorePlanner::new(&lineage).plan(&id)?;

            println!("Restore chain for {id} (earliest first):");
            for (i, node) in plan.iter().enumerate() {
                println!(
                    "  {}. {} {} created {} ({} file(s))",
                    i + 1,
                    node.kind,
                    node.id,
                    node.created_at.format("%Y-%m-%d %H:%M:%S"),
                    node.files.len()
                );
            }
            Ok(0)
        }
        Commands::List { store } => {
            let store = store.unwrap_or_else(|| config.store.clone());
            let lineage = LineageStore::open(&store)?;
            let object_store = ObjectStore::open(&store)?;
            let mut nodes = lineage.list_nodes()?;
            nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            if nodes.is_empty() {
                println!("No backup nodes found in {}", store.display());
                return Ok(0);
            }

            println!(
                "{:<36} {:<12} {:<20} {:<8} {:<12} {:<10}",
                "ID", "Kind", "Created", "Files", "Size", "Status"
            );
            println!("{}", "-".repeat(102));
            for node in nodes {
                println!(
                    "{:<36} {:<12} {:<20} {:<8} {:<12} {:<10}",
                    node.id,
                    node.kind.to_string(),
                    node.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    node.files.len(),
                    node.total_size(),
                    if node.is_complete() {
                        "complete"
                    } else if node.files_failed > 0 {
                        "failed"
                    } else {
                        "open"
                    }
                );
            }
            println!(
                "\n{} unique object(s), {} bytes stored",
                object_store.object_count(),
                object_store.total_bytes()
            );
            Ok(0)
        }
        Commands::Gc {
            store,
            max_age_days,
        } => {
            let store_root = store.unwrap_or_else(|| config.store.clone());
            let policy = RetentionPolicy {
                max_age_days: max_age_days.unwrap_or(config.retention.max_age_days),
            };

            // GC mutates lineage state: same exclusivity as a backup run.
            let _lock = StoreLock::exclusive(&store_root)?;
            let lineage = LineageStore::open(&store_root)?;
            let object_store = ObjectStore::open(&store_root)?;

            let cutoff = policy.cutoff(Utc::now());
            let summary = RetentionGc::new(&lineage, &object_store).collect(cutoff)?;

            println!("GC pass complete");
            println!("================");
            println!("Examined:   {} node(s)", summary.examined);
            println!("Deleted:    {} node(s)", summary.deleted_nodes);
            println!("Released:   {} object reference(s)", summary.released_objects);
            println!("Reclaimed:  {} bytes", summary.reclaimed_bytes);
            if summary.skipped_fulls > 0 {
                println!("Skipped:    {} full node(s) with surviving dependents", summary.skipped_fulls);
            }
            if summary.failed > 0 {
                println!("Failed:     {} deletion(s), see log", summary.failed);
                return Ok(2);
            }
            Ok(0)
        }
        Commands::Doctor { store } => {
            let store_root = store.unwrap_or_else(|| config.store.clone());

            let _lock = StoreLock::exclusive(&store_root)?;
            let lineage = LineageStore::open(&store_root)?;
            let object_store = ObjectStore::open(&store_root)?;

            let partials = object_store.sweep_partials()?;

            let mut live: HashMap<String, u64> = HashMap::new();
            for node in lineage.list_nodes()? {
                for entry in &node.files {
                    *live.entry(entry.hash.as_str().to_string()).or_insert(0) += 1;
                }
            }
            let repair = object_store.rebuild_refcounts(&live)?;

            println!("Doctor pass complete");
            println!("====================");
            println!("Partial writes swept:  {partials}");
            println!("Refcounts corrected:   {}", repair.refcounts_fixed);
            println!("Orphan objects removed: {}", repair.orphans_removed);
            println!("Records re-adopted:    {}", repair.recovered);
            if repair.missing > 0 {
                println!("Missing objects:       {} (see log)", repair.missing);
                return Ok(2);
            }
            Ok(0)
        }
    }
}

/// Resolve a node id that may be a unique prefix.
fn resolve_node_id(store: &PathBuf, prefix: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(prefix) {
        return Ok(id);
    }

    let lineage = LineageStore::open(store)?;
    let matches: Vec<BackupNode> = lineage
        .list_nodes()?
        .into_iter()
        .filter(|n| n.id.to_string().starts_with(prefix))
        .collect();

    match matches.len() {
        1 => Ok(matches[0].id),
        0 => Err(VaultError::NodeNotFound {
            id: prefix.to_string(),
        }),
        _ => Err(VaultError::Validation {
            reason: format!("node id prefix {prefix} is ambiguous ({} matches)", matches.len()),
        }),
    }
}
