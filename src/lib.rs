//! # snapvault
//!
//! Periodic backup suite with full/incremental lineage, whole-file
//! content-addressed deduplication and retention garbage collection.
//!
//! ## Features
//!
//! - **Lineage Store**: explicit full/incremental dependency graph with
//!   parent validation and structured recency queries
//! - **Deduplication**: whole-file content-addressed storage with
//!   reference counting and atomic object publication
//! - **Change Detection**: tree walks diffed against a node's completion
//!   timestamp, never against filesystem metadata of the store
//! - **Restore System**: chain reconstruction with preflighted object
//!   availability and strict chain-order conflict resolution
//! - **Retention GC**: age-based reclamation that deletes children before
//!   parents and never strands a survivor's chain
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapvault::engine::{BackupEngine, CancelFlag};
//! use std::path::Path;
//!
//! # #[tokio::main]
//! # async fn main() -> snapvault::Result<()> {
//! let engine = BackupEngine::new(Path::new("./backups"));
//! let report = engine.backup(Path::new("./my-data"), false, &CancelFlag::new()).await?;
//! println!("Backup node: {}", report.node_id);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
mod fsutil;
pub mod gc;
pub mod io;
pub mod lineage;
pub mod lock;
pub mod logging;
pub mod planner;
pub mod restore;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use engine::{BackupEngine, CancelFlag, RunReport};
pub use error::{Result, VaultError};
pub use gc::{GcSummary, RetentionGc};
pub use lineage::LineageStore;
pub use planner::RestorePlanner;
pub use restore::RestoreExecutor;
pub use store::ObjectStore;
pub use types::{BackupNode, FileEntry, NodeKind, ObjectHash, RetentionPolicy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
