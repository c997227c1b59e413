//! Retention garbage collection over the backup lineage
//!
//! Reclaims nodes older than the retention cutoff without ever breaking a
//! chain a survivor still needs: children are deleted before their parent
//! Full, always, and a Full whose child failed to delete is skipped for the
//! pass. Deletion is per-node best-effort; one failure never aborts the
//! sweep of unrelated nodes.

use crate::lineage::LineageStore;
use crate::store::ObjectStore;
use crate::types::{BackupNode, NodeKind};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rollup of one collection pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcSummary {
    pub examined: usize,
    pub deleted_nodes: usize,
    pub released_objects: usize,
    pub reclaimed_bytes: u64,
    pub skipped_fulls: usize,
    pub failed: usize,
}

/// Age-based collector for one destination's lineage and object stores.
/// The caller holds the destination's exclusive lock for the whole pass.
#[derive(Debug)]
pub struct RetentionGc<'a> {
    lineage: &'a LineageStore,
    store: &'a ObjectStore,
}

impl<'a> RetentionGc<'a> {
    pub fn new(lineage: &'a LineageStore, store: &'a ObjectStore) -> Self {
        Self { lineage, store }
    }

    /// Run one pass with the given cutoff (`now - max_age_days`).
    pub fn collect(&self, cutoff: DateTime<Utc>) -> Result<GcSummary> {
        let mut summary = GcSummary::default();
        let nodes = self.lineage.list_nodes()?;
        summary.examined = nodes.len();

        // Pass 1: expired Fulls, each preceded by all of its children. An
        // incremental is useless once its base Full is gone, regardless of
        // the incremental's own age.
        let expired_fulls: Vec<&BackupNode> = nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Full && n.created_at < cutoff)
            .collect();

        for full in expired_fulls {
            let children = self.lineage.incrementals_of(&full.id)?;
            let mut children_failed = 0usize;
            for child in &children {
                if !self.delete_releasing(child, &mut summary) {
                    children_failed += 1;
                }
            }

            if children_failed > 0 {
                // DependencyError: surviving children keep the Full alive
                // for this pass.
                warn!(
                    "skipping full {} this pass: {} dependent incremental(s) failed to delete",
                    full.id, children_failed
                );
                summary.skipped_fulls += 1;
                continue;
            }
            self.delete_releasing(full, &mut summary);
        }

        // Pass 2: orphaned incrementals whose parent no longer resolves,
        // residue of partial prior failures.
        let survivors = self.lineage.list_nodes()?;
        let full_ids: HashSet<Uuid> = survivors
            .iter()
            .filter(|n| n.kind == NodeKind::Full)
            .map(|n| n.id)
            .collect();
        for node in &survivors {
            if node.kind != NodeKind::Incremental {
                continue;
            }
            let orphaned = node
                .parent_id
                .map_or(true, |parent| !full_ids.contains(&parent));
            if orphaned {
                debug!("sweeping orphaned incremental {}", node.id);
                self.delete_releasing(node, &mut summary);
            }
        }

        // Pass 3: incrementals expired by their own age even though the
        // parent Full survives; nothing in the model depends on an
        // incremental as a parent, so this is always safe.
        for node in self.lineage.list_nodes()? {
            if node.kind == NodeKind::Incremental && node.created_at < cutoff {
                self.delete_releasing(&node, &mut summary);
            }
        }

        info!(
            "gc pass complete: {} node(s) deleted, {} object reference(s) released, {} bytes reclaimed, {} failure(s)",
            summary.deleted_nodes, summary.released_objects, summary.reclaimed_bytes, summary.failed
        );
        Ok(summary)
    }

    /// Delete the node record, then release every object it referenced.
    /// Returns false if the node could not be deleted.
    ///
    /// The record goes first: its FileEntries cease to exist exactly when
    /// it does, so a failed deletion leaves refcounts untouched and a later
    /// pass can retry cleanly.
    fn delete_releasing(&self, node: &BackupNode, summary: &mut GcSummary) -> bool {
        if let Err(e) = self.lineage.delete_node(&node.id) {
            warn!("failed to delete {} node {}: {}", node.kind, node.id, e);
            summary.failed += 1;
            return false;
        }

        for entry in &node.files {
            let last_reference = self.store.refcount(&entry.hash) == Some(1);
            match self.store.release(&entry.hash) {
                Ok(()) => {
                    summary.released_objects += 1;
                    if last_reference {
                        summary.reclaimed_bytes += entry.size;
                    }
                }
                Err(e) => {
                    warn!(
                        "failed to release object {} of node {}: {}",
                        entry.hash, node.id, e
                    );
                }
            }
        }

        summary.deleted_nodes += 1;
        true
    }
}
