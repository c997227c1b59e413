//! Persistent lineage store for the full/incremental dependency graph
//!
//! One JSON record per node under `nodes/`, published atomically so a crash
//! never leaves a partially visible node. Queries (`latest_full`,
//! `incrementals_of`) read the records back rather than inferring lineage
//! from directory names or filesystem timestamps.

use crate::fsutil::write_json_atomic;
use crate::types::{BackupNode, NodeKind};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const NODES_DIR: &str = "nodes";

/// Stores and queries backup nodes for one destination root.
#[derive(Debug)]
pub struct LineageStore {
    nodes_path: PathBuf,
}

impl LineageStore {
    /// Open (or initialize) the lineage store under the destination root.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let nodes_path = root.as_ref().join(NODES_DIR);
        fs::create_dir_all(&nodes_path)?;
        Ok(Self { nodes_path })
    }

    /// Create a new node. An Incremental must name an existing, completed
    /// Full parent; a Full must not name a parent at all.
    pub fn create_node(
        &self,
        kind: NodeKind,
        parent_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Result<BackupNode> {
        match (kind, parent_id) {
            (NodeKind::Full, Some(parent)) => {
                return Err(VaultError::Validation {
                    reason: format!("full node must not have a parent (got {parent})"),
                });
            }
            (NodeKind::Incremental, None) => {
                return Err(VaultError::Validation {
                    reason: "incremental node requires a parent full node".to_string(),
                });
            }
            (NodeKind::Incremental, Some(parent)) => {
                let parent_node = self.node(&parent).map_err(|_| VaultError::Validation {
                    reason: format!("parent node {parent} does not exist"),
                })?;
                if parent_node.kind != NodeKind::Full {
                    return Err(VaultError::Validation {
                        reason: format!("parent node {parent} is not a full backup"),
                    });
                }
                if !parent_node.is_complete() {
                    return Err(VaultError::Validation {
                        reason: format!("parent node {parent} never completed"),
                    });
                }
            }
            (NodeKind::Full, None) => {}
        }

        let node = BackupNode::new(kind, parent_id, created_at);
        self.save(&node)?;
        debug!("created {} node {}", node.kind, node.id);
        Ok(node)
    }

    /// Flip the completion flag, stamping the completion time used by
    /// change detection.
    pub fn mark_complete(&self, id: &Uuid, at: DateTime<Utc>) -> Result<BackupNode> {
        let mut node = self.node(id)?;
        node.completed_at = Some(at);
        self.save(&node)?;
        debug!("node {} marked complete at {}", id, at);
        Ok(node)
    }

    /// Persist in-run mutations (file entries, failure counts).
    pub fn update(&self, node: &BackupNode) -> Result<()> {
        if !self.node_path(&node.id).exists() {
            return Err(VaultError::NodeNotFound {
                id: node.id.to_string(),
            });
        }
        self.save(node)
    }

    /// Most recently created completed Full node.
    pub fn latest_full(&self) -> Result<Option<BackupNode>> {
        let mut fulls: Vec<BackupNode> = self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.kind == NodeKind::Full && n.is_complete())
            .collect();
        fulls.sort_by(Self::creation_order);
        Ok(fulls.pop())
    }

    /// Incrementals sharing the given Full parent, ascending by creation
    /// time (node id as deterministic tiebreak).
    pub fn incrementals_of(&self, full_id: &Uuid) -> Result<Vec<BackupNode>> {
        let mut children: Vec<BackupNode> = self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.kind == NodeKind::Incremental && n.parent_id == Some(*full_id))
            .collect();
        children.sort_by(Self::creation_order);
        Ok(children)
    }

    /// Delete a node record. A Full with surviving Incremental children is
    /// protected: children always go first.
    pub fn delete_node(&self, id: &Uuid) -> Result<()> {
        let node = self.node(id)?;
        if node.kind == NodeKind::Full {
            let children = self.incrementals_of(id)?;
            if !children.is_empty() {
                return Err(VaultError::Dependency {
                    reason: format!(
                        "full node {} still has {} incremental dependent(s)",
                        id,
                        children.len()
                    ),
                });
            }
        }
        fs::remove_file(self.node_path(id))?;
        debug!("deleted {} node {}", node.kind, id);
        Ok(())
    }

    /// Load a node by id.
    pub fn node(&self, id: &Uuid) -> Result<BackupNode> {
        let path = self.node_path(id);
        let content = fs::read_to_string(&path).map_err(|_| VaultError::NodeNotFound {
            id: id.to_string(),
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All nodes at this destination. Corrupted records are skipped with a
    /// warning rather than failing the scan.
    pub fn list_nodes(&self) -> Result<Vec<BackupNode>> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(&self.nodes_path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                match fs::read_to_string(&path)
                    .map_err(VaultError::from)
                    .and_then(|c| Ok(serde_json::from_str::<BackupNode>(&c)?))
                {
                    Ok(node) => nodes.push(node),
                    Err(e) => warn!("skipping unreadable node record {}: {}", path.display(), e),
                }
            }
        }
        Ok(nodes)
    }

    /// Path of the durable record backing a node, e.g. for transport push.
    pub fn record_path(&self, id: &Uuid) -> PathBuf {
        self.node_path(id)
    }

    fn creation_order(a: &BackupNode, b: &BackupNode) -> std::cmp::Ordering {
        a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
    }

    fn node_path(&self, id: &Uuid) -> PathBuf {
        self.nodes_path.join(format!("{id}.json"))
    }

    fn save(&self, node: &BackupNode) -> Result<()> {
        write_json_atomic(&self.node_path(&node.id), node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, LineageStore) {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_incremental_requires_completed_full_parent() {
        let (_dir, store) = store();
        let t0 = Utc::now();

        // No parent at all.
        assert!(matches!(
            store.create_node(NodeKind::Incremental, None, t0),
            Err(VaultError::Validation { .. })
        ));

        // Parent exists but never completed.
        let full = store.create_node(NodeKind::Full, None, t0).unwrap();
        assert!(matches!(
            store.create_node(NodeKind::Incremental, Some(full.id), t0),
            Err(VaultError::Validation { .. })
        ));

        // Completed Full parent is accepted.
        store.mark_complete(&full.id, t0 + Duration::minutes(1)).unwrap();
        let inc = store
            .create_node(NodeKind::Incremental, Some(full.id), t0 + Duration::minutes(2))
            .unwrap();
        assert_eq!(inc.parent_id, Some(full.id));

        // An incremental can never be a parent.
        store
            .mark_complete(&inc.id, t0 + Duration::minutes(3))
            .unwrap();
        assert!(matches!(
            store.create_node(NodeKind::Incremental, Some(inc.id), t0 + Duration::minutes(4)),
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn test_full_node_rejects_parent() {
        let (_dir, store) = store();
        let t0 = Utc::now();
        let full = store.create_node(NodeKind::Full, None, t0).unwrap();
        assert!(matches!(
            store.create_node(NodeKind::Full, Some(full.id), t0),
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn test_latest_full_ignores_incomplete() {
        let (_dir, store) = store();
        let t0 = Utc::now();

        let old = store.create_node(NodeKind::Full, None, t0).unwrap();
        store.mark_complete(&old.id, t0 + Duration::minutes(1)).unwrap();

        // Newer but never completed; must not be selected.
        store
            .create_node(NodeKind::Full, None, t0 + Duration::hours(1))
            .unwrap();

        let latest = store.latest_full().unwrap().unwrap();
        assert_eq!(latest.id, old.id);
    }

    #[test]
    fn test_incrementals_of_orders_by_creation() {
        let (_dir, store) = store();
        let t0 = Utc::now();

        let full = store.create_node(NodeKind::Full, None, t0).unwrap();
        store.mark_complete(&full.id, t0).unwrap();

        let i2 = store
            .create_node(NodeKind::Incremental, Some(full.id), t0 + Duration::minutes(20))
            .unwrap();
        let i1 = store
            .create_node(NodeKind::Incremental, Some(full.id), t0 + Duration::minutes(10))
            .unwrap();

        let children = store.incrementals_of(&full.id).unwrap();
        let ids: Vec<Uuid> = children.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![i1.id, i2.id]);
    }

    #[test]
    fn test_delete_full_with_children_is_blocked() {
        let (_dir, store) = store();
        let t0 = Utc::now();

        let full = store.create_node(NodeKind::Full, None, t0).unwrap();
        store.mark_complete(&full.id, t0).unwrap();
        let inc = store
            .create_node(NodeKind::Incremental, Some(full.id), t0 + Duration::minutes(1))
            .unwrap();

        assert!(matches!(
            store.delete_node(&full.id),
            Err(VaultError::Dependency { .. })
        ));

        store.delete_node(&inc.id).unwrap();
        store.delete_node(&full.id).unwrap();
        assert!(store.list_nodes().unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();
        let id = {
            let store = LineageStore::open(dir.path()).unwrap();
            let full = store.create_node(NodeKind::Full, None, t0).unwrap();
            store.mark_complete(&full.id, t0).unwrap();
            full.id
        };

        let reopened = LineageStore::open(dir.path()).unwrap();
        let latest = reopened.latest_full().unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert!(latest.is_complete());
    }
}
