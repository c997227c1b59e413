//! Core data model: backup nodes, file entries and content hashes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A content hash identifying a stored object, hex-encoded BLAKE3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl ObjectHash {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compute the hash of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(hash.to_hex().to_string())
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a backup node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "incremental")]
    Incremental,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Full => write!(f, "full"),
            NodeKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// One file captured by a backup node. References its content object by
/// hash; the payload itself is shared and never copied per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub relative_path: PathBuf,
    pub hash: ObjectHash,
    pub size: u64,
}

/// A node in the backup lineage graph.
///
/// An Incremental's `parent_id` always names a completed Full node; sibling
/// incrementals share one Full parent and incrementals are never chained.
/// `completed_at` doubles as the completion flag and as the reference
/// timestamp for change detection. `created_at` is assigned exactly once at
/// creation time from the injected clock, never from filesystem metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupNode {
    pub id: Uuid,
    pub kind: NodeKind,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
    pub completed_at: Option<DateTime<Utc>>,
    pub files: Vec<FileEntry>,
    pub files_failed: u32,
}

impl BackupNode {
    pub fn new(kind: NodeKind, parent_id: Option<Uuid>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            created_at,
            parent_id,
            completed_at: None,
            files: Vec::new(),
            files_failed: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Total payload bytes referenced by this node.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Age-based retention policy for the garbage collector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl RetentionPolicy {
    /// Cutoff timestamp below which nodes become collection candidates.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.max_age_days))
    }
}

/// A regular file discovered under the source root.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Outcome of a backup run, independent of transport/notification results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    SuccessWithWarnings,
    Failed,
}

impl RunOutcome {
    /// Process exit status: 0 success, 2 success-with-warnings, 1 failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::SuccessWithWarnings => 2,
            RunOutcome::Failed => 1,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::SuccessWithWarnings => write!(f, "success-with-warnings"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}
