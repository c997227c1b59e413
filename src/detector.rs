//! Change-set detection against a reference node's completion time

use crate::types::{BackupNode, SourceFile};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Walks the source tree and selects files for a backup run. Runs are
/// periodic batch jobs, so the full O(files) walk is acceptable.
#[derive(Debug, Default)]
pub struct ChangeSetDetector {
    exclude_patterns: Vec<String>,
}

impl ChangeSetDetector {
    pub fn new(exclude_patterns: Vec<String>) -> Self {
        Self { exclude_patterns }
    }

    /// All regular files under the source root (full backup input).
    pub fn scan_all(&self, source_root: &Path) -> Result<Vec<SourceFile>> {
        self.walk(source_root, None)
    }

    /// Regular files whose modification time is strictly newer than the
    /// reference node's completion timestamp. A reference that never
    /// completed (prior run crashed mid-backup) is unreliable diff state
    /// and is rejected, forcing the caller back to a full backup.
    pub fn changed_since(
        &self,
        source_root: &Path,
        reference: &BackupNode,
    ) -> Result<Vec<SourceFile>> {
        let completed_at = reference.completed_at.ok_or(VaultError::StaleReference {
            node: reference.id.to_string(),
        })?;
        self.walk(source_root, Some(completed_at))
    }

    fn walk(&self, source_root: &Path, newer_than: Option<DateTime<Utc>>) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(source_root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable path: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let relative_path = match entry.path().strip_prefix(source_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if self.is_excluded(&relative_path.to_string_lossy()) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(mtime) => mtime.into(),
                Err(e) => {
                    warn!("skipping {}: no modification time ({})", entry.path().display(), e);
                    continue;
                }
            };

            if let Some(cutoff) = newer_than {
                if modified <= cutoff {
                    continue;
                }
            }

            files.push(SourceFile {
                path: entry.path().to_path_buf(),
                relative_path,
                size: metadata.len(),
                modified,
            });
        }

        debug!(
            "detected {} file(s) under {}{}",
            files.len(),
            source_root.display(),
            if newer_than.is_some() { " (changed)" } else { "" }
        );
        Ok(files)
    }

    /// Simple pattern matching (supports * and **), same dialect as the
    /// exclude patterns in the config file.
    fn is_excluded(&self, relative: &str) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(relative, pattern))
    }
}

pub(crate) fn matches_pattern(path: &str, pattern: &str) -> bool {
    if pattern.contains("**") {
        let base = pattern.replace("**", "");
        path.contains(base.trim_matches('/'))
    } else if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            path.starts_with(parts[0]) && path.ends_with(parts[1])
        } else {
            false
        }
    } else {
        path == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKind;
    use chrono::Duration;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_all_finds_regular_files_only() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let detector = ChangeSetDetector::default();
        let mut files = detector.scan_all(dir.path()).unwrap();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let rels: Vec<String> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rels, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
    }

    #[test]
    fn test_changed_since_uses_strict_comparison() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.txt"), b"old").unwrap();

        let mut reference = BackupNode::new(NodeKind::Full, None, Utc::now());
        // Completion far in the future: nothing on disk is newer.
        reference.completed_at = Some(Utc::now() + Duration::hours(1));

        let detector = ChangeSetDetector::default();
        assert!(detector.changed_since(dir.path(), &reference).unwrap().is_empty());

        // Completion in the past: the file counts as changed.
        reference.completed_at = Some(Utc::now() - Duration::hours(1));
        let changed = detector.changed_since(dir.path(), &reference).unwrap();
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_incomplete_reference_is_rejected() {
        let dir = TempDir::new().unwrap();
        let reference = BackupNode::new(NodeKind::Full, None, Utc::now());

        let detector = ChangeSetDetector::default();
        assert!(matches!(
            detector.changed_since(dir.path(), &reference),
            Err(VaultError::StaleReference { .. })
        ));
    }

    #[test]
    fn test_exclude_patterns() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        fs::write(dir.path().join("cache/tmp.bin"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        let detector = ChangeSetDetector::new(vec!["**/cache/*".to_string()]);
        let files = detector.scan_all(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_string_lossy(), "keep.txt");
    }
}
