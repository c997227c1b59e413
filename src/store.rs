//! Whole-file content-addressed storage with reference counting
//!
//! Objects are stored once per unique BLAKE3 digest and shared by every
//! FileEntry with the same content. A payload is immutable after
//! publication; new payloads are staged under `tmp/` and renamed into place
//! so a partially written object is never visible under its final hash.
//! Reference counts live in a JSON index that is rewritten atomically in
//! the same critical section as every mutation, so the store answers
//! queries correctly after a restart without replaying prior runs.

use crate::fsutil::{fsync_dir, write_json_atomic};
use crate::types::{BackupNode, FileEntry, ObjectHash};
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const INDEX_FILE: &str = "objects.json";
const INDEX_VERSION: u32 = 1;

/// Result of a `put`: the content hash plus whether the call became a
/// reference to an already-stored object.
#[derive(Debug, Clone)]
pub struct Stored {
    pub hash: ObjectHash,
    pub size: u64,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    refcount: u64,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectIndex {
    version: u32,
    objects: HashMap<String, ObjectMeta>,
}

impl Default for ObjectIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            objects: HashMap::new(),
        }
    }
}

/// Repair report from [`ObjectStore::rebuild_refcounts`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefcountRepair {
    pub refcounts_fixed: usize,
    pub orphans_removed: usize,
    pub recovered: usize,
    pub missing: usize,
}

/// The deduplicating object store rooted at a destination directory.
#[derive(Debug)]
pub struct ObjectStore {
    objects_path: PathBuf,
    tmp_path: PathBuf,
    index_path: PathBuf,
    index: Mutex<ObjectIndex>,
}

impl ObjectStore {
    /// Open (or initialize) the store under the given destination root.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let objects_path = root.join(OBJECTS_DIR);
        let tmp_path = root.join(TMP_DIR);
        fs::create_dir_all(&objects_path)?;
        fs::create_dir_all(&tmp_path)?;

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let content = fs::read_to_string(&index_path)?;
            let index: ObjectIndex = serde_json::from_str(&content)?;
            if index.version != INDEX_VERSION {
                return Err(VaultError::Integrity {
                    reason: format!(
                        "unsupported object index version: {} (expected {})",
                        index.version, INDEX_VERSION
                    ),
                });
            }
            index
        } else {
            ObjectIndex::default()
        };

        Ok(Self {
            objects_path,
            tmp_path,
            index_path,
            index: Mutex::new(index),
        })
    }

    /// Store content under its digest. If an object with the same hash
    /// already exists, its refcount is incremented and the bytes are not
    /// rewritten.
    ///
    /// The create-vs-reference decision is the only critical section:
    /// payload bytes are written outside it. The reserving index entry
    /// makes concurrent callers references even while the first writer's
    /// payload is still in flight; if publication fails, the reservation is
    /// rolled back and the staged artifact discarded.
    pub fn put(&self, data: &[u8]) -> Result<Stored> {
        let hash = ObjectHash::from_bytes(data);
        let size = data.len() as u64;

        {
            let mut index = self.index();
            if let Some(meta) = index.objects.get_mut(hash.as_str()) {
                meta.refcount += 1;
                let refcount = meta.refcount;
                self.save_index(&index)?;
                debug!("object {} referenced, refcount {}", hash, refcount);
                return Ok(Stored {
                    hash,
                    size,
                    deduplicated: true,
                });
            }
            index
                .objects
                .insert(hash.as_str().to_string(), ObjectMeta { refcount: 1, size });
            self.save_index(&index)?;
        }

        if let Err(e) = self.publish(&hash, data) {
            let mut index = self.index();
            index.objects.remove(hash.as_str());
            if let Err(save_err) = self.save_index(&index) {
                warn!("failed to roll back index entry for {}: {}", hash, save_err);
            }
            return Err(VaultError::PartialWrite {
                hash: hash.to_string(),
                reason: e.to_string(),
            });
        }

        debug!("object {} stored ({} bytes)", hash, size);
        Ok(Stored {
            hash,
            size,
            deduplicated: false,
        })
    }

    /// Stage the payload and atomically rename it under its final hash.
    fn publish(&self, hash: &ObjectHash, data: &[u8]) -> std::io::Result<()> {
        let staged = self.tmp_path.join(format!("{}.partial", hash));
        let result = (|| {
            let mut file = File::create(&staged)?;
            file.write_all(data)?;
            file.sync_all()?;

            let final_path = self.object_path(hash);
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&staged, &final_path)?;
            if let Some(parent) = final_path.parent() {
                fsync_dir(parent).ok();
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&staged);
        }
        result
    }

    /// Record a FileEntry referencing the object. The stored payload is
    /// immutable, so the entry shares it instead of copying bytes.
    pub fn link(
        &self,
        hash: &ObjectHash,
        node: &mut BackupNode,
        relative_path: PathBuf,
    ) -> Result<()> {
        let size = {
            let index = self.index();
            match index.objects.get(hash.as_str()) {
                Some(meta) => meta.size,
                None => {
                    return Err(VaultError::ObjectNotFound {
                        hash: hash.to_string(),
                    })
                }
            }
        };

        node.files.push(FileEntry {
            relative_path,
            hash: hash.clone(),
            size,
        });
        Ok(())
    }

    /// Drop one reference; the payload is deleted when the count reaches zero.
    pub fn release(&self, hash: &ObjectHash) -> Result<()> {
        let mut index = self.index();
        let meta = index.objects.get_mut(hash.as_str()).ok_or_else(|| {
            VaultError::ObjectNotFound {
                hash: hash.to_string(),
            }
        })?;

        meta.refcount = meta.refcount.saturating_sub(1);
        if meta.refcount == 0 {
            index.objects.remove(hash.as_str());
            let path = self.object_path(hash);
            match fs::remove_file(&path) {
                Ok(()) => debug!("object {} released and deleted", hash),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("object {} payload already missing", hash)
                }
                Err(e) => {
                    // Keep the index consistent with our decision; the
                    // stray payload is reclaimable by rebuild_refcounts.
                    warn!("failed to delete payload for {}: {}", hash, e);
                }
            }
        }
        self.save_index(&index)
    }

    /// Read a payload back, verifying its digest.
    pub fn read(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        if !self.contains(hash) {
            return Err(VaultError::ObjectNotFound {
                hash: hash.to_string(),
            });
        }

        let data = fs::read(self.object_path(hash))?;
        let computed = ObjectHash::from_bytes(&data);
        if computed != *hash {
            return Err(VaultError::Integrity {
                reason: format!("object hash mismatch: expected {}, got {}", hash, computed),
            });
        }
        Ok(data)
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.index().objects.contains_key(hash.as_str())
    }

    pub fn refcount(&self, hash: &ObjectHash) -> Option<u64> {
        self.index().objects.get(hash.as_str()).map(|m| m.refcount)
    }

    pub fn object_count(&self) -> usize {
        self.index().objects.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.index().objects.values().map(|m| m.size).sum()
    }

    /// Remove `.partial` staging residue left by interrupted writes.
    pub fn sweep_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.tmp_path)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && entry.file_name().to_string_lossy().ends_with(".partial")
            {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("swept {} partial object(s)", removed);
        }
        Ok(removed)
    }

    /// Reconcile the index against live reference counts recomputed from
    /// node records (hash → number of FileEntries). Unreferenced payloads
    /// are deleted, drifted counts corrected, and payloads present on disk
    /// but absent from the index re-adopted.
    pub fn rebuild_refcounts(&self, live: &HashMap<String, u64>) -> Result<RefcountRepair> {
        let mut repair = RefcountRepair::default();
        let mut index = self.index();

        let known: Vec<String> = index.objects.keys().cloned().collect();
        for hash_str in known {
            let expected = live.get(&hash_str).copied().unwrap_or(0);
            if expected == 0 {
                index.objects.remove(&hash_str);
                let path = self.object_path(&ObjectHash::new(hash_str.clone()));
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to delete orphan object {}: {}", hash_str, e);
                    }
                }
                repair.orphans_removed += 1;
            } else if index.objects[&hash_str].refcount != expected {
                if let Some(meta) = index.objects.get_mut(&hash_str) {
                    debug!(
                        "refcount for {} corrected {} -> {}",
                        hash_str, meta.refcount, expected
                    );
                    meta.refcount = expected;
                    repair.refcounts_fixed += 1;
                }
            }
        }

        for (hash_str, expected) in live {
            if index.objects.contains_key(hash_str) {
                continue;
            }
            let hash = ObjectHash::new(hash_str.clone());
            let path = self.object_path(&hash);
            match fs::metadata(&path) {
                Ok(meta) => {
                    index.objects.insert(
                        hash_str.clone(),
                        ObjectMeta {
                            refcount: *expected,
                            size: meta.len(),
                        },
                    );
                    repair.recovered += 1;
                }
                Err(_) => {
                    warn!("referenced object {} is missing from the store", hash_str);
                    repair.missing += 1;
                }
            }
        }

        self.save_index(&index)?;
        Ok(repair)
    }

    /// Shard payloads by the first two hash characters, keeping directory
    /// fan-out bounded.
    fn object_path(&self, hash: &ObjectHash) -> PathBuf {
        let hash_str = hash.as_str();
        let dir = &hash_str[..2];
        let file = &hash_str[2..];
        self.objects_path.join(dir).join(file)
    }

    fn index(&self) -> MutexGuard<'_, ObjectIndex> {
        self.index.lock().expect("object index lock poisoned")
    }

    fn save_index(&self, index: &ObjectIndex) -> Result<()> {
        write_json_atomic(&self.index_path, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_put_is_idempotent_on_identical_content() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();

        let first = store.put(b"dup").unwrap();
        let second = store.put(b"dup").unwrap();

        assert_eq!(first.hash, second.hash);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(store.refcount(&first.hash), Some(2));
        assert_eq!(store.object_count(), 1);
    }

    #[test]
    fn test_release_deletes_at_zero() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();

        let stored = store.put(b"content").unwrap();
        store.put(b"content").unwrap();

        store.release(&stored.hash).unwrap();
        assert_eq!(store.refcount(&stored.hash), Some(1));
        assert!(store.read(&stored.hash).is_ok());

        store.release(&stored.hash).unwrap();
        assert!(!store.contains(&stored.hash));
        assert!(matches!(
            store.read(&stored.hash),
            Err(VaultError::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_read_verifies_integrity() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();

        let stored = store.put(b"pristine").unwrap();
        fs::write(store.object_path(&stored.hash), b"tampered").unwrap();

        assert!(matches!(
            store.read(&stored.hash),
            Err(VaultError::Integrity { .. })
        ));
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let hash = {
            let store = ObjectStore::open(dir.path()).unwrap();
            store.put(b"persistent").unwrap();
            store.put(b"persistent").unwrap().hash
        };

        let reopened = ObjectStore::open(dir.path()).unwrap();
        assert_eq!(reopened.refcount(&hash), Some(2));
        assert_eq!(reopened.read(&hash).unwrap(), b"persistent");
    }

    #[test]
    fn test_link_records_zero_copy_reference() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let mut node = BackupNode::new(NodeKind::Full, None, Utc::now());

        let stored = store.put(b"linked").unwrap();
        store
            .link(&stored.hash, &mut node, PathBuf::from("a/b.txt"))
            .unwrap();

        assert_eq!(node.files.len(), 1);
        assert_eq!(node.files[0].hash, stored.hash);
        assert_eq!(node.files[0].size, 6);
        // Only one payload on disk regardless of how many entries share it.
        assert_eq!(store.object_count(), 1);
    }

    #[test]
    fn test_link_unknown_hash_fails() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let mut node = BackupNode::new(NodeKind::Full, None, Utc::now());

        let unknown = ObjectHash::from_bytes(b"never stored");
        assert!(matches!(
            store.link(&unknown, &mut node, PathBuf::from("x")),
            Err(VaultError::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_sweep_partials_removes_residue() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();

        fs::write(dir.path().join("tmp/deadbeef.partial"), b"junk").unwrap();
        assert_eq!(store.sweep_partials().unwrap(), 1);
        assert_eq!(store.sweep_partials().unwrap(), 0);
    }

    #[test]
    fn test_rebuild_refcounts_reconciles_index() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();

        let kept = store.put(b"kept").unwrap();
        let orphan = store.put(b"orphan").unwrap();

        let mut live = HashMap::new();
        live.insert(kept.hash.as_str().to_string(), 3u64);

        let repair = store.rebuild_refcounts(&live).unwrap();
        assert_eq!(repair.refcounts_fixed, 1);
        assert_eq!(repair.orphans_removed, 1);
        assert_eq!(store.refcount(&kept.hash), Some(3));
        assert!(!store.contains(&orphan.hash));
    }
}
