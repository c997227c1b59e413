//! Small filesystem helpers shared by the durable stores

use crate::Result;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Write a JSON record by staging next to the target and renaming into
/// place, so readers never observe a partially written record.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent).ok();
    }
    Ok(())
}

/// Flush directory metadata so a rename survives power loss.
pub(crate) fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Record {
        name: String,
        value: u32,
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_staging() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record.json");

        let first = Record {
            name: "a".into(),
            value: 1,
        };
        write_json_atomic(&path, &first).unwrap();

        let second = Record {
            name: "b".into(),
            value: 2,
        };
        write_json_atomic(&path, &second).unwrap();

        let loaded: Record =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, second);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
