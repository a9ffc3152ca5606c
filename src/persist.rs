//! Persistent stepper position store.
//!
//! Signed step counts represent the physical position of each tuner motor,
//! not merely software state, so they must survive process restarts. The
//! store is a flat JSON map from cavity identifier to signed steps, written
//! atomically (temp file + rename) so a crash mid-write can never corrupt the
//! previous snapshot.

use crate::error::SetupResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// On-disk map of accumulated signed stepper positions.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    positions: Mutex<HashMap<String, i64>>,
}

impl PositionStore {
    /// Open the store at `path`, loading any existing snapshot. A missing
    /// file is an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> SetupResult<Self> {
        let path = path.into();
        let positions = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            positions: Mutex::new(positions),
        })
    }

    /// Last persisted signed position for `cavity`, if any.
    pub fn get(&self, cavity: &str) -> Option<i64> {
        self.positions
            .lock()
            .ok()
            .and_then(|p| p.get(cavity).copied())
    }

    /// Record `steps` for `cavity` and flush the snapshot to disk.
    pub fn record(&self, cavity: &str, steps: i64) -> SetupResult<()> {
        let snapshot = {
            let mut positions = self
                .positions
                .lock()
                .map_err(|_| crate::error::SetupError::Channel("position map poisoned".into()))?;
            positions.insert(cavity.to_string(), steps);
            positions.clone()
        };
        self.flush(&snapshot)
    }

    fn flush(&self, snapshot: &HashMap<String, i64>) -> SetupResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        tmp.set_extension("json.tmp");
        tmp
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(dir.path().join("positions.json")).unwrap();
        assert_eq!(store.get("CM01 cavity 1"), None);
    }

    #[test]
    fn test_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let store = PositionStore::open(&path).unwrap();
        store.record("CM01 cavity 1", -123_456).unwrap();
        store.record("CM01 cavity 2", 40_000).unwrap();
        drop(store);

        let reopened = PositionStore::open(&path).unwrap();
        assert_eq!(reopened.get("CM01 cavity 1"), Some(-123_456));
        assert_eq!(reopened.get("CM01 cavity 2"), Some(40_000));
    }
}
