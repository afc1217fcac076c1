//! Persisted failure list, consumed by "retry failed" runs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

const FAILED_FILE: &str = "failed.toml";

/// One failed item from a prior run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Manifest index of the item.
    pub index: u32,
    /// Classified error kind of the last failure.
    pub kind: ErrorKind,
    /// Human-readable failure detail.
    pub detail: String,
}

/// The persisted outcome of a run's failures. A subsequent `--retry-failed`
/// invocation uses `indices()` as its Selection Set. Superseded, not
/// merged, by the next run that persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRun {
    /// Unique id of the run that produced this list.
    pub id: String,
    /// When the run finished.
    pub created: DateTime<Utc>,
    /// Manifest item count at the time of the run, as a sanity check for
    /// the retry pass.
    pub manifest_items: u32,
    /// The failed items, ascending by index.
    pub failures: Vec<FailedItem>,
}

impl FailedRun {
    /// Creates a failure list for the just-finished run.
    #[must_use]
    pub fn new(manifest_items: u32, mut failures: Vec<FailedItem>) -> Self {
        failures.sort_by_key(|f| f.index);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created: Utc::now(),
            manifest_items,
            failures,
        }
    }

    /// The failed indices, ascending.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        self.failures.iter().map(|f| f.index).collect()
    }

    /// Saves the list atomically (write tmp + rename) under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, state_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(FAILED_FILE);
        let tmp_path = path.with_extension("toml.tmp");

        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Loads the most recently persisted failure list, if any. Unreadable
    /// or unparsable files are treated as absent.
    #[must_use]
    pub fn load(state_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(state_dir.join(FAILED_FILE)).ok()?;
        match toml::from_str(&content) {
            Ok(run) => Some(run),
            Err(e) => {
                log::warn!("ignoring unparsable failure list: {e}");
                None
            }
        }
    }

    /// Removes any persisted failure list, e.g. after a fully clean run.
    ///
    /// # Errors
    ///
    /// Propagates removal failures other than the file being absent.
    pub fn clear(state_dir: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(state_dir.join(FAILED_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Default state directory for the failure list.
    #[must_use]
    pub fn default_state_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memories-dl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn failed(index: u32, kind: ErrorKind) -> FailedItem {
        FailedItem {
            index,
            kind,
            detail: format!("item {index}"),
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = TempDir::new().unwrap();
        let run = FailedRun::new(
            40,
            vec![
                failed(7, ErrorKind::InvalidPayload),
                failed(3, ErrorKind::LinkExpiredOrForbidden),
            ],
        );
        run.save(dir.path()).unwrap();

        let loaded = FailedRun::load(dir.path()).unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.manifest_items, 40);
        // Sorted ascending on construction.
        assert_eq!(loaded.indices(), vec![3, 7]);
        assert_eq!(loaded.failures[1].kind, ErrorKind::InvalidPayload);
    }

    #[test]
    fn save_supersedes_previous_list() {
        let dir = TempDir::new().unwrap();
        FailedRun::new(10, vec![failed(1, ErrorKind::TransientHttp)])
            .save(dir.path())
            .unwrap();
        FailedRun::new(10, vec![failed(9, ErrorKind::ConversionFailed)])
            .save(dir.path())
            .unwrap();

        let loaded = FailedRun::load(dir.path()).unwrap();
        assert_eq!(loaded.indices(), vec![9]);
    }

    #[test]
    fn load_missing_or_garbage_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(FailedRun::load(dir.path()).is_none());
        std::fs::write(dir.path().join(FAILED_FILE), "not = [valid").unwrap();
        assert!(FailedRun::load(dir.path()).is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        FailedRun::clear(dir.path()).unwrap();
        FailedRun::new(5, vec![failed(2, ErrorKind::Io)])
            .save(dir.path())
            .unwrap();
        FailedRun::clear(dir.path()).unwrap();
        assert!(FailedRun::load(dir.path()).is_none());
        FailedRun::clear(dir.path()).unwrap();
    }
}
