//! Last reported status, persisted as a one-line text file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read status file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write status file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A single durable status value.
pub trait StatusStore: Send + Sync {
    /// The stored status, or `""` if nothing has been stored yet.
    fn read(&self) -> Result<String, StoreError>;

    /// Replace the stored status. Readers see either the old or the new
    /// value, never a partial one.
    fn write(&self, status: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusStore for FileStatusStore {
    fn read(&self) -> Result<String, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, status: &str) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_err)?;

        // Stage next to the target so the rename never crosses filesystems.
        // Each writer gets its own uniquely named staging file; a staging
        // file that is never persisted is removed on drop.
        let mut staged = NamedTempFile::new_in(parent).map_err(write_err)?;
        staged.write_all(status.as_bytes()).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;
        staged.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), "status stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(tmp.path().join("latest_status.txt"));
        assert_eq!(store.read().unwrap(), "");
    }

    #[test]
    fn write_then_read_returns_value() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(tmp.path().join("latest_status.txt"));

        store.write("Pending").unwrap();
        assert_eq!(store.read().unwrap(), "Pending");

        store.write("Under Review").unwrap();
        assert_eq!(store.read().unwrap(), "Under Review");
    }

    #[test]
    fn empty_value_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(tmp.path().join("latest_status.txt"));
        store.write("").unwrap();
        assert_eq!(store.read().unwrap(), "");
    }

    #[test]
    fn read_trims_surrounding_whitespace() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("latest_status.txt");
        fs::write(&path, "  Offer\n").unwrap();
        assert_eq!(FileStatusStore::new(path).read().unwrap(), "Offer");
    }

    #[test]
    fn write_leaves_no_staging_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(tmp.path().join("latest_status.txt"));
        store.write("Offer").unwrap();

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["latest_status.txt".to_string()]);
    }

    #[test]
    fn concurrent_writers_both_succeed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(tmp.path().join("latest_status.txt"));

        for _ in 0..200 {
            let results: Vec<Result<(), StoreError>> = std::thread::scope(|s| {
                let a = s.spawn(|| store.write("Under Review"));
                let b = s.spawn(|| store.write("Offer"));
                vec![a.join().unwrap(), b.join().unwrap()]
            });
            for result in results {
                result.unwrap();
            }
            let stored = store.read().unwrap();
            assert!(stored == "Under Review" || stored == "Offer", "{stored:?}");
        }

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["latest_status.txt".to_string()]);
    }

    #[test]
    fn failed_persist_cleans_up_staging_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("latest_status.txt");
        // A non-empty directory in the way makes the final rename fail.
        fs::create_dir(&target).unwrap();
        fs::write(target.join("occupied"), "x").unwrap();
        let store = FileStatusStore::new(&target);

        assert!(matches!(store.write("Offer"), Err(StoreError::Write { .. })));

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["latest_status.txt".to_string()]);
    }

    #[test]
    fn write_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(tmp.path().join("state").join("status.txt"));
        store.write("Offer").unwrap();
        assert_eq!(store.read().unwrap(), "Offer");
    }

    #[test]
    fn unreadable_path_is_a_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let store = FileStatusStore::new(tmp.path());
        assert!(matches!(store.read(), Err(StoreError::Read { .. })));
    }
}
