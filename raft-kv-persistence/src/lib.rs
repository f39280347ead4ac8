//! File-backed persistence for Raft hard state
//!
//! The whole hard state is rewritten on every save: encode, write to a
//! temporary file, fsync, rename over the previous state, fsync the
//! directory. A crash at any point leaves either the old or the new state
//! on disk, never a torn mix.

use parking_lot::Mutex;
use raft_kv_core::{RaftKvError, Result};
use raft_kv_raft::{HardState, HardStateRef, Persister};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the current hard state inside the data directory
pub const STATE_FILE: &str = "raft-state.bin";
const TMP_SUFFIX: &str = "tmp";

/// [`Persister`] that keeps one file per node
pub struct FilePersister {
    path: PathBuf,
    tmp_path: PathBuf,
    // Serializes writers so two saves never share the temporary file
    write_lock: Mutex<()>,
}

impl FilePersister {
    /// Open (creating if needed) the data directory `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            RaftKvError::Persistence(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(STATE_FILE);
        let tmp_path = path.with_extension(TMP_SUFFIX);
        // Left over from a save interrupted before its rename
        if tmp_path.exists() {
            debug!("Removing stale {}", tmp_path.display());
            fs::remove_file(&tmp_path).map_err(persistence_error)?;
        }

        info!("Raft state stored at {}", path.display());
        Ok(Self {
            path,
            tmp_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        sync_dir(&self.path)
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn persistence_error(e: std::io::Error) -> RaftKvError {
    RaftKvError::Persistence(e.to_string())
}

impl Persister for FilePersister {
    fn save(&self, state: HardStateRef<'_>) -> Result<()> {
        let bytes = state.encode()?;
        let _guard = self.write_lock.lock();
        self.write_atomically(&bytes).map_err(|e| {
            RaftKvError::Persistence(format!("write {}: {}", self.path.display(), e))
        })?;
        debug!(
            "Saved term {} with {} log entries ({} bytes)",
            state.current_term,
            state.log.len(),
            bytes.len()
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        match fs::read(&self.path) {
            Ok(bytes) => HardState::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RaftKvError::Persistence(format!(
                "read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_kv_raft::LogEntry;
    use tempfile::TempDir;

    fn sample_state(term: u64) -> HardState {
        HardState {
            current_term: term,
            voted_for: Some(3),
            log: vec![LogEntry::new(1, b"a".to_vec()), LogEntry::new(term, b"b".to_vec())],
            commit_index: Some(0),
        }
    }

    #[test]
    fn test_fresh_directory_has_no_state() {
        let dir = TempDir::new().unwrap();
        let persister = FilePersister::open(dir.path()).unwrap();
        assert!(persister.load().unwrap().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let state = sample_state(4);
        {
            let persister = FilePersister::open(dir.path()).unwrap();
            persister.save(state.borrowed()).unwrap();
        }

        let reopened = FilePersister::open(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(state));
    }

    #[test]
    fn test_latest_save_wins() {
        let dir = TempDir::new().unwrap();
        let persister = FilePersister::open(dir.path()).unwrap();
        persister.save(sample_state(1).borrowed()).unwrap();
        persister.save(sample_state(2).borrowed()).unwrap();

        assert_eq!(persister.load().unwrap().unwrap().current_term, 2);
        assert!(!persister.tmp_path.exists());
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("node-1").join("raft");
        let persister = FilePersister::open(&nested).unwrap();
        persister.save(sample_state(1).borrowed()).unwrap();
        assert!(nested.join(STATE_FILE).exists());
    }

    #[test]
    fn test_interrupted_save_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let persister = FilePersister::open(dir.path()).unwrap();
            persister.save(sample_state(5).borrowed()).unwrap();
        }
        // A crash between write and rename leaves a temporary file behind
        let tmp = dir.path().join(STATE_FILE).with_extension(TMP_SUFFIX);
        fs::write(&tmp, b"partial").unwrap();

        let persister = FilePersister::open(dir.path()).unwrap();
        assert!(!tmp.exists());
        assert_eq!(persister.load().unwrap().unwrap().current_term, 5);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"\x01\x02").unwrap();

        let persister = FilePersister::open(dir.path()).unwrap();
        assert!(matches!(persister.load(), Err(RaftKvError::Persistence(_))));
    }
}
