//! Backing Store
//!
//! Allocates sparse backing files inside a private scratch directory and
//! reclaims them. The scratch directory lives exactly as long as the store:
//! [`BackingStore::destroy_all`] removes it explicitly, and dropping the store
//! removes it as well so an aborted run leaves nothing behind.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const SCRATCH_PREFIX: &str = "hotplug-harness-";

/// Handle to one sparse backing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingFile {
    id: u64,
    path: PathBuf,
    size_bytes: u64,
}

impl BackingFile {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// Owner of every backing file created during a run.
#[derive(Debug)]
pub struct BackingStore {
    scratch: TempDir,
    files: BTreeMap<u64, PathBuf>,
    next_id: u64,
}

impl BackingStore {
    /// Create a store whose scratch directory lives under `root`, or the
    /// system temp directory when `root` is `None`.
    pub fn new(root: Option<&Path>) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(SCRATCH_PREFIX);
            b
        };
        let scratch = match root {
            Some(dir) => builder.tempdir_in(dir).map_err(|e| Error::storage(dir, e))?,
            None => builder
                .tempdir()
                .map_err(|e| Error::storage(&std::env::temp_dir(), e))?,
        };

        info!(scratch = %scratch.path().display(), "Backing store created");

        Ok(Self {
            scratch,
            files: BTreeMap::new(),
            next_id: 0,
        })
    }

    /// Scratch directory holding the backing files.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Number of live backing files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Create a sparse file of `size_bytes` that reads as zeros.
    ///
    /// Only the logical length is set; no data blocks are written.
    pub fn create(&mut self, size_bytes: u64) -> Result<BackingFile> {
        let id = self.next_id;
        let path = self
            .scratch
            .path()
            .join(format!("backing-{:04}-{}.img", id, uuid::Uuid::new_v4().simple()));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::storage(&path, e))?;
        if let Err(e) = file.set_len(size_bytes) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(Error::storage(&path, e));
        }

        self.next_id += 1;
        self.files.insert(id, path.clone());
        debug!(id, path = %path.display(), size_bytes, "Created backing file");

        Ok(BackingFile {
            id,
            path,
            size_bytes,
        })
    }

    /// True while `file` has not been destroyed and still exists on disk.
    pub fn exists(&self, file: &BackingFile) -> bool {
        self.files.contains_key(&file.id) && file.path.exists()
    }

    /// Delete a backing file. Destroying a missing file is a no-op.
    pub fn destroy(&mut self, file: &BackingFile) -> Result<()> {
        if self.files.remove(&file.id).is_none() {
            return Ok(());
        }
        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                debug!(id = file.id, path = %file.path.display(), "Removed backing file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(&file.path, e)),
        }
    }

    /// Remove every outstanding file and the scratch directory itself.
    ///
    /// Consumes the store: nothing can be allocated afterwards.
    pub fn destroy_all(mut self) -> Result<()> {
        let mut first_error = None;
        for (id, path) in std::mem::take(&mut self.files) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(id, path = %path.display(), error = %e, "Failed to remove backing file");
                    first_error.get_or_insert_with(|| Error::storage(&path, e));
                }
            }
        }

        let scratch = self.scratch.path().to_path_buf();
        self.scratch
            .close()
            .map_err(|e| Error::storage(&scratch, e))?;
        info!(scratch = %scratch.display(), "Backing store destroyed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::os::unix::fs::MetadataExt;

    const MIB: u64 = 1 << 20;

    #[test]
    fn test_create_sparse_file() {
        let root = tempfile::TempDir::new().unwrap();
        let mut store = BackingStore::new(Some(root.path())).unwrap();

        let file = store.create(64 * MIB).unwrap();
        let meta = std::fs::metadata(file.path()).unwrap();

        assert_eq!(meta.len(), 64 * MIB);
        assert_eq!(file.size_bytes(), 64 * MIB);
        // Holes, not written blocks
        assert!(meta.blocks() * 512 < 64 * MIB);
        assert!(file.path().starts_with(store.scratch_dir()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_files_get_distinct_ids_and_paths() {
        let root = tempfile::TempDir::new().unwrap();
        let mut store = BackingStore::new(Some(root.path())).unwrap();

        let a = store.create(MIB).unwrap();
        let b = store.create(MIB).unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let root = tempfile::TempDir::new().unwrap();
        let mut store = BackingStore::new(Some(root.path())).unwrap();

        let file = store.create(MIB).unwrap();
        store.destroy(&file).unwrap();
        assert!(!file.path().exists());
        assert!(!store.exists(&file));

        store.destroy(&file).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_destroy_after_external_removal() {
        let root = tempfile::TempDir::new().unwrap();
        let mut store = BackingStore::new(Some(root.path())).unwrap();

        let file = store.create(MIB).unwrap();
        std::fs::remove_file(file.path()).unwrap();
        assert!(!store.exists(&file));

        store.destroy(&file).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_destroy_all_removes_scratch_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let mut store = BackingStore::new(Some(root.path())).unwrap();
        store.create(MIB).unwrap();
        store.create(MIB).unwrap();
        let scratch = store.scratch_dir().to_path_buf();

        store.destroy_all().unwrap();

        assert!(!scratch.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_removes_scratch_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let scratch = {
            let mut store = BackingStore::new(Some(root.path())).unwrap();
            store.create(MIB).unwrap();
            store.scratch_dir().to_path_buf()
        };
        assert!(!scratch.exists());
    }

    #[test]
    fn test_unwritable_root_is_storage_error() {
        let missing = Path::new("/nonexistent/hotplug-harness/root");
        assert_matches!(BackingStore::new(Some(missing)), Err(Error::Storage { .. }));
    }
}
