//! The blob/thunk store contract consumed by the dispatcher.
//!
//! The store itself is an external collaborator; the coordinator only
//! needs the operations below. `FsBlobStore` is a directory-backed
//! implementation for binaries and tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use common::id::BlobHash;
use errors::{Result, ResultExt};

pub trait BlobStore {
    /// Whether the blob is already reachable by workers (replicated to
    /// the backing storage), making a dependency push unnecessary.
    fn is_available(&self, hash: &str) -> bool;
    fn set_available(&self, hash: &str);
    /// Record a reduction: `key` (a thunk hash or an output key) now
    /// resolves to the blob named `value`.
    fn insert(&self, key: &str, value: &str);
    /// Size of the named blob in bytes, 0 when unknown.
    fn size(&self, hash: &str) -> u32;
    fn blob_path(&self, hash: &str) -> PathBuf;
    fn read_blob(&self, hash: &str) -> Result<Vec<u8>>;
    /// Create a file with the given contents so that the path never
    /// exposes partially written data.
    fn atomic_create(&self, data: &[u8], path: &Path) -> Result<()>;
    /// Cache key naming one tagged output of a thunk.
    fn output_key(&self, thunk_hash: &str, tag: &str) -> String {
        format!("{}#{}", thunk_hash, tag)
    }
}

/// Blobs as files under `<root>/blobs`; availability and reduction
/// records kept in memory.
pub struct FsBlobStore {
    blob_dir: PathBuf,
    available: RefCell<HashSet<BlobHash>>,
    reductions: RefCell<HashMap<String, String>>,
}

impl FsBlobStore {
    pub fn new(root: &Path) -> Result<Self> {
        let blob_dir = root.join("blobs");
        fs::create_dir_all(&blob_dir)
            .chain_err(|| format!("cannot create blob directory {:?}", blob_dir))?;
        Ok(FsBlobStore {
            blob_dir,
            available: RefCell::new(HashSet::new()),
            reductions: RefCell::new(HashMap::new()),
        })
    }

    pub fn reduction(&self, key: &str) -> Option<String> {
        self.reductions.borrow().get(key).cloned()
    }
}

impl BlobStore for FsBlobStore {
    fn is_available(&self, hash: &str) -> bool {
        self.available.borrow().contains(hash)
    }

    fn set_available(&self, hash: &str) {
        debug!("blob {} marked available", hash);
        self.available.borrow_mut().insert(hash.to_string());
    }

    fn insert(&self, key: &str, value: &str) {
        debug!("reduction {} -> {}", key, value);
        self.reductions
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn size(&self, hash: &str) -> u32 {
        fs::metadata(self.blob_path(hash))
            .map(|meta| meta.len() as u32)
            .unwrap_or(0)
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.blob_dir.join(hash)
    }

    fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(hash)).chain_err(|| format!("cannot read blob {}", hash))
    }

    fn atomic_create(&self, data: &[u8], path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => bail!("blob path {:?} has no parent directory", path),
        };
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => bail!("blob path {:?} has no file name", path),
        };
        let temp = parent.join(format!(".{}.tmp", name));
        fs::write(&temp, data).chain_err(|| format!("cannot write {:?}", temp))?;
        fs::rename(&temp, path).chain_err(|| format!("cannot rename into {:?}", path))?;
        Ok(())
    }
}
