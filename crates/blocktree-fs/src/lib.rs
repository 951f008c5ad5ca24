//! Filesystem-backed blob store.
//!
//! Chunks live flat in one directory under their 64-hex lowercase names,
//! matching how an intro URL resolves chunks by appending the bare name.
//! Publication is atomic: bytes are written to an anonymous temp file in
//! the same directory and renamed into place, so a crashed import never
//! leaves a partially written content-addressed file.

use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

use blocktree_core::store::{BlobStore, StoreError};
use blocktree_core::types::{to_hex, Address};

/// Blob store over a single chunk directory.
pub struct FsStore {
    base_path: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) the chunk directory at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn chunk_path(&self, address: &Address) -> PathBuf {
        self.base_path.join(to_hex(address))
    }

    /// Sync put; the async trait method delegates here.
    pub fn put_sync(&self, address: Address, bytes: &[u8]) -> Result<bool, StoreError> {
        let path = self.chunk_path(&address);
        if path.exists() {
            return Ok(false);
        }

        let mut temp = tempfile::NamedTempFile::new_in(&self.base_path)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&path)
            .map_err(|e| StoreError::Io(e.error))?;

        trace!(chunk = %to_hex(&address), size = bytes.len(), "stored chunk");
        Ok(true)
    }

    /// Sync get; the async trait method delegates here.
    pub fn get_sync(&self, address: &Address) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.chunk_path(address)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, address: &Address) -> bool {
        self.chunk_path(address).exists()
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn put(&self, address: Address, bytes: Vec<u8>) -> Result<bool, StoreError> {
        self.put_sync(address, &bytes)
    }

    async fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_sync(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocktree_core::sha256;

    fn temp_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = temp_store();
        let bytes = vec![1u8, 2, 3, 4];
        let address = sha256(&bytes);

        assert!(store.put(address, bytes.clone()).await.unwrap());
        assert_eq!(store.get(&address).await.unwrap(), Some(bytes));
    }

    #[tokio::test]
    async fn test_put_existing_reports_reuse() {
        let (_dir, store) = temp_store();
        let bytes = vec![5u8; 64];
        let address = sha256(&bytes);

        assert!(store.put(address, bytes.clone()).await.unwrap());
        assert!(!store.put(address, bytes).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let (_dir, store) = temp_store();
        assert_eq!(store.get(&[0u8; 32]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filename_is_hex_of_address() {
        let (dir, store) = temp_store();
        let bytes = vec![9u8; 16];
        let address = sha256(&bytes);
        store.put(address, bytes).await.unwrap();

        let name = to_hex(&address);
        assert_eq!(name.len(), 64);
        assert!(dir.path().join(&name).is_file());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (dir, store) = temp_store();
        for n in 0..4u8 {
            let bytes = vec![n; 32];
            store.put(sha256(&bytes), bytes).await.unwrap();
        }

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 4);
        assert!(names.iter().all(|n| n.len() == 64));
    }
}
