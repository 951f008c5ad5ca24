//! Blob store interface and the in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::{to_hex, Address};

/// Content-addressed blob store.
///
/// Chunks are immutable; `put` of an already-present address is a no-op and
/// reports it, which is what the importer's reuse accounting keys off.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `address`.
    /// Returns true if newly stored, false if the address already existed.
    async fn put(&self, address: Address, bytes: Vec<u8>) -> Result<bool, StoreError>;

    /// Fetch the bytes stored under `address`, or `None` if absent.
    async fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Other(String),
}

/// In-memory blob store for tests and ephemeral use.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.data.read().unwrap().contains_key(&to_hex(address))
    }

    /// Overwrite stored bytes in place; test hook for corruption scenarios.
    pub fn tamper<F: FnOnce(&mut Vec<u8>)>(&self, address: &Address, mutate: F) -> bool {
        let mut data = self.data.write().unwrap();
        match data.get_mut(&to_hex(address)) {
            Some(bytes) => {
                mutate(bytes);
                true
            }
            None => false,
        }
    }

    /// All stored addresses.
    pub fn addresses(&self) -> Vec<Address> {
        self.data
            .read()
            .unwrap()
            .keys()
            .filter_map(|hex| crate::types::from_hex(hex).ok())
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, address: Address, bytes: Vec<u8>) -> Result<bool, StoreError> {
        let key = to_hex(&address);
        let mut data = self.data.write().unwrap();
        if data.contains_key(&key) {
            return Ok(false);
        }
        data.insert(key, bytes);
        Ok(true)
    }

    async fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, StoreError> {
        let key = to_hex(address);
        Ok(self.data.read().unwrap().get(&key).cloned())
    }
}
