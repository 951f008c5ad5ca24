//! Bounded in-memory chunk cache with request coalescing.
//!
//! The cache holds decrypted envelopes keyed by address. For each address
//! at most one fetch is in flight: concurrent callers subscribe to the
//! pending slot and all receive the same result. A failed fetch clears the
//! slot so later callers can retry.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::broadcast;

use crate::reader::ReadError;
use crate::types::{Address, Chunk};

/// Future producing a decoded chunk on a cache miss.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Chunk, ReadError>> + Send + 'a>>;

/// Chunk cache interface.
#[async_trait]
pub trait ChunkCache: Send + Sync {
    /// Return the cached chunk for `address`, or drive `fetch` to produce
    /// it. Implementations decide whether the result is retained.
    async fn get_or_fetch<'a>(
        &'a self,
        address: Address,
        fetch: FetchFuture<'a>,
    ) -> Result<Arc<Chunk>, ReadError>;
}

type Shared = Result<Arc<Chunk>, ReadError>;

struct CacheState {
    entries: LruCache<Address, Arc<Chunk>>,
    pending: HashMap<Address, broadcast::Sender<Shared>>,
}

/// Entry-count-bounded LRU cache with single-flight fetches.
pub struct MemoryCache {
    state: Mutex<CacheState>,
}

impl MemoryCache {
    /// Default capacity used by the server CLI.
    pub const DEFAULT_CAPACITY: usize = 32;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                pending: HashMap::new(),
            }),
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChunkCache for MemoryCache {
    async fn get_or_fetch<'a>(
        &'a self,
        address: Address,
        fetch: FetchFuture<'a>,
    ) -> Result<Arc<Chunk>, ReadError> {
        let mut receiver = {
            let mut state = self.state.lock().unwrap();
            if let Some(chunk) = state.entries.get(&address) {
                return Ok(chunk.clone());
            }
            if let Some(sender) = state.pending.get(&address) {
                Some(sender.subscribe())
            } else {
                let (sender, _) = broadcast::channel(1);
                state.pending.insert(address, sender);
                None
            }
        };

        if let Some(receiver) = receiver.as_mut() {
            return match receiver.recv().await {
                Ok(result) => result,
                // The fetching caller vanished before publishing; report
                // the address as unavailable rather than retrying forever.
                Err(_) => Err(ReadError::Store(format!(
                    "pending fetch for {} was abandoned",
                    crate::types::to_hex(&address)
                ))),
            };
        }

        // If this future is dropped mid-fetch, clear the pending slot so
        // waiters see the sender close instead of hanging.
        let mut guard = ClearPending {
            state: &self.state,
            address,
            armed: true,
        };

        // Fetch without holding the lock.
        let result: Shared = fetch.await.map(Arc::new);

        let mut state = self.state.lock().unwrap();
        let sender = state.pending.remove(&address);
        if let Ok(chunk) = &result {
            state.entries.put(address, chunk.clone());
        }
        drop(state);
        guard.armed = false;

        if let Some(sender) = sender {
            let _ = sender.send(result.clone());
        }
        result
    }
}

struct ClearPending<'a> {
    state: &'a Mutex<CacheState>,
    address: Address,
    armed: bool,
}

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut state) = self.state.lock() {
                state.pending.remove(&self.address);
            }
        }
    }
}

/// Pass-through cache: every lookup fetches.
#[derive(Default)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        NullCache
    }
}

#[async_trait]
impl ChunkCache for NullCache {
    async fn get_or_fetch<'a>(
        &'a self,
        _address: Address,
        fetch: FetchFuture<'a>,
    ) -> Result<Arc<Chunk>, ReadError> {
        fetch.await.map(Arc::new)
    }
}
