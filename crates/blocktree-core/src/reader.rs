//! Tree reader: intro recovery and the random-access range resolver.

use std::sync::Arc;

use tracing::debug;

use crate::cache::ChunkCache;
use crate::codec::{self, CodecError};
use crate::crypto::Keying;
use crate::store::BlobStore;
use crate::types::{
    to_hex, Address, ChildRef, Chunk, ChunkKind, IntroRecord, Layout, INTRO_RECORD_LEN,
};

/// Reader error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    #[error("chunk {0} not found")]
    NotFound(String),
    #[error("corrupted chunk {address}: {reason}")]
    Corrupted { address: String, reason: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("read of {length} bytes at {offset} exceeds device size {total_size}")]
    OutOfRange {
        offset: u64,
        length: u64,
        total_size: u64,
    },
}

impl ReadError {
    fn corrupted(address: &Address, error: CodecError) -> ReadError {
        ReadError::Corrupted {
            address: to_hex(address),
            reason: error.to_string(),
        }
    }

    fn malformed(address: &Address, reason: &str) -> ReadError {
        ReadError::Corrupted {
            address: to_hex(address),
            reason: reason.to_string(),
        }
    }
}

/// One resolved step of a range walk.
enum Run {
    /// Zeros from the resolved position up to `end`.
    Zero { end: u64 },
    /// A leaf whose span starts at `start`.
    Leaf { chunk: Arc<Chunk>, start: u64 },
}

/// Random-access reader over a published chunk tree.
///
/// Opened from an intro address and unlock key; serves
/// `read_at(offset, length)` by descending interior chunks to the leaves,
/// fetching through the shared chunk cache.
pub struct ChunkReader {
    store: Arc<dyn BlobStore>,
    cache: Arc<dyn ChunkCache>,
    keying: Keying,
    layout: Layout,
    intro: IntroRecord,
}

impl ChunkReader {
    /// Fetch and decrypt the intro chunk, validate the recorded geometry
    /// and build a reader for the tree it names.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        cache: Arc<dyn ChunkCache>,
        intro_address: Address,
        unlock_key: &[u8],
    ) -> Result<ChunkReader, ReadError> {
        let intro_keying = Keying::for_unlock_key(unlock_key)
            .map_err(|e| ReadError::Store(e.to_string()))?;

        let bytes = store
            .get(&intro_address)
            .await
            .map_err(|e| ReadError::Store(e.to_string()))?
            .ok_or_else(|| ReadError::NotFound(to_hex(&intro_address)))?;

        let chunk = codec::open(&bytes, &intro_address, &intro_keying, INTRO_RECORD_LEN)
            .map_err(|e| ReadError::corrupted(&intro_address, e))?;
        let intro = match chunk {
            Chunk::Intro(record) => record,
            _ => return Err(ReadError::malformed(&intro_address, "not an intro chunk")),
        };

        let layout = Layout::new(intro.chunk_size_log2)
            .ok_or_else(|| ReadError::malformed(&intro_address, "chunk size out of range"))?;
        if intro.fan_out != layout.fan_out() {
            return Err(ReadError::malformed(&intro_address, "fan-out mismatch"));
        }
        if intro.block_size == 0 {
            return Err(ReadError::malformed(&intro_address, "zero block size"));
        }
        if intro.layers > 64 {
            return Err(ReadError::malformed(&intro_address, "layer count out of range"));
        }
        if layout.span(intro.layers) < intro.total_size as u128 {
            return Err(ReadError::malformed(&intro_address, "layers do not cover device"));
        }

        debug!(
            total_size = intro.total_size,
            layers = intro.layers,
            fan_out = intro.fan_out,
            "opened chunk tree"
        );

        Ok(ChunkReader {
            store,
            cache,
            keying: Keying::for_repo_secret(intro.repo_secret),
            layout,
            intro,
        })
    }

    /// Logical device size in bytes.
    pub fn total_size(&self) -> u64 {
        self.intro.total_size
    }

    /// Block size recorded at import time.
    pub fn block_size(&self) -> u32 {
        self.intro.block_size
    }

    /// Read `length` bytes starting at `offset`.
    ///
    /// The whole range must lie inside `[0, total_size)`; anything else is
    /// rejected with `OutOfRange` before any fetch is issued.
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, ReadError> {
        let end = offset
            .checked_add(length as u64)
            .filter(|end| *end <= self.intro.total_size)
            .ok_or(ReadError::OutOfRange {
                offset,
                length: length as u64,
                total_size: self.intro.total_size,
            })?;

        let mut out = Vec::with_capacity(length);
        let mut pos = offset;
        while pos < end {
            match self.resolve(pos).await? {
                Run::Zero { end: run_end } => {
                    let take = (run_end.min(end) - pos) as usize;
                    out.resize(out.len() + take, 0);
                    pos += take as u64;
                }
                Run::Leaf { chunk, start } => {
                    let Chunk::Leaf(data) = &*chunk else {
                        return Err(ReadError::Corrupted {
                            address: to_hex(&self.intro.top_address),
                            reason: "resolver produced a non-leaf chunk".to_string(),
                        });
                    };
                    let skip = (pos - start) as usize;
                    if skip >= data.len() {
                        // The leaf ends before its span does while the
                        // device continues; the tree is inconsistent.
                        return Err(ReadError::Corrupted {
                            address: to_hex(&self.intro.top_address),
                            reason: format!("leaf at {} shorter than resolved offset", start),
                        });
                    }
                    let avail = data.len() - skip;
                    let take = avail.min((end - pos) as usize);
                    out.extend_from_slice(&data[skip..skip + take]);
                    pos += take as u64;
                }
            }
        }
        Ok(out)
    }

    /// Resolve the run containing `pos`: either a zero span or the leaf
    /// whose range covers it.
    async fn resolve(&self, pos: u64) -> Result<Run, ReadError> {
        if self.intro.layers == 0 {
            let chunk = self.load(self.intro.top_address, ChunkKind::Leaf).await?;
            return Ok(Run::Leaf { chunk, start: 0 });
        }

        let mut address = self.intro.top_address;
        for layer in (1..=self.intro.layers).rev() {
            let chunk = self.load(address, ChunkKind::Interior).await?;
            let Chunk::Interior(children) = &*chunk else {
                return Err(ReadError::malformed(&address, "expected an interior chunk"));
            };

            let child_span = self.layout.span(layer - 1);
            let index = ((pos as u128 % self.layout.span(layer)) / child_span) as usize;
            let child = children
                .get(index)
                .ok_or_else(|| ReadError::malformed(&address, "child index out of range"))?;
            let child_start = pos - (pos as u128 % child_span) as u64;

            match child {
                ChildRef::Zero => {
                    let end = (child_start as u128 + child_span)
                        .min(self.intro.total_size as u128) as u64;
                    return Ok(Run::Zero { end });
                }
                ChildRef::Chunk(next) => address = *next,
            }
        }

        let leaf_span = self.layout.span(0);
        let start = pos - (pos as u128 % leaf_span) as u64;
        let chunk = self.load(address, ChunkKind::Leaf).await?;
        Ok(Run::Leaf { chunk, start })
    }

    /// Load a chunk through the cache, fetching and decoding on miss.
    async fn load(&self, address: Address, expected: ChunkKind) -> Result<Arc<Chunk>, ReadError> {
        let store = self.store.clone();
        let keying = self.keying.clone();
        let max_body = self.layout.leaf_span();
        let chunk = self
            .cache
            .get_or_fetch(
                address,
                Box::pin(async move {
                    let bytes = store
                        .get(&address)
                        .await
                        .map_err(|e| ReadError::Store(e.to_string()))?
                        .ok_or_else(|| ReadError::NotFound(to_hex(&address)))?;
                    codec::open(&bytes, &address, &keying, max_body)
                        .map_err(|e| ReadError::corrupted(&address, e))
                }),
            )
            .await?;

        if chunk.kind() != expected {
            return Err(ReadError::malformed(&address, "unexpected chunk kind"));
        }
        Ok(chunk)
    }
}
