//! Streaming tree writer.
//!
//! Consumes data bytes and zero runs, packs leaves, builds interior chunks
//! of fixed fan-out and finishes with the intro chunk. Buffers are flushed
//! lazily (a full layer is sealed only when the next child arrives), so a
//! stream ending exactly on a layer boundary keeps that layer as the top.
//!
//! Zero handling: a zero run is skipped by reference one aligned
//! whole-layer span at a time, always taking the largest span that fits —
//! except a run that would exactly span a layer from its parent boundary,
//! which descends one layer so the finished tree never gains a layer that
//! `total_size` does not require. A full leaf of zero bytes and any
//! interior holding only zero references are never persisted mid-tree;
//! their parent slot takes the zero reference instead. Short trailing zero
//! leaves are stored as bytes, and the top chunk is always persisted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::codec::{self, CodecError, Sealed};
use crate::crypto::{self, CryptoError, Keying};
use crate::store::BlobStore;
use crate::types::{Address, ChildRef, ChunkKind, IntroRecord, Layout, INTRO_FLAG_COMPRESSED};

/// Writer error type
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("store error: {0}")]
    Store(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

/// Import-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Leaf span exponent; leaves hold `2^chunk_size_log2` bytes.
    pub chunk_size_log2: u32,
    /// Block size advertised to the block layer, recorded in the intro.
    pub block_size: u32,
    /// Whether chunk bodies may be zlib-compressed.
    pub compress: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            chunk_size_log2: 18,
            block_size: 4096,
            compress: true,
        }
    }
}

/// Per-import persistence statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub unique_chunks: u64,
    pub unique_bytes: u64,
    pub reused_chunks: u64,
    pub reused_bytes: u64,
}

/// Result of a finished import.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub intro_address: Address,
    pub total_size: u64,
    pub layers: u32,
    pub stats: ImportStats,
}

/// Streaming writer building a chunk tree into a blob store.
pub struct TreeWriter<S: BlobStore> {
    store: Arc<S>,
    layout: Layout,
    config: WriterConfig,
    repo_secret: crypto::Key,
    repo_keying: Keying,
    intro_keying: Keying,
    /// Layer-0 buffer.
    leaf: Vec<u8>,
    /// Interior builders; `interiors[i]` collects children for layer `i+1`.
    interiors: Vec<Vec<ChildRef>>,
    /// Logical bytes consumed so far.
    offset: u64,
    stats: ImportStats,
}

impl<S: BlobStore> TreeWriter<S> {
    pub fn new(
        store: Arc<S>,
        config: WriterConfig,
        repo_key: &[u8],
        unlock_key: &[u8],
    ) -> Result<Self, WriteError> {
        let layout = Layout::new(config.chunk_size_log2)
            .ok_or(WriteError::Config("chunk size exponent out of range"))?;
        if !config.block_size.is_power_of_two() || !(512..=65536).contains(&config.block_size) {
            return Err(WriteError::Config("block size must be a power of two in 512..=65536"));
        }
        if repo_key.is_empty() {
            return Err(WriteError::Config("repository key must not be empty"));
        }
        if unlock_key.is_empty() {
            return Err(WriteError::Config("unlock key must not be empty"));
        }

        let repo_secret = crypto::derive_repo_secret(repo_key)?;
        Ok(TreeWriter {
            store,
            layout,
            config,
            repo_secret,
            repo_keying: Keying::for_repo_secret(repo_secret),
            intro_keying: Keying::for_unlock_key(unlock_key)?,
            leaf: Vec::with_capacity(1 << config.chunk_size_log2),
            interiors: Vec::new(),
            offset: 0,
            stats: ImportStats::default(),
        })
    }

    /// Logical bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Append data bytes at the current logical offset.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), WriteError> {
        let leaf_span = self.layout.leaf_span();
        while !data.is_empty() {
            if self.leaf.len() == leaf_span {
                self.flush_leaf().await?;
            }
            let take = (leaf_span - self.leaf.len()).min(data.len());
            self.leaf.extend_from_slice(&data[..take]);
            self.offset += take as u64;
            data = &data[take..];
        }
        Ok(())
    }

    /// Advance the logical offset over `remaining` zero bytes without
    /// materializing them where alignment allows.
    pub async fn write_zeros(&mut self, mut remaining: u64) -> Result<(), WriteError> {
        let leaf_span = self.layout.leaf_span();
        while remaining > 0 {
            if !self.leaf.is_empty() {
                if self.leaf.len() == leaf_span {
                    self.flush_leaf().await?;
                    continue;
                }
                let take = ((leaf_span - self.leaf.len()) as u64).min(remaining) as usize;
                self.leaf.resize(self.leaf.len() + take, 0);
                self.offset += take as u64;
                remaining -= take as u64;
                continue;
            }

            // Leaf buffer empty: the offset is leaf-aligned.
            match self.zero_step_layer(remaining) {
                Some(layer) => {
                    let span = self.layout.span(layer) as u64;
                    self.flush_full_layers_upto(layer).await?;
                    self.push_ref(layer as usize + 1, ChildRef::Zero).await?;
                    self.offset += span;
                    remaining -= span;
                }
                None => {
                    let take = (leaf_span as u64).min(remaining) as usize;
                    self.leaf.resize(take, 0);
                    self.offset += take as u64;
                    remaining -= take as u64;
                }
            }
        }
        Ok(())
    }

    /// Largest layer whose whole span can be skipped by reference at the
    /// current offset, or `None` when the run must go through the leaf
    /// buffer.
    fn zero_step_layer(&self, remaining: u64) -> Option<u32> {
        let mut best = None;
        let mut layer = 0u32;
        loop {
            let span = self.layout.span(layer);
            if span > remaining as u128 || (self.offset as u128) % span != 0 {
                break;
            }
            let parent_span = self.layout.span(layer + 1);
            let exact_from_parent_boundary =
                (self.offset as u128) % parent_span == 0 && span == remaining as u128;
            if !exact_from_parent_boundary {
                best = Some(layer);
            }
            layer += 1;
        }
        best
    }

    /// Seal the leaf buffer and hand its reference to layer 1.
    async fn flush_leaf(&mut self) -> Result<(), WriteError> {
        let body = std::mem::take(&mut self.leaf);
        let full = body.len() == self.layout.leaf_span();
        let child = if full && body.iter().all(|b| *b == 0) {
            ChildRef::Zero
        } else {
            let sealed = codec::seal(ChunkKind::Leaf, &body, &self.repo_keying, self.config.compress)?;
            let address = sealed.address;
            self.persist(sealed).await?;
            ChildRef::Chunk(address)
        };
        self.leaf = Vec::with_capacity(self.layout.leaf_span());
        self.push_ref(1, child).await
    }

    /// Seal the builder for `layer` and hand its reference to `layer + 1`.
    fn flush_interior<'a>(
        &'a mut self,
        layer: usize,
    ) -> Pin<Box<dyn Future<Output = Result<(), WriteError>> + Send + 'a>> {
        Box::pin(async move {
            let children = std::mem::take(&mut self.interiors[layer - 1]);
            let child = if !children.is_empty() && children.iter().all(|c| c.is_zero()) {
                ChildRef::Zero
            } else {
                let body = codec::encode_children(&children);
                let sealed =
                    codec::seal(ChunkKind::Interior, &body, &self.repo_keying, self.config.compress)?;
                let address = sealed.address;
                self.persist(sealed).await?;
                ChildRef::Chunk(address)
            };
            self.push_ref(layer + 1, child).await
        })
    }

    /// Append a child reference to `layer`, sealing a full builder first.
    async fn push_ref(&mut self, layer: usize, child: ChildRef) -> Result<(), WriteError> {
        while self.interiors.len() < layer {
            self.interiors.push(Vec::new());
        }
        if self.interiors[layer - 1].len() == self.layout.fan_out() as usize {
            self.flush_interior(layer).await?;
        }
        self.interiors[layer - 1].push(child);
        Ok(())
    }

    /// Seal any full builders at layers `1..=upto` so their references land
    /// ahead of a zero reference about to be placed above them.
    async fn flush_full_layers_upto(&mut self, upto: u32) -> Result<(), WriteError> {
        for layer in 1..=upto as usize {
            if self.interiors.len() >= layer
                && self.interiors[layer - 1].len() == self.layout.fan_out() as usize
            {
                self.flush_interior(layer).await?;
            }
        }
        Ok(())
    }

    /// Close the stream: seal pending layers bottom-up, persist the top
    /// chunk and the intro chunk, and report the import outcome.
    pub async fn finish(mut self) -> Result<ImportOutcome, WriteError> {
        let total_size = self.offset;

        let (top_address, layers) = if self.interiors.is_empty() {
            // Single-leaf tree; the leaf itself is the top chunk.
            let body = std::mem::take(&mut self.leaf);
            let sealed =
                codec::seal(ChunkKind::Leaf, &body, &self.repo_keying, self.config.compress)?;
            let address = sealed.address;
            self.persist(sealed).await?;
            (address, 0u32)
        } else {
            if !self.leaf.is_empty() {
                self.flush_leaf().await?;
            }
            let mut layer = 1usize;
            loop {
                if self.interiors[layer - 1].is_empty() {
                    layer += 1;
                    continue;
                }
                if layer == self.interiors.len() {
                    let children = std::mem::take(&mut self.interiors[layer - 1]);
                    let body = codec::encode_children(&children);
                    let sealed = codec::seal(
                        ChunkKind::Interior,
                        &body,
                        &self.repo_keying,
                        self.config.compress,
                    )?;
                    let address = sealed.address;
                    self.persist(sealed).await?;
                    break (address, layer as u32);
                }
                self.flush_interior(layer).await?;
                layer += 1;
            }
        };

        let record = IntroRecord {
            total_size,
            chunk_size_log2: self.layout.chunk_size_log2(),
            block_size: self.config.block_size,
            layers,
            fan_out: self.layout.fan_out(),
            repo_secret: self.repo_secret,
            top_address,
            flags: if self.config.compress { INTRO_FLAG_COMPRESSED } else { 0 },
        };
        let sealed = codec::seal(ChunkKind::Intro, &record.encode(), &self.intro_keying, false)?;
        let intro_address = sealed.address;
        self.persist(sealed).await?;

        debug!(
            total_size,
            layers,
            unique_chunks = self.stats.unique_chunks,
            reused_chunks = self.stats.reused_chunks,
            "import finished"
        );

        Ok(ImportOutcome {
            intro_address,
            total_size,
            layers,
            stats: self.stats,
        })
    }

    async fn persist(&mut self, sealed: Sealed) -> Result<(), WriteError> {
        let size = sealed.bytes.len() as u64;
        let newly_stored = self
            .store
            .put(sealed.address, sealed.bytes)
            .await
            .map_err(|e| WriteError::Store(e.to_string()))?;
        if newly_stored {
            self.stats.unique_chunks += 1;
            self.stats.unique_bytes += size;
        } else {
            self.stats.reused_chunks += 1;
            self.stats.reused_bytes += size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> WriterConfig {
        WriterConfig {
            chunk_size_log2: 8, // 256-byte leaves, fan-out 7
            block_size: 512,
            compress: true,
        }
    }

    fn writer(store: &Arc<MemoryStore>) -> TreeWriter<MemoryStore> {
        TreeWriter::new(store.clone(), config(), b"repo key", b"unlock key").unwrap()
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        let store = Arc::new(MemoryStore::new());
        let bad_chunk = WriterConfig { chunk_size_log2: 3, ..config() };
        assert!(TreeWriter::new(store.clone(), bad_chunk, b"r", b"u").is_err());

        let bad_block = WriterConfig { block_size: 1000, ..config() };
        assert!(TreeWriter::new(store.clone(), bad_block, b"r", b"u").is_err());

        assert!(TreeWriter::new(store.clone(), config(), b"", b"u").is_err());
        assert!(TreeWriter::new(store, config(), b"r", b"").is_err());
    }

    #[tokio::test]
    async fn test_single_leaf_input_is_top() {
        let store = Arc::new(MemoryStore::new());
        let mut w = writer(&store);
        w.write(&[0xaa; 256]).await.unwrap();
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.layers, 0);
        assert_eq!(outcome.total_size, 256);
        // Leaf + intro.
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_two_leaves_build_one_interior() {
        let store = Arc::new(MemoryStore::new());
        let mut w = writer(&store);
        w.write(&[0x41; 256]).await.unwrap();
        w.write(&[0x42; 256]).await.unwrap();
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.layers, 1);
        // Two leaves, one interior, intro.
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_aligned_zero_leaves_are_pruned() {
        let store = Arc::new(MemoryStore::new());
        let mut w = writer(&store);
        w.write_zeros(4 * 256).await.unwrap();
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.layers, 1);
        assert_eq!(outcome.total_size, 4 * 256);
        // Top interior of four zero references + intro; no leaves.
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_whole_layer_zero_input_keeps_minimal_layers() {
        let store = Arc::new(MemoryStore::new());
        let mut w = writer(&store);
        // Exactly one full layer-1 span of zeros.
        w.write_zeros(7 * 256).await.unwrap();
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.layers, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_literal_zero_leaf_collapses_like_a_skipped_one() {
        let store_a = Arc::new(MemoryStore::new());
        let mut a = writer(&store_a);
        a.write_zeros(256).await.unwrap();
        a.write(&[0x42; 256]).await.unwrap();
        let outcome_a = a.finish().await.unwrap();

        let store_b = Arc::new(MemoryStore::new());
        let mut b = writer(&store_b);
        // The same logical content delivered as explicit zero bytes.
        b.write(&[0x00; 256]).await.unwrap();
        b.write(&[0x42; 256]).await.unwrap();
        let outcome_b = b.finish().await.unwrap();

        assert_eq!(outcome_a.intro_address, outcome_b.intro_address);
        assert_eq!(store_a.len(), store_b.len());
        // Leaf B, interior [zero, ref], intro.
        assert_eq!(store_a.len(), 3);
    }

    #[tokio::test]
    async fn test_trailing_partial_zero_leaf_is_materialized() {
        let store = Arc::new(MemoryStore::new());
        let mut w = writer(&store);
        w.write(&[0x41; 256]).await.unwrap();
        w.write_zeros(100).await.unwrap();
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.total_size, 356);
        // Leaf A, short zero leaf, interior, intro: the partial tail is
        // stored as bytes, not skipped.
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_reimport_reuses_everything() {
        let store = Arc::new(MemoryStore::new());
        let data: Vec<u8> = (0..700usize).map(|i| (i % 251) as u8).collect();

        let mut first = writer(&store);
        first.write(&data).await.unwrap();
        let one = first.finish().await.unwrap();
        assert_eq!(one.stats.reused_chunks, 0);

        let mut second = writer(&store);
        second.write(&data).await.unwrap();
        let two = second.finish().await.unwrap();

        assert_eq!(one.intro_address, two.intro_address);
        assert_eq!(two.stats.unique_bytes, 0);
        assert_eq!(two.stats.unique_chunks, 0);
        assert!(two.stats.reused_chunks > 0);
    }

    #[tokio::test]
    async fn test_empty_input_persists_empty_leaf_and_intro() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(&store);
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.total_size, 0);
        assert_eq!(outcome.layers, 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_mid_stream_zero_run_lands_before_following_data() {
        let store = Arc::new(MemoryStore::new());
        let mut w = writer(&store);
        // Fill layer 1 completely, skip a full layer-1 span, then add data.
        w.write(&vec![0x33u8; 7 * 256]).await.unwrap();
        w.write_zeros(7 * 256).await.unwrap();
        w.write(&[0x44; 256]).await.unwrap();
        let outcome = w.finish().await.unwrap();

        assert_eq!(outcome.layers, 2);
        assert_eq!(outcome.total_size, 15 * 256);
    }
}
