//! blocktree-core - chunk-tree engine for encrypted block-device images
//!
//! A byte device is serialized into a tree of immutable chunks: fixed-span
//! leaves at layer 0, interior chunks of fixed fan-out above them, and one
//! intro chunk carrying the tree metadata. Every chunk is compressed,
//! encrypted under a content-derived key and stored under the SHA-256 of
//! its ciphertext, so identical content dedups and any holder of the blob
//! set learns nothing without the keys. All-zero subtrees are pruned to a
//! 33-byte zero reference and never stored.
//!
//! # Overview
//!
//! - [`writer::TreeWriter`] streams bytes and zero runs into a tree.
//! - [`reader::ChunkReader`] opens an intro address with the unlock key and
//!   serves `read_at(offset, length)`.
//! - [`store::BlobStore`] abstracts chunk persistence; [`cache`] keeps
//!   decrypted chunks resident with single-flight fetches.
//!
//! # Example
//!
//! ```rust
//! use blocktree_core::{MemoryStore, NullCache, TreeWriter, WriterConfig, ChunkReader};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let mut writer = TreeWriter::new(
//!         store.clone(),
//!         WriterConfig { chunk_size_log2: 8, block_size: 512, compress: true },
//!         b"repository key",
//!         b"unlock key",
//!     )?;
//!     writer.write(b"hello block device").await?;
//!     let outcome = writer.finish().await?;
//!
//!     let reader = ChunkReader::open(
//!         store,
//!         Arc::new(NullCache::new()),
//!         outcome.intro_address,
//!         b"unlock key",
//!     )
//!     .await?;
//!     assert_eq!(reader.read_at(0, 5).await?, b"hello");
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod crypto;
pub mod reader;
pub mod store;
pub mod types;
pub mod writer;

// Re-exports for convenience
pub use cache::{ChunkCache, FetchFuture, MemoryCache, NullCache};
pub use codec::{CodecError, Sealed, ENVELOPE_VERSION};
pub use crypto::{derive_repo_secret, intro_key, kdf, sha256, CryptoError, Key, Keying};
pub use reader::{ChunkReader, ReadError};
pub use store::{BlobStore, MemoryStore, StoreError};
pub use types::{
    from_hex, to_hex, Address, ChildRef, Chunk, ChunkKind, IntroRecord, Layout,
    CHILD_REF_SIZE, INTRO_RECORD_LEN,
};
pub use writer::{ImportOutcome, ImportStats, TreeWriter, WriteError, WriterConfig};
