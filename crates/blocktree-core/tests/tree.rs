//! End-to-end import/read properties over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use blocktree_core::{
    Address, BlobStore, ChunkReader, MemoryCache, MemoryStore, NullCache, ReadError, StoreError,
    TreeWriter, WriterConfig,
};

const REPO_KEY: &[u8] = b"integration repo key";
const UNLOCK_KEY: &[u8] = b"integration unlock key";

// 256-byte leaves, fan-out 7: multi-layer trees stay small.
const LEAF: usize = 256;

fn config() -> WriterConfig {
    WriterConfig {
        chunk_size_log2: 8,
        block_size: 512,
        compress: true,
    }
}

fn writer(store: &Arc<MemoryStore>) -> TreeWriter<MemoryStore> {
    TreeWriter::new(store.clone(), config(), REPO_KEY, UNLOCK_KEY).unwrap()
}

async fn import(store: &Arc<MemoryStore>, data: &[u8]) -> blocktree_core::ImportOutcome {
    let mut w = writer(store);
    w.write(data).await.unwrap();
    w.finish().await.unwrap()
}

async fn reader(store: &Arc<MemoryStore>, intro: Address) -> ChunkReader {
    ChunkReader::open(
        store.clone() as Arc<dyn BlobStore>,
        Arc::new(NullCache::new()),
        intro,
        UNLOCK_KEY,
    )
    .await
    .unwrap()
}

/// Deterministic non-repeating filler.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

#[tokio::test]
async fn test_every_stored_file_is_named_by_its_hash() {
    let store = Arc::new(MemoryStore::new());
    import(&store, &pattern(5 * LEAF + 17)).await;

    for address in store.addresses() {
        let bytes = store.get(&address).await.unwrap().unwrap();
        assert_eq!(blocktree_core::sha256(&bytes), address);
    }
}

#[tokio::test]
async fn test_full_roundtrip() {
    let store = Arc::new(MemoryStore::new());
    let data = pattern(3 * LEAF + 100);
    let outcome = import(&store, &data).await;

    let r = reader(&store, outcome.intro_address).await;
    assert_eq!(r.total_size(), data.len() as u64);
    assert_eq!(r.read_at(0, data.len()).await.unwrap(), data);
}

#[tokio::test]
async fn test_arbitrary_ranges_match_source() {
    let store = Arc::new(MemoryStore::new());
    // Deep enough for three layers: 7 * 7 = 49 leaves and change.
    let data = pattern(50 * LEAF + 33);
    let outcome = import(&store, &data).await;
    let r = reader(&store, outcome.intro_address).await;

    let cases = [
        (0u64, 1usize),
        (0, LEAF),
        (1, LEAF),
        (LEAF as u64 - 1, 2),
        (LEAF as u64 * 7 - 1, LEAF * 2),
        (data.len() as u64 - 1, 1),
        (data.len() as u64 - 300, 300),
        (12345, 4096),
        (0, data.len()),
    ];
    for (offset, length) in cases {
        let got = r.read_at(offset, length).await.unwrap();
        assert_eq!(
            got,
            &data[offset as usize..offset as usize + length],
            "range ({}, {})",
            offset,
            length
        );
    }
}

#[tokio::test]
async fn test_reads_past_total_size_rejected() {
    let store = Arc::new(MemoryStore::new());
    let outcome = import(&store, &pattern(100)).await;
    let r = reader(&store, outcome.intro_address).await;

    assert!(matches!(
        r.read_at(0, 101).await,
        Err(ReadError::OutOfRange { .. })
    ));
    assert!(matches!(
        r.read_at(101, 0).await,
        Err(ReadError::OutOfRange { .. })
    ));
    assert!(matches!(
        r.read_at(u64::MAX, 1).await,
        Err(ReadError::OutOfRange { .. })
    ));
    // Zero-length read at the boundary is fine.
    assert_eq!(r.read_at(100, 0).await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_import_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let data = pattern(9 * LEAF);

    let one = import(&store, &data).await;
    let files_after_first = store.len();
    let two = import(&store, &data).await;

    assert_eq!(one.intro_address, two.intro_address);
    assert_eq!(store.len(), files_after_first);
    assert_eq!(two.stats.unique_bytes, 0);
    assert_eq!(two.stats.unique_chunks, 0);
}

#[tokio::test]
async fn test_shared_blocks_dedup_across_images() {
    let store = Arc::new(MemoryStore::new());

    let shared = pattern(2 * LEAF);
    let mut first = shared.clone();
    first.extend_from_slice(&[0x55; LEAF]);
    let mut second = shared.clone();
    second.extend_from_slice(&[0x66; LEAF]);

    import(&store, &first).await;
    let after_first = store.len();
    import(&store, &second).await;

    // Only the differing leaf, a new interior and a new intro appear.
    assert_eq!(store.len(), after_first + 3);
}

#[tokio::test]
async fn test_all_zero_image_stores_top_and_intro_only() {
    let store = Arc::new(MemoryStore::new());
    let total = 16 * LEAF as u64;

    let mut w = writer(&store);
    w.write_zeros(total).await.unwrap();
    let outcome = w.finish().await.unwrap();

    assert_eq!(store.len(), 2);

    let r = reader(&store, outcome.intro_address).await;
    assert_eq!(r.total_size(), total);
    let bytes = r.read_at(0, total as usize).await.unwrap();
    assert_eq!(bytes, vec![0u8; total as usize]);
}

#[tokio::test]
async fn test_single_leaf_scenario() {
    let store = Arc::new(MemoryStore::new());
    let data = vec![0xaa; LEAF];
    let outcome = import(&store, &data).await;

    assert_eq!(outcome.layers, 0);
    assert_eq!(store.len(), 2);

    let r = reader(&store, outcome.intro_address).await;
    assert_eq!(r.read_at(0, LEAF).await.unwrap(), data);

    let again = import(&store, &data).await;
    assert_eq!(again.stats.unique_bytes, 0);
}

#[tokio::test]
async fn test_zeroed_first_leaf_shares_nothing_with_old_interior() {
    let store = Arc::new(MemoryStore::new());

    let mut ab = vec![0x41u8; LEAF];
    ab.extend_from_slice(&[0x42; LEAF]);
    import(&store, &ab).await;
    assert_eq!(store.len(), 4); // leaf A, leaf B, interior, intro

    let mut zb = vec![0x00u8; LEAF];
    zb.extend_from_slice(&[0x42; LEAF]);
    let outcome = import(&store, &zb).await;

    // Leaf B is reused; the new interior is [zero, B] and a new intro.
    assert_eq!(store.len(), 4 + 2);

    let r = reader(&store, outcome.intro_address).await;
    assert_eq!(r.read_at(0, 2 * LEAF).await.unwrap(), zb);
}

#[tokio::test]
async fn test_sparse_image_roundtrip_mixed_runs() {
    let store = Arc::new(MemoryStore::new());

    let mut w = writer(&store);
    let head = pattern(LEAF + 10);
    w.write(&head).await.unwrap();
    w.write_zeros(3 * LEAF as u64).await.unwrap();
    let tail = pattern(2 * LEAF);
    w.write(&tail).await.unwrap();
    let outcome = w.finish().await.unwrap();

    let mut expected = head.clone();
    expected.extend_from_slice(&vec![0u8; 3 * LEAF]);
    expected.extend_from_slice(&tail);

    let r = reader(&store, outcome.intro_address).await;
    assert_eq!(r.total_size(), expected.len() as u64);
    assert_eq!(r.read_at(0, expected.len()).await.unwrap(), expected);

    // Spot-check a range straddling the zero gap.
    let offset = LEAF - 5;
    let got = r.read_at(offset as u64, 3 * LEAF).await.unwrap();
    assert_eq!(got, &expected[offset..offset + 3 * LEAF]);
}

#[tokio::test]
async fn test_tampered_chunk_fails_reads_that_cover_it() {
    let store = Arc::new(MemoryStore::new());
    let data = vec![0xbb; LEAF];
    let outcome = import(&store, &data).await;

    // Corrupt the leaf (the non-intro chunk).
    let victim = store
        .addresses()
        .into_iter()
        .find(|a| *a != outcome.intro_address)
        .unwrap();
    assert!(store.tamper(&victim, |bytes| bytes[40] ^= 0x01));

    let r = reader(&store, outcome.intro_address).await;
    assert!(matches!(
        r.read_at(0, LEAF).await,
        Err(ReadError::Corrupted { .. })
    ));
    // A read that touches no chunk still succeeds.
    assert_eq!(r.read_at(0, 0).await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_wrong_unlock_key_rejected() {
    let store = Arc::new(MemoryStore::new());
    let outcome = import(&store, &pattern(64)).await;

    let result = ChunkReader::open(
        store.clone() as Arc<dyn BlobStore>,
        Arc::new(NullCache::new()),
        outcome.intro_address,
        b"not the unlock key",
    )
    .await;
    assert!(matches!(result, Err(ReadError::Corrupted { .. })));
}

#[tokio::test]
async fn test_wrong_repo_key_cannot_read_chunks() {
    let store = Arc::new(MemoryStore::new());
    let data = pattern(2 * LEAF);

    let mut w =
        TreeWriter::new(store.clone(), config(), b"first repo key", UNLOCK_KEY).unwrap();
    w.write(&data).await.unwrap();
    let first = w.finish().await.unwrap();

    // A second import under a different repository key shares nothing.
    let mut w =
        TreeWriter::new(store.clone(), config(), b"second repo key", UNLOCK_KEY).unwrap();
    w.write(&data).await.unwrap();
    let second = w.finish().await.unwrap();

    assert_ne!(first.intro_address, second.intro_address);
    assert_eq!(second.stats.reused_chunks, 0);
}

/// Store wrapper counting `get` calls.
struct CountingStore {
    inner: Arc<MemoryStore>,
    gets: AtomicUsize,
}

#[async_trait]
impl BlobStore for CountingStore {
    async fn put(&self, address: Address, bytes: Vec<u8>) -> Result<bool, StoreError> {
        self.inner.put(address, bytes).await
    }

    async fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(address).await
    }
}

#[tokio::test]
async fn test_concurrent_cold_reads_fetch_each_chunk_once() {
    let inner = Arc::new(MemoryStore::new());
    let data = vec![0xcd; LEAF]; // single leaf, L = 0
    let outcome = import(&inner, &data).await;

    let store = Arc::new(CountingStore {
        inner,
        gets: AtomicUsize::new(0),
    });
    let r = Arc::new(
        ChunkReader::open(
            store.clone() as Arc<dyn BlobStore>,
            Arc::new(MemoryCache::new(8)),
            outcome.intro_address,
            UNLOCK_KEY,
        )
        .await
        .unwrap(),
    );
    let after_open = store.gets.load(Ordering::SeqCst);

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let r = r.clone();
        tasks.push(tokio::spawn(async move { r.read_at(0, LEAF).await.unwrap() }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), data);
    }

    // All six readers were served by a single fetch of the one leaf.
    assert_eq!(store.gets.load(Ordering::SeqCst) - after_open, 1);
}
