//! Core types: addresses, child references, chunk envelopes and tree geometry.

/// 32-byte SHA-256 digest used as a chunk address.
pub type Address = [u8; 32];

/// Convert an address to lowercase hex (the on-store filename).
pub fn to_hex(address: &Address) -> String {
    hex::encode(address)
}

/// Parse a 64-character hex string into an address.
pub fn from_hex(hex_str: &str) -> Result<Address, hex::FromHexError> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut address = [0u8; 32];
    address.copy_from_slice(&bytes);
    Ok(address)
}

/// Encoded size of one child reference: a tag byte plus a 32-byte value.
pub const CHILD_REF_SIZE: usize = 33;

const TAG_ZERO: u8 = 0x00;
const TAG_CHUNK: u8 = 0x01;

/// A reference from an interior chunk to one child subtree.
///
/// `Zero` stands for an unmaterialized all-zero subtree spanning the
/// child's full range; `Chunk` points at a stored chunk by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRef {
    Zero,
    Chunk(Address),
}

impl ChildRef {
    pub fn encode(&self) -> [u8; CHILD_REF_SIZE] {
        let mut out = [0u8; CHILD_REF_SIZE];
        if let ChildRef::Chunk(address) = self {
            out[0] = TAG_CHUNK;
            out[1..].copy_from_slice(address);
        }
        out
    }

    /// Decode a 33-byte reference. A zero tag must carry an all-zero value.
    pub fn decode(bytes: &[u8]) -> Option<ChildRef> {
        if bytes.len() != CHILD_REF_SIZE {
            return None;
        }
        match bytes[0] {
            TAG_ZERO => {
                if bytes[1..].iter().all(|b| *b == 0) {
                    Some(ChildRef::Zero)
                } else {
                    None
                }
            }
            TAG_CHUNK => {
                let mut address = [0u8; 32];
                address.copy_from_slice(&bytes[1..]);
                Some(ChildRef::Chunk(address))
            }
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, ChildRef::Zero)
    }
}

/// Kind of a chunk envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Leaf,
    Interior,
    Intro,
}

impl ChunkKind {
    pub fn to_bits(self) -> u8 {
        match self {
            ChunkKind::Leaf => 0,
            ChunkKind::Interior => 1,
            ChunkKind::Intro => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Option<ChunkKind> {
        match bits {
            0 => Some(ChunkKind::Leaf),
            1 => Some(ChunkKind::Interior),
            2 => Some(ChunkKind::Intro),
            _ => None,
        }
    }
}

/// A decrypted, decoded chunk envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Leaf(Vec<u8>),
    Interior(Vec<ChildRef>),
    Intro(IntroRecord),
}

impl Chunk {
    pub fn kind(&self) -> ChunkKind {
        match self {
            Chunk::Leaf(_) => ChunkKind::Leaf,
            Chunk::Interior(_) => ChunkKind::Interior,
            Chunk::Intro(_) => ChunkKind::Intro,
        }
    }
}

/// Serialized size of the intro record.
pub const INTRO_RECORD_LEN: usize = 92;

/// Intro flag: the import ran with compression enabled.
pub const INTRO_FLAG_COMPRESSED: u32 = 1;

/// Metadata record carried by the intro chunk.
///
/// Fixed-width little-endian fields; parsing requires the exact length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroRecord {
    pub total_size: u64,
    pub chunk_size_log2: u32,
    pub block_size: u32,
    pub layers: u32,
    pub fan_out: u32,
    pub repo_secret: [u8; 32],
    pub top_address: Address,
    pub flags: u32,
}

impl IntroRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INTRO_RECORD_LEN);
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.chunk_size_log2.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.layers.to_le_bytes());
        out.extend_from_slice(&self.fan_out.to_le_bytes());
        out.extend_from_slice(&self.repo_secret);
        out.extend_from_slice(&self.top_address);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<IntroRecord> {
        if bytes.len() != INTRO_RECORD_LEN {
            return None;
        }
        let u32_at = |off: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[off..off + 4]);
            u32::from_le_bytes(raw)
        };
        let mut total_size = [0u8; 8];
        total_size.copy_from_slice(&bytes[0..8]);
        let mut repo_secret = [0u8; 32];
        repo_secret.copy_from_slice(&bytes[24..56]);
        let mut top_address = [0u8; 32];
        top_address.copy_from_slice(&bytes[56..88]);
        Some(IntroRecord {
            total_size: u64::from_le_bytes(total_size),
            chunk_size_log2: u32_at(8),
            block_size: u32_at(12),
            layers: u32_at(16),
            fan_out: u32_at(20),
            repo_secret,
            top_address,
            flags: u32_at(88),
        })
    }
}

/// Smallest supported chunk-size exponent (fan-out of at least two).
pub const MIN_CHUNK_SIZE_LOG2: u32 = 7;

/// Largest supported chunk-size exponent (1 GiB leaves).
pub const MAX_CHUNK_SIZE_LOG2: u32 = 30;

/// Tree geometry derived from the chunk-size exponent.
///
/// Layer 0 chunks (leaves) span `2^chunk_size_log2` bytes; a layer-`k`
/// chunk spans `leaf_span * fan_out^k` bytes. Spans are computed in u128
/// and saturate, which keeps comparisons against u64 offsets exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    chunk_size_log2: u32,
    fan_out: u32,
}

impl Layout {
    pub fn new(chunk_size_log2: u32) -> Option<Layout> {
        if !(MIN_CHUNK_SIZE_LOG2..=MAX_CHUNK_SIZE_LOG2).contains(&chunk_size_log2) {
            return None;
        }
        Some(Layout {
            chunk_size_log2,
            fan_out: Self::fan_out_for(chunk_size_log2),
        })
    }

    /// Child references a full interior chunk holds.
    pub fn fan_out_for(chunk_size_log2: u32) -> u32 {
        ((1u64 << chunk_size_log2) / CHILD_REF_SIZE as u64) as u32
    }

    pub fn chunk_size_log2(&self) -> u32 {
        self.chunk_size_log2
    }

    pub fn fan_out(&self) -> u32 {
        self.fan_out
    }

    /// Bytes of user data in a full leaf.
    pub fn leaf_span(&self) -> usize {
        1usize << self.chunk_size_log2
    }

    /// Logical bytes covered by one chunk at `layer`.
    pub fn span(&self, layer: u32) -> u128 {
        let mut span = 1u128 << self.chunk_size_log2;
        for _ in 0..layer {
            span = span.saturating_mul(self.fan_out as u128);
        }
        span
    }

    /// Smallest layer count whose top span covers `total_size`.
    pub fn layers_for(&self, total_size: u64) -> u32 {
        let mut layer = 0;
        while self.span(layer) < total_size as u128 {
            layer += 1;
        }
        layer
    }
}
