//! Chunk envelope codec.
//!
//! Write path: optionally zlib-compress the body (keeping the shorter of
//! compressed and raw), prepend the 4-byte envelope header, hash, encrypt
//! under the content-derived key, and address the result by the SHA-256 of
//! the stored bytes.
//!
//! Stored chunk layout: `plaintext_hash (32) || AES-256-GCM ciphertext`.
//! The clear plaintext hash is what lets a repository-secret holder
//! re-derive the per-chunk key (and nonce) on read.
//!
//! Read path inverts the steps, verifying the address before decryption and
//! the envelope structure after it.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::crypto::{self, CryptoError, Keying, TAG_SIZE};
use crate::types::{
    to_hex, Address, ChildRef, Chunk, ChunkKind, IntroRecord, CHILD_REF_SIZE, INTRO_RECORD_LEN,
};

/// Envelope format version; bump on any change to the derivation scheme,
/// cipher or layout.
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 4;
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const KIND_SHIFT: u8 = 1;
const KIND_MASK: u8 = 0b0000_0110;

/// Minimum size of a stored chunk: clear hash, header, auth tag.
pub const MIN_CHUNK_LEN: usize = 32 + HEADER_LEN + TAG_SIZE;

/// Codec error
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("stored bytes do not hash to address {0}")]
    AddressMismatch(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed envelope: {0}")]
    Envelope(&'static str),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("chunk body exceeds maximum size")]
    BodyTooLarge,
}

/// A sealed chunk ready for the blob store.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub address: Address,
    pub bytes: Vec<u8>,
}

/// Seal an envelope body into a stored chunk.
pub fn seal(
    kind: ChunkKind,
    body: &[u8],
    keying: &Keying,
    compress: bool,
) -> Result<Sealed, CodecError> {
    let (encoded_body, compressed) = if compress {
        let deflated = deflate(body)?;
        if deflated.len() < body.len() {
            (deflated, true)
        } else {
            (body.to_vec(), false)
        }
    } else {
        (body.to_vec(), false)
    };

    let mut flags = kind.to_bits() << KIND_SHIFT;
    if compressed {
        flags |= FLAG_COMPRESSED;
    }

    let mut plaintext = Vec::with_capacity(HEADER_LEN + encoded_body.len());
    plaintext.push(ENVELOPE_VERSION);
    plaintext.push(flags);
    plaintext.extend_from_slice(&[0u8, 0u8]);
    plaintext.extend_from_slice(&encoded_body);

    let plaintext_hash = crypto::sha256(&plaintext);
    let key = keying.key_for(&plaintext_hash)?;
    let ciphertext = crypto::encrypt(&key, &plaintext_hash, &plaintext)?;

    let mut bytes = Vec::with_capacity(32 + ciphertext.len());
    bytes.extend_from_slice(&plaintext_hash);
    bytes.extend_from_slice(&ciphertext);

    Ok(Sealed {
        address: crypto::sha256(&bytes),
        bytes,
    })
}

/// Open a stored chunk fetched for `address`.
///
/// `max_body` bounds the decoded body (a decompression guard); pass the
/// leaf span for tree chunks or [`INTRO_RECORD_LEN`] for the intro.
pub fn open(
    bytes: &[u8],
    address: &Address,
    keying: &Keying,
    max_body: usize,
) -> Result<Chunk, CodecError> {
    if bytes.len() < MIN_CHUNK_LEN {
        return Err(CodecError::Envelope("stored chunk too short"));
    }
    if crypto::sha256(bytes) != *address {
        return Err(CodecError::AddressMismatch(to_hex(address)));
    }

    let mut plaintext_hash = [0u8; 32];
    plaintext_hash.copy_from_slice(&bytes[..32]);
    let key = keying.key_for(&plaintext_hash)?;
    let plaintext = crypto::decrypt(&key, &plaintext_hash, &bytes[32..])?;

    if plaintext.len() < HEADER_LEN {
        return Err(CodecError::Envelope("missing header"));
    }
    let version = plaintext[0];
    if version != ENVELOPE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = plaintext[1];
    let kind = ChunkKind::from_bits((flags & KIND_MASK) >> KIND_SHIFT)
        .ok_or(CodecError::Envelope("unknown chunk kind"))?;
    let compressed = flags & FLAG_COMPRESSED != 0;

    let body = if compressed {
        inflate(&plaintext[HEADER_LEN..], max_body)?
    } else {
        let body = plaintext[HEADER_LEN..].to_vec();
        if body.len() > max_body {
            return Err(CodecError::BodyTooLarge);
        }
        body
    };

    decode_body(kind, body)
}

fn decode_body(kind: ChunkKind, body: Vec<u8>) -> Result<Chunk, CodecError> {
    match kind {
        ChunkKind::Leaf => Ok(Chunk::Leaf(body)),
        ChunkKind::Interior => {
            if body.is_empty() || body.len() % CHILD_REF_SIZE != 0 {
                return Err(CodecError::Envelope("interior body not a whole ref count"));
            }
            let mut children = Vec::with_capacity(body.len() / CHILD_REF_SIZE);
            for raw in body.chunks(CHILD_REF_SIZE) {
                children
                    .push(ChildRef::decode(raw).ok_or(CodecError::Envelope("bad child reference"))?);
            }
            Ok(Chunk::Interior(children))
        }
        ChunkKind::Intro => {
            let record = IntroRecord::decode(&body)
                .ok_or(CodecError::Envelope("intro record has wrong length"))?;
            Ok(Chunk::Intro(record))
        }
    }
}

/// Encode an interior chunk body from its child references.
pub fn encode_children(children: &[ChildRef]) -> Vec<u8> {
    let mut body = Vec::with_capacity(children.len() * CHILD_REF_SIZE);
    for child in children {
        body.extend_from_slice(&child.encode());
    }
    body
}

fn deflate(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(body)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.to_string()))
}

fn inflate(body: &[u8], max_body: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(body).take(max_body as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if out.len() > max_body {
        return Err(CodecError::BodyTooLarge);
    }
    Ok(out)
}
