//! Key derivation and chunk encryption.
//!
//! All keys derive from user-supplied secrets through a single pinned KDF:
//! HKDF-SHA-256 with a fixed salt, the secret as input key material and a
//! context string as info. Chunks are sealed with AES-256-GCM; the nonce is
//! the first 12 bytes of the plaintext hash, so encryption is a pure
//! function of (plaintext, key source) and identical plaintexts dedup.
//!
//! Derivations:
//! - repository secret `R' = KDF(R, "repo")`
//! - per-chunk key `k_c = KDF(R', plaintext_hash)`
//! - intro key `k_i = KDF(U, "intro")`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::types::Address;

/// 32-byte symmetric key.
pub type Key = [u8; 32];

/// Nonce size for AES-GCM (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Auth tag size for AES-GCM.
pub const TAG_SIZE: usize = 16;

const KDF_SALT: &[u8] = b"blocktree.kdf.v1";

const REPO_CONTEXT: &[u8] = b"repo";
const INTRO_CONTEXT: &[u8] = b"intro";

/// Crypto error
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Compute SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// The pinned KDF: `KDF(secret, context) -> key`.
pub fn kdf(secret: &[u8], context: &[u8]) -> Result<Key, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret);
    let mut key = [0u8; 32];
    hk.expand(context, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

/// Derive the repository secret `R'` embedded in the intro chunk.
pub fn derive_repo_secret(repo_key: &[u8]) -> Result<Key, CryptoError> {
    kdf(repo_key, REPO_CONTEXT)
}

/// Derive the key for one non-intro chunk from `R'` and its plaintext hash.
pub fn chunk_key(repo_secret: &Key, plaintext_hash: &Address) -> Result<Key, CryptoError> {
    kdf(repo_secret, plaintext_hash)
}

/// Derive the intro-chunk key from the unlock key.
pub fn intro_key(unlock_key: &[u8]) -> Result<Key, CryptoError> {
    kdf(unlock_key, INTRO_CONTEXT)
}

/// Key source for the chunk codec.
///
/// Non-intro chunks key off the repository secret and their own plaintext
/// hash; the intro chunk uses the fixed unlock-derived key.
#[derive(Clone)]
pub enum Keying {
    Repo(Key),
    Intro(Key),
}

impl Keying {
    pub fn for_repo_secret(repo_secret: Key) -> Keying {
        Keying::Repo(repo_secret)
    }

    pub fn for_unlock_key(unlock_key: &[u8]) -> Result<Keying, CryptoError> {
        Ok(Keying::Intro(intro_key(unlock_key)?))
    }

    /// Resolve the AEAD key for an envelope with the given plaintext hash.
    pub fn key_for(&self, plaintext_hash: &Address) -> Result<Key, CryptoError> {
        match self {
            Keying::Repo(repo_secret) => chunk_key(repo_secret, plaintext_hash),
            Keying::Intro(key) => Ok(*key),
        }
    }
}

fn nonce_from_hash(plaintext_hash: &Address) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&plaintext_hash[..NONCE_SIZE]);
    nonce
}

/// Encrypt an envelope plaintext under `key` with the content-derived nonce.
pub fn encrypt(key: &Key, plaintext_hash: &Address, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let nonce = nonce_from_hash(plaintext_hash);
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decrypt a chunk ciphertext; any modification fails the auth tag.
pub fn decrypt(key: &Key, plaintext_hash: &Address, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed("ciphertext too short".to_string()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    let nonce = nonce_from_hash(plaintext_hash);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
